//! Management event hub.
//!
//! Topics carry `\x1e`-prefixed JSON records (RS-delimited JSON sequences).
//! Each topic has at most one subscriber: a newcomer replaces the previous
//! one, and is told so with a `"replacing"` record. The `debug` topic
//! receives a copy of every event.

use std::sync::Mutex;

use serde_json::json;
use tokio::sync::mpsc;

use crate::peer::PeerRecord;

/// Record separator framing each event on the stream.
pub const RECORD_SEP: char = '\x1e';

const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTopic {
    Debug = 0,
    Peer = 1,
    Test = 2,
}

impl EventTopic {
    pub const ALL: [EventTopic; 3] = [EventTopic::Debug, EventTopic::Peer, EventTopic::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::Debug => "debug",
            EventTopic::Peer => "peer",
            EventTopic::Test => "test",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            EventTopic::Debug => "All events - for event debugging",
            EventTopic::Peer => "Changes to peer list",
            EventTopic::Test => "Used only by post.test",
        }
    }

    pub fn parse(s: &str) -> Option<EventTopic> {
        match s {
            "debug" => Some(EventTopic::Debug),
            "peer" => Some(EventTopic::Peer),
            "test" => Some(EventTopic::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    Join,
    Move,
    Leave,
}

impl PeerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerAction::Join => "join",
            PeerAction::Move => "move",
            PeerAction::Leave => "leave",
        }
    }
}

struct Slot {
    sender: mpsc::Sender<String>,
    /// Remote address of the subscriber, for `help.events`.
    peer: String,
}

#[derive(Default)]
pub struct EventHub {
    slots: [Mutex<Option<Slot>>; 3],
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    /// Install a subscriber for a topic, displacing any previous one. The
    /// new stream starts with a `"replacing"` record when it took the slot
    /// over.
    pub fn subscribe(&self, topic: EventTopic, peer: String) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let mut replaced = false;
        if let Ok(mut slot) = self.slots[topic as usize].lock() {
            replaced = slot.is_some();
            *slot = Some(Slot { sender: tx.clone(), peer });
        }
        if replaced {
            let _ = tx.try_send(format!("{RECORD_SEP}\"replacing\"\n"));
        }
        rx
    }

    /// Remote address of a topic's current subscriber, if any.
    pub fn subscriber(&self, topic: EventTopic) -> Option<String> {
        self.slots[topic as usize]
            .lock()
            .ok()?
            .as_ref()
            .map(|slot| slot.peer.clone())
    }

    pub fn post_peer(&self, action: PeerAction, peer: &PeerRecord) {
        let record = json!({
            "event": "peer",
            "action": action.as_str(),
            "macaddr": if peer.mac.is_null() { String::new() } else { peer.mac.to_string() },
            "sockaddr": peer.sock.addr.to_string(),
        });
        self.post(EventTopic::Peer, &record.to_string());
    }

    pub fn post_test(&self, params: &serde_json::Value) {
        let record = json!({
            "event": "test",
            "params": params,
        });
        self.post(EventTopic::Test, &record.to_string());
    }

    /// Deliver a record to the topic's subscriber and to the debug tap.
    /// Never blocks: a full or gone subscriber just misses the record.
    fn post(&self, topic: EventTopic, record: &str) {
        let framed = format!("{RECORD_SEP}{record}\n");
        self.send_to(topic, &framed);
        if topic != EventTopic::Debug {
            self.send_to(EventTopic::Debug, &framed);
        }
    }

    fn send_to(&self, topic: EventTopic, framed: &str) {
        let Ok(mut slot) = self.slots[topic as usize].lock() else {
            return;
        };
        let gone = match slot.as_ref() {
            Some(s) => matches!(
                s.sender.try_send(framed.to_string()),
                Err(mpsc::error::TrySendError::Closed(_))
            ),
            None => false,
        };
        if gone {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerSocket;
    use crate::wire::MacAddr;
    use std::net::SocketAddr;
    use std::time::Instant;

    fn peer() -> PeerRecord {
        PeerRecord::new(
            MacAddr([2, 0, 0, 0, 0, 1]),
            PeerSocket::udp(SocketAddr::from(([192, 0, 2, 10], 30000))),
            Instant::now(),
        )
    }

    #[test]
    fn peer_event_is_rs_framed_json() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe(EventTopic::Peer, "test".into());

        hub.post_peer(PeerAction::Join, &peer());
        let record = rx.try_recv().unwrap();
        assert!(record.starts_with('\x1e'));
        assert!(record.ends_with('\n'));

        let parsed: serde_json::Value =
            serde_json::from_str(record.trim_start_matches('\x1e').trim_end()).unwrap();
        assert_eq!(parsed["event"], "peer");
        assert_eq!(parsed["action"], "join");
        assert_eq!(parsed["macaddr"], "02:00:00:00:00:01");
        assert_eq!(parsed["sockaddr"], "192.0.2.10:30000");
    }

    #[test]
    fn second_subscriber_replaces_first() {
        let hub = EventHub::new();
        let mut first = hub.subscribe(EventTopic::Test, "one".into());
        let mut second = hub.subscribe(EventTopic::Test, "two".into());

        assert_eq!(second.try_recv().unwrap(), "\x1e\"replacing\"\n");

        hub.post_test(&serde_json::json!({"n": 1}));
        assert!(second.try_recv().is_ok());
        // First subscriber's channel no longer receives.
        assert!(first.try_recv().is_err());
        assert_eq!(hub.subscriber(EventTopic::Test).as_deref(), Some("two"));
    }

    #[test]
    fn debug_topic_receives_everything() {
        let hub = EventHub::new();
        let mut debug = hub.subscribe(EventTopic::Debug, "dbg".into());

        hub.post_peer(PeerAction::Leave, &peer());
        hub.post_test(&serde_json::json!("x"));

        assert!(debug.try_recv().unwrap().contains("\"peer\""));
        assert!(debug.try_recv().unwrap().contains("\"test\""));
    }

    #[test]
    fn posting_without_subscriber_is_a_no_op() {
        let hub = EventHub::new();
        hub.post_test(&serde_json::json!(null));
        assert!(hub.subscriber(EventTopic::Test).is_none());
    }
}
