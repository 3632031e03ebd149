//! Runtime state of one supernode instance.
//!
//! There is no process-wide singleton: the node handle is created in `main`
//! and passed explicitly to the engine, the transports and the management
//! API.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

use meshgate_core::community::CommunityRegistry;
use meshgate_core::config::SupernodeConfig;
use meshgate_core::crypto::{CryptoProvider, HeaderCipher};
use meshgate_core::events::EventHub;
use meshgate_core::peer::{PeerRecord, PeerSocket, Transport};
use meshgate_core::stats::{bump, EventTimestamps, PacketStats};
use meshgate_core::wire::{self, CommunityName, Frame, HeaderAuth, MacAddr};

use crate::transport::{PacketSink, SendTarget};

/// Minimum spacing of AUTH NAKs towards one source address.
const AUTH_NAK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Node {
    pub cfg: SupernodeConfig,
    pub mac: MacAddr,
    pub provider: Arc<dyn CryptoProvider>,
    pub registry: Arc<CommunityRegistry>,
    pub stats: Arc<PacketStats>,
    pub timestamps: Arc<EventTimestamps>,
    pub events: Arc<EventHub>,
    pub sink: Arc<dyn PacketSink>,
    pub shutdown: watch::Sender<bool>,
    nak_limiter: DashMap<IpAddr, Instant>,
}

impl Node {
    pub fn new(
        cfg: SupernodeConfig,
        mac: MacAddr,
        provider: Arc<dyn CryptoProvider>,
        registry: Arc<CommunityRegistry>,
        sink: Arc<dyn PacketSink>,
    ) -> (Arc<Node>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let node = Arc::new(Node {
            cfg,
            mac,
            provider,
            registry,
            stats: Arc::new(PacketStats::new()),
            timestamps: Arc::new(EventTimestamps::new()),
            events: Arc::new(EventHub::new()),
            sink,
            shutdown,
            nak_limiter: DashMap::new(),
        });
        (node, shutdown_rx)
    }

    pub fn federation(&self) -> CommunityName {
        self.registry.federation()
    }

    /// Encode and emit one frame. Send failures are counted, never queued.
    pub fn send_frame(
        &self,
        target: &SendTarget,
        frame: &Frame,
        cipher: Option<&dyn HeaderCipher>,
    ) {
        let bytes = wire::encode(frame, cipher, rand::random());
        if !self.sink.send(target, &bytes) {
            bump(&self.stats.errors_tx);
        }
    }

    /// Emit pre-encoded bytes (broadcast fan-out encodes once).
    pub fn send_bytes(&self, target: &SendTarget, bytes: &[u8]) {
        if !self.sink.send(target, bytes) {
            bump(&self.stats.errors_tx);
        }
    }

    /// AUTH NAKs are rate-limited per source address.
    pub fn allow_auth_nak(&self, src: IpAddr, now: Instant) -> bool {
        let allowed = match self.nak_limiter.get(&src) {
            Some(last) => now.saturating_duration_since(*last) >= AUTH_NAK_INTERVAL,
            None => true,
        };
        if allowed {
            self.nak_limiter.insert(src, now);
        }
        allowed
    }

    pub fn prune_nak_limiter(&self, now: Instant) {
        self.nak_limiter
            .retain(|_, last| now.saturating_duration_since(*last) < AUTH_NAK_INTERVAL * 10);
    }
}

/// Reply address of a peer record, if it currently has a usable one.
pub fn target_of(peer: &PeerRecord) -> Option<SendTarget> {
    if !peer.sock.is_resolved() {
        return None;
    }
    match peer.sock.transport {
        Transport::Udp => Some(SendTarget::Udp(peer.sock.addr)),
        Transport::Tcp => peer.conn_id.map(SendTarget::Tcp),
    }
}

/// The authentication a stored peer would present, used to pick reply
/// ciphers when relaying towards that peer.
pub fn auth_of(peer: &PeerRecord) -> HeaderAuth {
    match &peer.username {
        Some(username) => HeaderAuth::User(username.clone()),
        None => HeaderAuth::Community,
    }
}

/// Target for the source of an inbound datagram.
pub fn inbound_target(sock: &PeerSocket, conn: Option<u64>) -> SendTarget {
    match (sock.transport, conn) {
        (Transport::Tcp, Some(conn_id)) => SendTarget::Tcp(conn_id),
        _ => SendTarget::Udp(sock.addr),
    }
}
