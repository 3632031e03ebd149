//! Peer records and the per-community peer table.
//!
//! The table is an arena of records with two indexes: MAC (primary) and
//! last-observed socket (used when a record is created before its MAC is
//! known, e.g. a configured federation anchor that has not ACK'd yet).
//! Cross-references are plain ids, never owning handles.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::wire::MacAddr;

/// Which transport a peer was last observed on. Replies to the peer must use
/// the same transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// A peer's reply address: socket plus transport tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSocket {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl PeerSocket {
    pub fn udp(addr: SocketAddr) -> Self {
        PeerSocket {
            addr,
            transport: Transport::Udp,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        PeerSocket {
            addr,
            transport: Transport::Tcp,
        }
    }

    /// Unresolved anchors carry an unspecified address until the federation
    /// tick manages to resolve their configured host name.
    pub fn is_resolved(&self) -> bool {
        !self.addr.ip().is_unspecified()
    }
}

/// Opaque handle into a [`PeerTable`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

/// One registered peer: an edge, or a supernode in the federation community.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub mac: MacAddr,
    pub sock: PeerSocket,
    /// Configured `host:port` for dial-back; set only on anchors, and kept
    /// so an anchor that failed to resolve can be retried later.
    pub dial_back: Option<String>,
    /// Public key that authenticated this peer, if any.
    pub identity_pk: Option<[u8; 32]>,
    /// Username proven by header authentication, if any.
    pub username: Option<String>,
    pub last_seen: Instant,
    pub last_p2p: Option<Instant>,
    pub last_sent_query: Option<Instant>,
    /// Remote uptime in seconds, as advertised at registration.
    pub uptime_at_registration: u64,
    /// Remote software version string (edges: device description).
    pub version: String,
    pub purgeable: bool,
    /// Selection criterion advertised by a federated supernode.
    pub selection: u32,
    /// Owning TCP connection, for peers reached over the aux transport.
    pub conn_id: Option<u64>,
    /// Auto-assigned overlay address (edges only).
    pub auto_ip: Option<(std::net::Ipv4Addr, u8)>,
    /// Communities a federated supernode serves. Empty for edges.
    pub communities: BTreeSet<String>,
}

impl PeerRecord {
    pub fn new(mac: MacAddr, sock: PeerSocket, now: Instant) -> Self {
        PeerRecord {
            mac,
            sock,
            dial_back: None,
            identity_pk: None,
            username: None,
            last_seen: now,
            last_p2p: None,
            last_sent_query: None,
            uptime_at_registration: 0,
            version: String::new(),
            purgeable: true,
            selection: 0,
            conn_id: None,
            auto_ip: None,
            communities: BTreeSet::new(),
        }
    }

    pub fn is_anchor(&self) -> bool {
        !self.purgeable && self.dial_back.is_some()
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Existing record refreshed; `moved` when the observed socket changed.
    Refreshed { moved: bool },
}

/// Dual-indexed peer container. At most one record per MAC; at most one
/// record per socket.
#[derive(Debug, Default)]
pub struct PeerTable {
    arena: HashMap<u64, PeerRecord>,
    by_mac: HashMap<MacAddr, u64>,
    by_sock: HashMap<PeerSocket, u64>,
    next_id: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, mac: &MacAddr) -> Option<&PeerRecord> {
        self.arena.get(self.by_mac.get(mac)?)
    }

    pub fn get_mut(&mut self, mac: &MacAddr) -> Option<&mut PeerRecord> {
        let id = *self.by_mac.get(mac)?;
        self.arena.get_mut(&id)
    }

    pub fn get_by_sock(&self, sock: &PeerSocket) -> Option<&PeerRecord> {
        self.arena.get(self.by_sock.get(sock)?)
    }

    pub fn id_by_mac(&self, mac: &MacAddr) -> Option<PeerId> {
        self.by_mac.get(mac).map(|&id| PeerId(id))
    }

    pub fn id_by_sock(&self, sock: &PeerSocket) -> Option<PeerId> {
        self.by_sock.get(sock).map(|&id| PeerId(id))
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerRecord> {
        self.arena.get(&id.0)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut PeerRecord> {
        self.arena.get_mut(&id.0)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.arena.keys().map(|&id| PeerId(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.arena.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.arena.values_mut()
    }

    /// Insert a fully-formed record. Indexes the MAC when non-null and the
    /// socket when resolved.
    pub fn insert(&mut self, record: PeerRecord) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        if !record.mac.is_null() {
            self.by_mac.insert(record.mac, id);
        }
        if record.sock.is_resolved() {
            self.by_sock.insert(record.sock, id);
        }
        self.arena.insert(id, record);
        PeerId(id)
    }

    /// Find-or-insert: by MAC when non-null, else by socket. Refresh updates
    /// `last_seen` and the observed socket.
    pub fn upsert(
        &mut self,
        mac: MacAddr,
        sock: PeerSocket,
        now: Instant,
    ) -> (PeerId, UpsertOutcome) {
        let existing = if mac.is_null() {
            self.by_sock.get(&sock).copied()
        } else {
            self.by_mac.get(&mac).copied()
        };

        match existing {
            Some(id) => {
                let moved = self.reindex_sock(id, sock);
                if let Some(record) = self.arena.get_mut(&id) {
                    record.last_seen = now;
                    record.sock = sock;
                }
                (PeerId(id), UpsertOutcome::Refreshed { moved })
            }
            None => {
                let id = self.insert(PeerRecord::new(mac, sock, now));
                (id, UpsertOutcome::Created)
            }
        }
    }

    pub fn remove(&mut self, mac: &MacAddr) -> Option<PeerRecord> {
        let id = self.by_mac.get(mac).copied()?;
        self.remove_id(id)
    }

    pub fn remove_by_sock(&mut self, sock: &PeerSocket) -> Option<PeerRecord> {
        let id = self.by_sock.get(sock).copied()?;
        self.remove_id(id)
    }

    /// Bind a MAC to a record found by socket (an anchor learning its peer's
    /// MAC from the first ACK). Fails when the MAC is already taken by a
    /// different record.
    pub fn set_mac(&mut self, id: PeerId, mac: MacAddr) -> bool {
        if mac.is_null() {
            return false;
        }
        if let Some(&taken) = self.by_mac.get(&mac) {
            return taken == id.0;
        }
        let Some(record) = self.arena.get_mut(&id.0) else {
            return false;
        };
        if !record.mac.is_null() {
            self.by_mac.remove(&record.mac);
        }
        record.mac = mac;
        self.by_mac.insert(mac, id.0);
        true
    }

    /// Move a record to a new socket (anchor resolution) and fix the index.
    pub fn set_sock(&mut self, id: PeerId, sock: PeerSocket) {
        self.reindex_sock(id.0, sock);
        if let Some(record) = self.arena.get_mut(&id.0) {
            record.sock = sock;
        }
    }

    /// Remove every purgeable record not seen within `ttl`. Returns the
    /// removed records so the caller can emit events for them.
    pub fn purge(&mut self, now: Instant, ttl: Duration) -> Vec<PeerRecord> {
        let expired: Vec<u64> = self
            .arena
            .iter()
            .filter(|(_, record)| {
                record.purgeable && now.saturating_duration_since(record.last_seen) > ttl
            })
            .map(|(&id, _)| id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.remove_id(id))
            .collect()
    }

    /// A TCP connection closed: purgeable peers bound to it are removed and
    /// returned; non-purgeable ones just lose their transport affinity.
    pub fn drop_conn(&mut self, conn_id: u64) -> Vec<PeerRecord> {
        let bound: Vec<u64> = self
            .arena
            .iter()
            .filter(|(_, record)| record.conn_id == Some(conn_id))
            .map(|(&id, _)| id)
            .collect();

        let mut removed = Vec::new();
        for id in bound {
            let purgeable = self.arena.get(&id).map(|r| r.purgeable).unwrap_or(false);
            if purgeable {
                if let Some(record) = self.remove_id(id) {
                    removed.push(record);
                }
            } else if let Some(record) = self.arena.get_mut(&id) {
                record.conn_id = None;
            }
        }
        removed
    }

    fn reindex_sock(&mut self, id: u64, sock: PeerSocket) -> bool {
        let old = self.arena.get(&id).map(|r| r.sock);
        match old {
            Some(old) if old == sock => false,
            Some(old) => {
                if self.by_sock.get(&old) == Some(&id) {
                    self.by_sock.remove(&old);
                }
                if sock.is_resolved() {
                    self.by_sock.insert(sock, id);
                }
                old.is_resolved()
            }
            None => false,
        }
    }

    fn remove_id(&mut self, id: u64) -> Option<PeerRecord> {
        let record = self.arena.remove(&id)?;
        if self.by_mac.get(&record.mac) == Some(&id) {
            self.by_mac.remove(&record.mac);
        }
        if self.by_sock.get(&record.sock) == Some(&id) {
            self.by_sock.remove(&record.sock);
        }
        Some(record)
    }
}
