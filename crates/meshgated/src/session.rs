//! Registration and session lifecycle: edge REGISTER, supernode peering,
//! the purge sweep and anchor maintenance.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Instant;

use meshgate_core::events::PeerAction;
use meshgate_core::peer::{PeerRecord, PeerSocket, UpsertOutcome};
use meshgate_core::stats::bump;
use meshgate_core::wire::{
    Body, CommunityName, Frame, HeaderAuth, MacAddr, NakReason, Register, RegisterAck,
    RegisterNak, RegisterSuper, RegisterSuperAck, RegisterSuperNak, UnregisterSuper,
};

use crate::node::{inbound_target, target_of, Node};
use crate::transport::SendTarget;

/// Context of one inbound datagram, as seen by the handlers.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub src: PeerSocket,
    pub conn: Option<u64>,
    pub now: Instant,
}

impl Ctx {
    pub fn reply_target(&self) -> SendTarget {
        inbound_target(&self.src, self.conn)
    }
}

// ── Edge registration ─────────────────────────────────────────────────────────

pub fn register_edge(
    node: &Arc<Node>,
    community: CommunityName,
    auth: &HeaderAuth,
    reg: &Register,
    ctx: &Ctx,
) {
    if let Err(reason) = node.registry.admit_edge(&community, auth) {
        tracing::debug!(%community, mac = %reg.src_mac, ?reason, "registration refused");
        send_nak(node, &community, auth, reg.cookie, reason, ctx);
        return;
    }

    // Spoofing protection: a MAC already bound to a different source
    // address may only be re-claimed with valid authentication, and only
    // within the community that holds it.
    if node.cfg.overlay.spoofing_protection {
        if let Some(holder) = node
            .registry
            .find_spoof_conflict(&reg.src_mac, ctx.src.addr)
        {
            let reclaim = holder == community && auth.is_authenticated();
            if !reclaim {
                tracing::info!(
                    %community,
                    mac = %reg.src_mac,
                    holder = %holder,
                    "MAC already in use"
                );
                send_nak(node, &community, auth, reg.cookie, NakReason::MacInUse, ctx);
                return;
            }
        }
    }

    let auto_ip = node.registry.edge_auto_ip(&community, &reg.src_mac);
    let user_key = match auth {
        HeaderAuth::User(username) => node
            .registry
            .with(&community, |c| {
                c.users
                    .iter()
                    .find(|u| &u.username == username)
                    .map(|u| (u.username.clone(), u.public_key))
            })
            .flatten(),
        _ => None,
    };

    let mut event: Option<(PeerAction, PeerRecord)> = None;
    node.registry.with_mut(&community, |c| {
        let (id, outcome) = c.edges.upsert(reg.src_mac, ctx.src, ctx.now);
        if let Some(peer) = c.edges.peer_mut(id) {
            peer.version = reg.desc.clone();
            peer.auto_ip = auto_ip;
            peer.conn_id = ctx.conn;
            if let Some((username, pk)) = &user_key {
                peer.username = Some(username.clone());
                peer.identity_pk = Some(*pk);
            }
            event = match outcome {
                UpsertOutcome::Created => Some((PeerAction::Join, peer.clone())),
                UpsertOutcome::Refreshed { moved: true } => {
                    Some((PeerAction::Move, peer.clone()))
                }
                UpsertOutcome::Refreshed { moved: false } => None,
            };
        }
    });

    if let Some((action, peer)) = &event {
        tracing::info!(%community, mac = %peer.mac, sock = %peer.sock.addr, action = action.as_str(), "edge");
        node.events.post_peer(*action, peer);
    }

    let (auto_ip_addr, auto_ip_bitlen) = match auto_ip {
        Some((ip, bitlen)) => (ip, bitlen),
        None => (std::net::Ipv4Addr::UNSPECIFIED, 0),
    };
    let ack = Frame::new(
        community,
        Body::RegisterAck(RegisterAck {
            cookie: reg.cookie,
            mac: reg.src_mac,
            auto_ip: auto_ip_addr,
            auto_ip_bitlen,
            observed: ctx.src.addr,
        }),
    );
    let cipher = node.registry.reply_cipher(&community, auth);
    node.send_frame(&ctx.reply_target(), &ack, cipher.as_deref());

    bump(&node.stats.reg_rx);
    node.timestamps.mark_register();
}

pub fn send_nak(
    node: &Arc<Node>,
    community: &CommunityName,
    auth: &HeaderAuth,
    cookie: u32,
    reason: NakReason,
    ctx: &Ctx,
) {
    let nak = Frame::new(
        *community,
        Body::RegisterNak(RegisterNak { cookie, reason }),
    );
    let cipher = node.registry.reply_cipher(community, auth);
    node.send_frame(&ctx.reply_target(), &nak, cipher.as_deref());
    bump(&node.stats.reg_nak);
}

pub fn unregister(node: &Arc<Node>, community: CommunityName, msg: &UnregisterSuper, ctx: &Ctx) {
    let removed = node
        .registry
        .with_mut(&community, |c| c.edges.remove(&msg.src_mac))
        .flatten();
    if let Some(peer) = removed {
        // Only honor a goodbye from the address that registered.
        if peer.sock.addr == ctx.src.addr {
            tracing::info!(%community, mac = %peer.mac, "edge unregistered");
            node.events.post_peer(PeerAction::Leave, &peer);
        } else {
            node.registry.with_mut(&community, |c| {
                c.edges.insert(peer.clone());
            });
        }
    }
}

// ── Supernode peering ─────────────────────────────────────────────────────────

pub fn register_super(
    node: &Arc<Node>,
    community: CommunityName,
    auth: &HeaderAuth,
    rs: &RegisterSuper,
    ctx: &Ctx,
) {
    let federation = node.federation();
    if community != federation {
        let nak = Frame::new(
            community,
            Body::RegisterSuperNak(RegisterSuperNak {
                cookie: rs.cookie,
                reason: NakReason::Community,
            }),
        );
        let cipher = node.registry.reply_cipher(&federation, auth);
        node.send_frame(&ctx.reply_target(), &nak, cipher.as_deref());
        bump(&node.stats.reg_nak);
        return;
    }

    node.registry.with_mut(&federation, |c| {
        // A configured anchor is keyed by socket until its MAC is learned.
        if c.edges.get(&rs.src_mac).is_none() {
            if let Some(id) = c.edges.id_by_sock(&ctx.src) {
                c.edges.set_mac(id, rs.src_mac);
            }
        }
        let (id, _) = c.edges.upsert(rs.src_mac, ctx.src, ctx.now);
        if let Some(peer) = c.edges.peer_mut(id) {
            peer.selection = rs.selection;
            peer.uptime_at_registration = rs.uptime;
            peer.version = rs.version.clone();
            peer.conn_id = ctx.conn;
            peer.communities = rs
                .communities
                .iter()
                .map(|n| n.as_str().to_string())
                .collect();
        }
    });

    let merged = node.registry.merge_remote(&rs.communities);
    if merged > 0 {
        tracing::info!(merged, from = %ctx.src.addr, "learned communities via federation");
    }

    let ack = Frame::new(
        federation,
        Body::RegisterSuperAck(RegisterSuperAck {
            cookie: rs.cookie,
            mac: node.mac,
            selection: node.registry.edge_count(),
            communities: node.registry.local_community_names(),
        }),
    );
    let cipher = node.registry.reply_cipher(&federation, auth);
    node.send_frame(&ctx.reply_target(), &ack, cipher.as_deref());

    bump(&node.stats.reg_rx);
    node.timestamps.mark_federation();
}

pub fn handle_super_ack(
    node: &Arc<Node>,
    community: CommunityName,
    ack: &RegisterSuperAck,
    ctx: &Ctx,
) {
    if community != node.federation() {
        return;
    }

    node.registry.with_mut(&community, |c| {
        let id = match c.edges.id_by_sock(&ctx.src) {
            Some(id) => id,
            None => c.edges.upsert(ack.mac, ctx.src, ctx.now).0,
        };
        c.edges.set_mac(id, ack.mac);
        if let Some(peer) = c.edges.peer_mut(id) {
            peer.last_seen = ctx.now;
            peer.selection = ack.selection;
            peer.communities = ack
                .communities
                .iter()
                .map(|n| n.as_str().to_string())
                .collect();
        }
    });

    node.registry.merge_remote(&ack.communities);
    node.timestamps.mark_federation();
}

pub fn handle_federation_info(
    node: &Arc<Node>,
    community: CommunityName,
    communities: &[CommunityName],
    ctx: &Ctx,
) {
    if community != node.federation() {
        return;
    }
    node.registry.with_mut(&community, |c| {
        if let Some(id) = c.edges.id_by_sock(&ctx.src) {
            if let Some(peer) = c.edges.peer_mut(id) {
                peer.last_seen = ctx.now;
                peer.communities = communities
                    .iter()
                    .map(|n| n.as_str().to_string())
                    .collect();
            }
        }
    });
    node.registry.merge_remote(communities);
}

// ── Anchors ───────────────────────────────────────────────────────────────────

/// Materialise the configured `host:port` anchors as non-purgeable peers in
/// the federation community. A name that does not resolve right now is kept
/// and retried at every maintenance tick.
pub fn install_anchors(node: &Arc<Node>) {
    let federation = node.federation();
    for anchor in node.cfg.federation.anchors.clone() {
        if !anchor.contains(':') {
            tracing::warn!(%anchor, "ignoring anchor without port");
            continue;
        }
        let sock = match resolve_anchor(&anchor) {
            Some(addr) => PeerSocket::udp(addr),
            None => {
                tracing::warn!(%anchor, "anchor did not resolve; will retry");
                PeerSocket::udp(std::net::SocketAddr::from((
                    std::net::Ipv4Addr::UNSPECIFIED,
                    0,
                )))
            }
        };
        node.registry.with_mut(&federation, |c| {
            let mut record = PeerRecord::new(MacAddr::NULL, sock, Instant::now());
            record.dial_back = Some(anchor.clone());
            record.purgeable = false;
            c.edges.insert(record);
        });
        tracing::info!(%anchor, "federation anchor installed");
    }
}

fn resolve_anchor(anchor: &str) -> Option<std::net::SocketAddr> {
    anchor.to_socket_addrs().ok()?.next()
}

// ── Maintenance tick ──────────────────────────────────────────────────────────

/// One pass of timer-driven work: purge expired peers, retry unresolved
/// anchors, re-register with the federation.
pub async fn maintenance(node: &Arc<Node>) {
    let now = Instant::now();
    purge_sweep(node, now);
    node.prune_nak_limiter(now);
    refresh_anchors(node).await;
    federation_register(node);
}

pub fn purge_sweep(node: &Arc<Node>, now: Instant) {
    let edge_ttl = node.cfg.registration_ttl();
    let federation_ttl = node.cfg.federation_ttl();

    let mut expired: Vec<(CommunityName, PeerRecord)> = Vec::new();
    node.registry.for_each_mut(|c| {
        let ttl = if c.name.is_federation() {
            federation_ttl
        } else {
            edge_ttl
        };
        for peer in c.edges.purge(now, ttl) {
            expired.push((c.name, peer));
        }
    });

    for (community, peer) in &expired {
        tracing::info!(%community, mac = %peer.mac, "peer expired");
        node.events.post_peer(PeerAction::Leave, peer);
    }
    node.timestamps.mark_sweep();
}

async fn refresh_anchors(node: &Arc<Node>) {
    let federation = node.federation();
    let unresolved: Vec<(meshgate_core::peer::PeerId, String)> = node
        .registry
        .with(&federation, |c| {
            c.edges
                .ids()
                .into_iter()
                .filter_map(|id| {
                    let peer = c.edges.peer(id)?;
                    match (&peer.dial_back, peer.sock.is_resolved()) {
                        (Some(dial), false) => Some((id, dial.clone())),
                        _ => None,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    for (id, dial) in unresolved {
        let resolved = tokio::net::lookup_host(&dial)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());
        match resolved {
            Some(addr) => {
                tracing::info!(anchor = %dial, %addr, "anchor resolved");
                node.registry.with_mut(&federation, |c| {
                    c.edges.set_sock(id, PeerSocket::udp(addr));
                });
            }
            None => tracing::debug!(anchor = %dial, "anchor still unresolved"),
        }
    }
}

/// Send REGISTER_SUPER to every reachable federation peer.
pub fn federation_register(node: &Arc<Node>) {
    let federation = node.federation();
    let targets: Vec<SendTarget> = node
        .registry
        .with(&federation, |c| {
            c.edges.iter().filter_map(target_of).collect()
        })
        .unwrap_or_default();
    if targets.is_empty() {
        return;
    }

    let frame = Frame::new(
        federation,
        Body::RegisterSuper(RegisterSuper {
            cookie: rand::random(),
            src_mac: node.mac,
            selection: node.registry.edge_count(),
            uptime: node.timestamps.uptime_secs(),
            version: node.cfg.version_string.clone(),
            communities: node.registry.local_community_names(),
        }),
    );
    let cipher = node.registry.relay_cipher(&federation);
    for target in targets {
        node.send_frame(&target, &frame, cipher.as_deref());
    }
    node.timestamps.mark_federation();
}

// ── TCP teardown ──────────────────────────────────────────────────────────────

/// An aux TCP connection went away: purgeable peers bound to it leave,
/// anchors merely lose their transport affinity.
pub fn drop_conn(node: &Arc<Node>, conn_id: u64) {
    let mut removed: Vec<(CommunityName, PeerRecord)> = Vec::new();
    node.registry.for_each_mut(|c| {
        for peer in c.edges.drop_conn(conn_id) {
            removed.push((c.name, peer));
        }
    });
    for (community, peer) in &removed {
        tracing::info!(%community, mac = %peer.mac, "edge lost tcp transport");
        node.events.post_peer(PeerAction::Leave, peer);
    }
}
