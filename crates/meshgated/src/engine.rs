//! The dispatch engine: classify each inbound datagram and register,
//! forward, broadcast, relay or drop it.
//!
//! All handlers run on one task, so every state transition is atomic with
//! respect to other datagrams and replies go out before the next datagram
//! is picked up.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use meshgate_core::peer::PeerSocket;
use meshgate_core::stats::bump;
use meshgate_core::wire::{
    self, Body, CommunityName, Frame, HeaderAuth, NakReason, PacketData, PeerInfoMsg, QueryPeer,
    WireError, FLAG_FROM_SUPERNODE,
};

use crate::node::{auth_of, inbound_target, target_of, Node};
use crate::session::{self, Ctx};
use crate::transport::{EngineMsg, Inbound, SendTarget};

/// Community stamped on NAKs for datagrams whose community could not be
/// established.
const UNKNOWN_COMMUNITY: &str = "-";

pub struct Engine {
    node: Arc<Node>,
}

impl Engine {
    pub fn new(node: Arc<Node>) -> Self {
        Engine { node }
    }

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<EngineMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(EngineMsg::Inbound(inbound)) => self.handle_inbound(inbound),
                    Some(EngineMsg::TcpClosed(conn_id)) => session::drop_conn(&self.node, conn_id),
                    Some(EngineMsg::Tick) => session::maintenance(&self.node).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    tracing::debug!("engine stopping");
                    return;
                }
            }
        }
    }

    pub fn handle_inbound(&self, inbound: Inbound) {
        let ctx = Ctx {
            src: PeerSocket {
                addr: inbound.src,
                transport: inbound.transport,
            },
            conn: inbound.conn,
            now: Instant::now(),
        };

        let decoded = match wire::decode(&inbound.data, &*self.node.registry) {
            Ok(decoded) => decoded,
            Err(WireError::AuthFailure) => {
                tracing::debug!(src = %inbound.src, "header authentication failed");
                if self.node.allow_auth_nak(inbound.src.ip(), ctx.now) {
                    self.nak_unknown(&ctx, NakReason::Auth);
                }
                return;
            }
            Err(e) => {
                tracing::debug!(src = %inbound.src, error = %e, "undecodable datagram");
                bump(&self.node.stats.rx_errors);
                return;
            }
        };

        let frame = decoded.frame;
        let auth = decoded.auth;
        tracing::trace!(
            src = %inbound.src,
            community = %frame.community,
            kind = ?frame.body.kind(),
            "datagram"
        );

        match &frame.body {
            Body::Register(reg) => {
                session::register_edge(&self.node, frame.community, &auth, reg, &ctx)
            }
            Body::RegisterSuper(rs) => {
                session::register_super(&self.node, frame.community, &auth, rs, &ctx)
            }
            Body::RegisterSuperAck(ack) => {
                session::handle_super_ack(&self.node, frame.community, ack, &ctx)
            }
            Body::RegisterSuperNak(nak) => {
                tracing::warn!(src = %inbound.src, reason = ?nak.reason, "peering refused");
            }
            Body::UnregisterSuper(msg) => {
                session::unregister(&self.node, frame.community, msg, &ctx)
            }
            Body::FederationInfo(info) => {
                session::handle_federation_info(&self.node, frame.community, &info.communities, &ctx)
            }
            Body::QueryPeer(query) => self.query_peer(frame.community, &auth, query, &ctx),
            Body::PeerInfo(info) => self.relay_peer_info(frame.community, info),
            Body::Packet(_) => self.forward(&frame, &auth, &ctx),
            Body::RegisterAck(_) | Body::RegisterNak(_) => {
                bump(&self.node.stats.rx_errors);
            }
        }
    }

    /// Answer QUERY_PEER with PEER_INFO when the target is registered in
    /// the same community; anything else is dropped.
    fn query_peer(&self, community: CommunityName, auth: &HeaderAuth, query: &QueryPeer, ctx: &Ctx) {
        let found = self.node.registry.with_mut(&community, |c| {
            if let Some(requester) = c.edges.get_mut(&query.src_mac) {
                requester.last_seen = ctx.now;
                requester.last_sent_query = Some(ctx.now);
            }
            c.edges.get(&query.target_mac).map(|peer| peer.sock.addr)
        });

        let Some(Some(target_sock)) = found else {
            tracing::debug!(%community, target = %query.target_mac, "query for unknown peer");
            return;
        };

        let reply = Frame::new(
            community,
            Body::PeerInfo(PeerInfoMsg {
                requester_mac: query.src_mac,
                target_mac: query.target_mac,
                sock: target_sock,
            }),
        );
        let cipher = self.node.registry.reply_cipher(&community, auth);
        self.node
            .send_frame(&ctx.reply_target(), &reply, cipher.as_deref());
    }

    /// PEER_INFO arriving here means another supernode answered a query we
    /// relayed: pass it on to the original requester if we know them.
    fn relay_peer_info(&self, community: CommunityName, info: &PeerInfoMsg) {
        let requester = self
            .node
            .registry
            .with(&community, |c| {
                c.edges
                    .get(&info.requester_mac)
                    .map(|peer| (target_of(peer), auth_of(peer)))
            })
            .flatten();

        let Some((Some(target), auth)) = requester else {
            return;
        };

        let frame = Frame::new(community, Body::PeerInfo(info.clone()));
        let cipher = self.node.registry.reply_cipher(&community, &auth);
        self.node.send_frame(&target, &frame, cipher.as_deref());
    }

    /// PACKET forwarding: unicast to a known edge, broadcast fan-out, or
    /// federation flood for unknown destinations.
    fn forward(&self, frame: &Frame, auth: &HeaderAuth, ctx: &Ctx) {
        let Body::Packet(pkt) = &frame.body else {
            return;
        };
        let community = frame.community;
        let node = &self.node;

        if community == node.federation() || !node.registry.contains(&community) {
            bump(&node.stats.rx_errors);
            return;
        }

        // A packet straight from an edge must come from a registered one;
        // relayed packets carry a remote supernode's edge as source.
        if !frame.from_supernode() {
            let known = node
                .registry
                .with_mut(&community, |c| match c.edges.get_mut(&pkt.src_mac) {
                    Some(peer) => {
                        peer.last_seen = ctx.now;
                        true
                    }
                    None => false,
                })
                .unwrap_or(false);
            if !known {
                tracing::debug!(%community, src = %pkt.src_mac, "packet from unregistered edge");
                session::send_nak(node, &community, auth, 0, NakReason::NotRegistered, ctx);
                return;
            }
        }

        if pkt.dst_mac.is_multicast() {
            self.broadcast(frame, pkt, ctx);
            return;
        }

        // Known unicast destination in this community?
        let dest = node
            .registry
            .with(&community, |c| {
                c.edges
                    .get(&pkt.dst_mac)
                    .map(|peer| (target_of(peer), auth_of(peer)))
            })
            .flatten();

        if let Some((target, dest_auth)) = dest {
            let Some(target) = target else {
                bump(&node.stats.errors_tx);
                return;
            };
            let out = Frame {
                ttl: frame.ttl,
                flags: frame.flags | FLAG_FROM_SUPERNODE,
                community,
                body: frame.body.clone(),
            };
            let cipher = node.registry.reply_cipher(&community, &dest_auth);
            node.send_frame(&target, &out, cipher.as_deref());
            bump(&node.stats.forward_tx);
            node.timestamps.mark_fwd();
            return;
        }

        // Unknown destination: flood the federation while TTL lasts.
        if frame.ttl == 0 {
            return;
        }
        let out = Frame {
            ttl: frame.ttl - 1,
            flags: frame.flags | FLAG_FROM_SUPERNODE,
            community,
            body: frame.body.clone(),
        };
        let sent = self.send_to_federation(&out, Some(ctx.src.addr));
        if sent > 0 {
            bump(&node.stats.forward_tx);
            node.timestamps.mark_fwd();
        }
    }

    fn broadcast(&self, frame: &Frame, pkt: &PacketData, ctx: &Ctx) {
        let node = &self.node;
        let community = frame.community;

        // Local fan-out: everyone in the community except the sender.
        let edges: Vec<(SendTarget, HeaderAuth)> = node
            .registry
            .with(&community, |c| {
                c.edges
                    .iter()
                    .filter(|peer| peer.mac != pkt.src_mac)
                    .filter_map(|peer| target_of(peer).map(|t| (t, auth_of(peer))))
                    .collect()
            })
            .unwrap_or_default();

        let out = Frame {
            ttl: frame.ttl,
            flags: frame.flags | FLAG_FROM_SUPERNODE,
            community,
            body: frame.body.clone(),
        };
        for (target, dest_auth) in &edges {
            let cipher = node.registry.reply_cipher(&community, dest_auth);
            node.send_frame(target, &out, cipher.as_deref());
        }

        // One copy to each federated supernode serving this community —
        // unless the packet already came through a supernode.
        if !frame.from_supernode() {
            self.send_to_federation(&out, Some(ctx.src.addr));
        }

        bump(&node.stats.broadcast_tx);
        node.timestamps.mark_fwd();
    }

    /// Send a frame to federation peers serving the frame's community.
    /// Returns how many copies went out.
    fn send_to_federation(&self, frame: &Frame, exclude: Option<std::net::SocketAddr>) -> usize {
        let node = &self.node;
        let community = frame.community.as_str().to_string();

        let peers: Vec<SendTarget> = node
            .registry
            .with(&node.federation(), |c| {
                c.edges
                    .iter()
                    .filter(|peer| Some(peer.sock.addr) != exclude)
                    .filter(|peer| {
                        // Anchors that have not advertised a community list
                        // yet get a copy too.
                        peer.communities.is_empty() || peer.communities.contains(&community)
                    })
                    .filter_map(target_of)
                    .collect()
            })
            .unwrap_or_default();

        if peers.is_empty() {
            return 0;
        }

        let cipher = node.registry.relay_cipher(&frame.community);
        let bytes = wire::encode(frame, cipher.as_deref(), rand::random());
        for target in &peers {
            node.send_bytes(target, &bytes);
        }
        peers.len()
    }

    /// NAK towards a source whose datagram never yielded a community.
    fn nak_unknown(&self, ctx: &Ctx, reason: NakReason) {
        let Ok(community) = CommunityName::new(UNKNOWN_COMMUNITY) else {
            return;
        };
        let nak = Frame::new(
            community,
            Body::RegisterNak(wire::RegisterNak { cookie: 0, reason }),
        );
        self.node.send_frame(&inbound_target(&ctx.src, ctx.conn), &nak, None);
        bump(&self.node.stats.reg_nak);
    }
}
