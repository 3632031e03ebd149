//! Datapath transports: the main UDP socket and the aux TCP listener.
//!
//! Every inbound datagram funnels through one channel into the engine task,
//! which keeps all state mutation on a single task and preserves per-source
//! arrival order. Outbound traffic goes through [`PacketSink`]; the
//! production sink never blocks — a datagram that cannot be sent right now
//! is dropped, there is no datapath queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use meshgate_core::peer::Transport;

/// Largest datagram we accept on either transport.
pub const MAX_DATAGRAM: usize = 65535;

/// Depth of the inbound engine channel and of each TCP writer channel.
const CHANNEL_DEPTH: usize = 256;

/// Where a reply or forwarded datagram should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Udp(SocketAddr),
    Tcp(u64),
}

/// Outbound seam consumed by the engine. The tests drive the engine through
/// a capturing implementation; the daemon installs [`NetSink`].
pub trait PacketSink: Send + Sync {
    /// Attempt to send one datagram. `false` means the datagram was dropped
    /// (send buffer full, connection gone) — the caller counts it.
    fn send(&self, target: &SendTarget, frame: &[u8]) -> bool;
}

/// One inbound datagram, as handed to the engine.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub data: Bytes,
    pub src: SocketAddr,
    pub transport: Transport,
    /// Owning TCP connection for aux-transport datagrams.
    pub conn: Option<u64>,
}

/// Everything the engine task processes, in arrival order.
#[derive(Debug)]
pub enum EngineMsg {
    Inbound(Inbound),
    TcpClosed(u64),
    Tick,
}

// ── Production sink ───────────────────────────────────────────────────────────

pub struct NetSink {
    udp: Arc<UdpSocket>,
    conns: DashMap<u64, mpsc::Sender<Bytes>>,
}

impl NetSink {
    pub fn new(udp: Arc<UdpSocket>) -> Arc<Self> {
        Arc::new(NetSink {
            udp,
            conns: DashMap::new(),
        })
    }

    fn register_conn(&self, conn_id: u64) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.conns.insert(conn_id, tx);
        rx
    }

    fn drop_conn(&self, conn_id: u64) {
        self.conns.remove(&conn_id);
    }
}

impl PacketSink for NetSink {
    fn send(&self, target: &SendTarget, frame: &[u8]) -> bool {
        match target {
            SendTarget::Udp(addr) => self.udp.try_send_to(frame, *addr).is_ok(),
            SendTarget::Tcp(conn_id) => {
                if frame.len() > u16::MAX as usize {
                    return false;
                }
                let Some(tx) = self.conns.get(conn_id) else {
                    return false;
                };
                let mut framed = BytesMut::with_capacity(2 + frame.len());
                framed.put_u16(frame.len() as u16);
                framed.extend_from_slice(frame);
                tx.try_send(framed.freeze()).is_ok()
            }
        }
    }
}

// ── Inbound loops ─────────────────────────────────────────────────────────────

pub fn engine_channel() -> (mpsc::Sender<EngineMsg>, mpsc::Receiver<EngineMsg>) {
    mpsc::channel(CHANNEL_DEPTH)
}

/// Drain the main UDP socket into the engine channel.
pub async fn udp_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<EngineMsg>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let msg = EngineMsg::Inbound(Inbound {
                    data: Bytes::copy_from_slice(&buf[..len]),
                    src,
                    transport: Transport::Udp,
                    conn: None,
                });
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "udp recv failed");
            }
        }
    }
}

/// Accept aux TCP connections. Each connection carries overlay datagrams
/// with a 2-byte big-endian length prefix; dispatch semantics are identical
/// to UDP.
pub async fn tcp_accept_loop(
    listener: TcpListener,
    sink: Arc<NetSink>,
    tx: mpsc::Sender<EngineMsg>,
) {
    let next_conn = AtomicU64::new(1);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "tcp accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let conn_id = next_conn.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id, peer = %peer, "aux tcp connection");

        let writer_rx = sink.register_conn(conn_id);
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(tcp_writer(conn_id, write_half, writer_rx));
        tokio::spawn(tcp_reader(
            conn_id,
            peer,
            read_half,
            sink.clone(),
            tx.clone(),
        ));
    }
}

async fn tcp_reader(
    conn_id: u64,
    peer: SocketAddr,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    sink: Arc<NetSink>,
    tx: mpsc::Sender<EngineMsg>,
) {
    let mut frame = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match read_half.read_u16().await {
            Ok(0) => continue,
            Ok(len) => len as usize,
            Err(_) => break,
        };
        if read_half.read_exact(&mut frame[..len]).await.is_err() {
            break;
        }
        let msg = EngineMsg::Inbound(Inbound {
            data: Bytes::copy_from_slice(&frame[..len]),
            src: peer,
            transport: Transport::Tcp,
            conn: Some(conn_id),
        });
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    tracing::debug!(conn_id, peer = %peer, "aux tcp connection closed");
    sink.drop_conn(conn_id);
    let _ = tx.send(EngineMsg::TcpClosed(conn_id)).await;
}

async fn tcp_writer(
    conn_id: u64,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!(conn_id, error = %e, "aux tcp write failed");
            break;
        }
    }
}

/// Feed maintenance ticks into the engine channel so timer-driven work runs
/// on the same task as packet handling.
pub async fn tick_loop(period: Duration, tx: mpsc::Sender<EngineMsg>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup work (anchor
    // registration) happens once the loops are up.
    interval.tick().await;
    loop {
        interval.tick().await;
        if tx.send(EngineMsg::Tick).await.is_err() {
            return;
        }
    }
}
