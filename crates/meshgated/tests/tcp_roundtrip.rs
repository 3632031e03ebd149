//! Aux TCP transport: length-prefixed datagrams, identical dispatch
//! semantics, peer teardown on disconnect.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{mac, name, OpenResolver};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use meshgate_core::community::{AutoIpPool, CommunityRegistry};
use meshgate_core::config::SupernodeConfig;
use meshgate_core::crypto::StandardProvider;
use meshgate_core::peer::Transport;
use meshgate_core::wire::{self, Body, Frame, MacAddr, Register};
use meshgated::engine::Engine;
use meshgated::node::Node;
use meshgated::transport::{self, NetSink};

#[tokio::test]
async fn register_round_trip_over_tcp() {
    let mut cfg = SupernodeConfig::default();
    cfg.network.bind = "127.0.0.1".parse().unwrap();
    cfg.network.port = 0;

    let provider = Arc::new(StandardProvider::generate());
    let pool = AutoIpPool::new(
        cfg.overlay.auto_ip_min,
        cfg.overlay.auto_ip_max,
        cfg.overlay.auto_ip_bits,
    )
    .unwrap();
    let registry = Arc::new(
        CommunityRegistry::new(
            provider.clone(),
            pool,
            &cfg.federation.name,
            cfg.overlay.header_encryption,
            None,
        )
        .unwrap(),
    );

    // UDP socket exists only as the sink's datapath; this test talks TCP.
    let udp = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp.local_addr().unwrap();

    let sink = NetSink::new(udp);
    let (node, shutdown_rx) = Node::new(
        cfg,
        MacAddr([2, 0, 0, 0, 0, 0xEE]),
        provider,
        registry,
        sink.clone(),
    );

    let (engine_tx, engine_rx) = transport::engine_channel();
    tokio::spawn(transport::tcp_accept_loop(tcp, sink, engine_tx));
    tokio::spawn(Engine::new(node.clone()).run(engine_rx, shutdown_rx));

    let mut stream = tokio::net::TcpStream::connect(tcp_addr).await.unwrap();
    let frame = Frame::new(
        name("alpha"),
        Body::Register(Register {
            cookie: 11,
            src_mac: mac(5),
            desc: String::new(),
        }),
    );
    let datagram = wire::encode(&frame, None, [0; 4]);
    stream.write_u16(datagram.len() as u16).await.unwrap();
    stream.write_all(&datagram).await.unwrap();

    // The ACK comes back on the same connection, length-prefixed.
    let read_ack = async {
        let len = stream.read_u16().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    };
    let buf = tokio::time::timeout(Duration::from_secs(5), read_ack)
        .await
        .expect("ack within deadline");

    let decoded = wire::decode(&buf, &OpenResolver).unwrap();
    let Body::RegisterAck(ack) = decoded.frame.body else {
        panic!("expected REGISTER_ACK");
    };
    assert_eq!(ack.cookie, 11);

    // The peer is tagged as a TCP peer.
    let transport = node
        .registry
        .with(&name("alpha"), |c| {
            c.edges.get(&mac(5)).map(|p| p.sock.transport)
        })
        .flatten()
        .unwrap();
    assert_eq!(transport, Transport::Tcp);

    // Closing the connection removes the purgeable peer.
    drop(stream);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let count = node
            .registry
            .with(&name("alpha"), |c| c.edges.len())
            .unwrap();
        if count == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer still present after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = node.shutdown.send(true);
}
