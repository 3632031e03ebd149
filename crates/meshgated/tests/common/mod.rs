//! Shared harness: an engine wired to a capturing sink instead of sockets.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use meshgate_core::community::{AutoIpPool, CommunityRegistry};
use meshgate_core::config::SupernodeConfig;
use meshgate_core::crypto::StandardProvider;
use meshgate_core::peer::Transport;
use meshgate_core::wire::{
    self, Body, ClearPolicy, CommunityName, Frame, HeaderAuth, KeyCandidate, KeyResolver, MacAddr,
    Register,
};

use meshgated::engine::Engine;
use meshgated::node::Node;
use meshgated::transport::{Inbound, PacketSink, SendTarget};

/// Captures everything the engine sends.
#[derive(Default)]
pub struct TestSink {
    sent: Mutex<Vec<(SendTarget, Vec<u8>)>>,
}

impl TestSink {
    pub fn take(&self) -> Vec<(SendTarget, Vec<u8>)> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }
}

impl PacketSink for TestSink {
    fn send(&self, target: &SendTarget, frame: &[u8]) -> bool {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((*target, frame.to_vec()));
        }
        true
    }
}

/// Accepts any cleartext frame; used to decode captured output.
pub struct OpenResolver;

impl KeyResolver for OpenResolver {
    fn clear_policy(&self, _community: &CommunityName) -> ClearPolicy {
        ClearPolicy::Accept
    }

    fn candidates(&self) -> Vec<KeyCandidate> {
        Vec::new()
    }
}

pub struct Harness {
    pub node: Arc<Node>,
    pub engine: Engine,
    pub sink: Arc<TestSink>,
    pub shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(mutate: impl FnOnce(&mut SupernodeConfig)) -> Harness {
    let mut cfg = SupernodeConfig::default();
    mutate(&mut cfg);

    let provider = Arc::new(StandardProvider::generate());
    let pool = AutoIpPool::new(
        cfg.overlay.auto_ip_min,
        cfg.overlay.auto_ip_max,
        cfg.overlay.auto_ip_bits,
    )
    .expect("pool");
    let registry = Arc::new(
        CommunityRegistry::new(
            provider.clone(),
            pool,
            &cfg.federation.name,
            cfg.overlay.header_encryption,
            cfg.overlay.community_file.clone(),
        )
        .expect("registry"),
    );
    if registry.community_file().is_some() {
        registry.load_acl().expect("acl");
    }

    let sink = Arc::new(TestSink::default());
    let (node, shutdown_rx) = Node::new(
        cfg,
        MacAddr([2, 0, 0, 0, 0, 0xEE]),
        provider,
        registry,
        sink.clone(),
    );
    Harness {
        engine: Engine::new(node.clone()),
        node,
        sink,
        shutdown_rx,
    }
}

impl Harness {
    pub fn inject(&self, bytes: Vec<u8>, src: SocketAddr) {
        self.engine.handle_inbound(Inbound {
            data: bytes.into(),
            src,
            transport: Transport::Udp,
            conn: None,
        });
    }

    pub fn inject_frame(&self, frame: &Frame, src: SocketAddr) {
        self.inject(wire::encode(frame, None, [0; 4]), src);
    }

    /// Send a cleartext REGISTER for `mac` from `src`.
    pub fn register(&self, community: &str, mac: MacAddr, src: SocketAddr) {
        let frame = Frame::new(
            name(community),
            Body::Register(Register {
                cookie: 1,
                src_mac: mac,
                desc: String::new(),
            }),
        );
        self.inject_frame(&frame, src);
    }

    /// Decode every captured cleartext frame.
    pub fn sent_frames(&self) -> Vec<(SendTarget, Frame)> {
        self.sink
            .take()
            .into_iter()
            .map(|(target, bytes)| {
                let decoded = wire::decode(&bytes, &OpenResolver).expect("sent frame decodes");
                (target, decoded.frame)
            })
            .collect()
    }

    /// Decode captured frames with the node's own key material (needed for
    /// sealed federation traffic).
    pub fn sent_frames_sealed(&self) -> Vec<(SendTarget, Frame, HeaderAuth)> {
        self.sink
            .take()
            .into_iter()
            .map(|(target, bytes)| {
                let decoded =
                    wire::decode(&bytes, &*self.node.registry).expect("sealed frame decodes");
                (target, decoded.frame, decoded.auth)
            })
            .collect()
    }
}

pub fn name(s: &str) -> CommunityName {
    CommunityName::new(s).expect("valid name")
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr([2, 0, 0, 0, 0, last])
}

pub fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, host], port))
}
