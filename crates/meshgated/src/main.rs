//! meshgated — overlay VPN supernode daemon.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use meshgate_core::community::{AutoIpPool, CommunityRegistry};
use meshgate_core::config::{SupernodeConfig, DEFAULT_FEDERATION_NAME, DEFAULT_MGMT_PASSWORD};
use meshgate_core::crypto::StandardProvider;
use meshgate_core::wire::MacAddr;

use meshgate_api::{ApiState, NodeInfo, VerbosityControl};
use meshgated::engine::Engine;
use meshgated::node::Node;
use meshgated::session;
use meshgated::transport::{self, EngineMsg, NetSink};

/// Runtime-adjustable log verbosity, driven by `set_verbose`.
struct LogVerbosity {
    level: AtomicU8,
    handle: reload::Handle<LevelFilter, Registry>,
}

impl LogVerbosity {
    fn filter_of(level: u8) -> LevelFilter {
        match level {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

impl VerbosityControl for LogVerbosity {
    fn get(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    fn set(&self, level: u8) {
        self.level.store(level, Ordering::Relaxed);
        let _ = self.handle.reload(Self::filter_of(level));
    }
}

fn init_logging() -> Arc<LogVerbosity> {
    let default_level = 2u8;
    let (filter, handle) = reload::Layer::new(LogVerbosity::filter_of(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Arc::new(LogVerbosity {
        level: AtomicU8::new(default_level),
        handle,
    })
}

fn resolve_mac(cfg: &SupernodeConfig) -> Result<MacAddr> {
    let mut mac = match &cfg.mac {
        Some(text) => text
            .parse::<MacAddr>()
            .with_context(|| format!("invalid mac '{text}'"))?,
        None => MacAddr(rand::random()),
    };
    // Unicast, locally administered.
    mac.0[0] = (mac.0[0] & !0x01) | 0x02;
    Ok(mac)
}

#[tokio::main]
async fn main() -> Result<()> {
    let verbosity = init_logging();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = SupernodeConfig::load(config_path.as_deref()).context("loading configuration")?;

    if cfg.federation.name == DEFAULT_FEDERATION_NAME {
        tracing::warn!(
            "using the default federation name; configure your own for production use"
        );
    }
    if !cfg.overlay.spoofing_protection {
        tracing::warn!("MAC and IP spoofing protection is disabled");
    }
    if cfg.management.password == DEFAULT_MGMT_PASSWORD {
        tracing::warn!("management password is the default");
    }

    let provider = Arc::new(StandardProvider::generate());
    let mac = resolve_mac(&cfg)?;
    tracing::info!(mac = %mac, version = %cfg.version_string, "meshgated starting");

    let pool = AutoIpPool::new(
        cfg.overlay.auto_ip_min,
        cfg.overlay.auto_ip_max,
        cfg.overlay.auto_ip_bits,
    )
    .context("auto-ip pool configuration")?;
    tracing::info!(
        min = %cfg.overlay.auto_ip_min,
        max = %cfg.overlay.auto_ip_max,
        bits = cfg.overlay.auto_ip_bits,
        subnets = pool.subnet_count(),
        "auto-ip address pool"
    );

    let registry = Arc::new(
        CommunityRegistry::new(
            provider.clone(),
            pool,
            &cfg.federation.name,
            cfg.overlay.header_encryption,
            cfg.overlay.community_file.clone(),
        )
        .context("community registry")?,
    );

    if registry.community_file().is_some() {
        // Unparseable at first load is fatal; reloads later are not.
        let summary = registry.load_acl().context("loading community file")?;
        tracing::info!(
            communities = summary.communities,
            users = summary.users,
            "community file loaded"
        );
    } else {
        tracing::info!("no community file; any community may register");
    }

    let udp = Arc::new(
        UdpSocket::bind((cfg.network.bind, cfg.network.port))
            .await
            .context("binding main udp socket")?,
    );
    let local = udp.local_addr().context("reading udp local address")?;
    tracing::info!(addr = %local, "supernode is listening on UDP (main)");

    let sink = NetSink::new(udp.clone());
    let tcp_listener = if cfg.network.tcp_enabled {
        let listener = TcpListener::bind((cfg.network.bind, cfg.network.port))
            .await
            .context("binding aux tcp listener")?;
        tracing::info!(addr = %local, "supernode is listening on TCP (aux)");
        Some(listener)
    } else {
        None
    };

    let mgmt_bind = cfg.management.bind;
    let mgmt_port = cfg.management.port;
    let mgmt_password = cfg.management.password.clone();

    let (node, shutdown_rx) = Node::new(cfg, mac, provider, registry, sink.clone());
    session::install_anchors(&node);

    let (engine_tx, engine_rx) = transport::engine_channel();

    tokio::spawn(transport::udp_loop(udp, engine_tx.clone()));
    if let Some(listener) = tcp_listener {
        tokio::spawn(transport::tcp_accept_loop(
            listener,
            sink,
            engine_tx.clone(),
        ));
    }
    tokio::spawn(transport::tick_loop(
        node.cfg.sweep_interval(),
        engine_tx.clone(),
    ));

    let engine = Engine::new(node.clone());
    let engine_task = tokio::spawn(engine.run(engine_rx, shutdown_rx.clone()));

    let api_state = ApiState {
        registry: node.registry.clone(),
        stats: node.stats.clone(),
        timestamps: node.timestamps.clone(),
        events: node.events.clone(),
        shutdown: node.shutdown.clone(),
        verbosity: verbosity.clone(),
        info: NodeInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            builddate: option_env!("MESHGATE_BUILD_DATE").unwrap_or("").to_string(),
            macaddr: mac.to_string(),
            sockaddr: local.to_string(),
            mgmt_password,
        },
    };
    tokio::spawn(async move {
        if let Err(e) = meshgate_api::serve(api_state, mgmt_bind, mgmt_port).await {
            tracing::error!(error = %e, "management api failed");
        }
    });

    // Register with anchors right away rather than waiting a full tick.
    let _ = engine_tx.send(EngineMsg::Tick).await;
    tracing::info!("supernode started");

    let mut shutdown_watch = shutdown_rx.clone();
    let mut signalled = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    break;
                }
                if signalled {
                    tracing::info!("ok, leaving now");
                    std::process::exit(0);
                }
                signalled = true;
                tracing::info!("shutting down...");
                let _ = node.shutdown.send(true);
            }
            _ = shutdown_watch.changed() => {
                if *shutdown_watch.borrow() {
                    break;
                }
            }
        }
    }

    let _ = engine_task.await;
    tracing::info!("supernode stopped");
    Ok(())
}
