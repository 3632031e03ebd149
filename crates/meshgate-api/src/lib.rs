//! Management HTTP surface: JSON-RPC over `POST /v1`, RS-delimited event
//! streams under `/events/{topic}`, and a small embedded UI.
//!
//! Reads are open; mutating methods require the management password as a
//! bearer token. The connection pool is bounded: excess requests are shed
//! with 503 rather than queued behind the datapath.

pub mod events;
pub mod rpc;
pub mod ui;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use meshgate_core::community::CommunityRegistry;
use meshgate_core::events::EventHub;
use meshgate_core::stats::{EventTimestamps, PacketStats};

/// Concurrent management request slots.
pub const MGMT_SLOTS: usize = 5;

/// Runtime log-level control, implemented by the daemon over its
/// tracing-subscriber reload handle.
pub trait VerbosityControl: Send + Sync {
    fn get(&self) -> u8;
    fn set(&self, level: u8);
}

/// Static facts about this daemon instance, for `get_info`.
#[derive(Clone)]
pub struct NodeInfo {
    pub version: String,
    pub builddate: String,
    pub macaddr: String,
    pub sockaddr: String,
    pub mgmt_password: String,
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<CommunityRegistry>,
    pub stats: Arc<PacketStats>,
    pub timestamps: Arc<EventTimestamps>,
    pub events: Arc<EventHub>,
    pub shutdown: watch::Sender<bool>,
    pub verbosity: Arc<dyn VerbosityControl>,
    pub info: NodeInfo,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ui::index))
        .route("/script.js", get(ui::script))
        .route("/v1", post(rpc::handle))
        .route("/events/{topic}", get(events::subscribe))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_err: tower::BoxError| async {
                    StatusCode::SERVICE_UNAVAILABLE
                }))
                .load_shed()
                .concurrency_limit(MGMT_SLOTS),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: ApiState, bind: IpAddr, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    tracing::info!(%bind, port, "supernode is listening on TCP (management)");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
