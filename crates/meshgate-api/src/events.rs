//! `GET /events/{topic}` — RS-delimited JSON event streams.
//!
//! One subscriber per topic: a new subscription displaces the old one,
//! whose stream simply ends; the newcomer's stream starts with a
//! `"replacing"` record.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use meshgate_core::events::EventTopic;

use crate::ApiState;

pub async fn subscribe(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(topic) = EventTopic::parse(&topic) else {
        return (StatusCode::NOT_FOUND, "unknown event topic\n").into_response();
    };

    tracing::debug!(topic = topic.as_str(), %peer, "event subscriber");
    let rx = state.events.subscribe(topic, peer.to_string());
    let stream =
        ReceiverStream::new(rx).map(|record| Ok::<_, Infallible>(Bytes::from(record)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
