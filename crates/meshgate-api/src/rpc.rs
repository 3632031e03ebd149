//! JSON-RPC 2.0 dispatch for `POST /v1`.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use meshgate_core::events::EventTopic;
use meshgate_core::stats::read;

use crate::ApiState;

/// Method table, mirrored by `help`.
const METHODS: &[(&str, &str)] = &[
    ("get_communities", "Show current communities"),
    ("get_edges", "List current edges/peers"),
    ("get_info", "Provide basic supernode information"),
    ("get_packetstats", "Traffic counters"),
    ("get_supernodes", "List current federation supernodes"),
    ("get_timestamps", "Event timestamps"),
    ("get_verbose", "Logging verbosity"),
    ("help", "Show JsonRPC methods"),
    ("help.events", "Show available event topics"),
    ("post.test", "Send a test event"),
    ("reload_communities", "Reload the community file and user keys"),
    ("set_verbose", "Set logging verbosity"),
    ("stop", "Stop the daemon"),
];

const WRITE_METHODS: &[&str] = &["set_verbose", "reload_communities", "stop"];

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

pub async fn handle(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let authorized = bearer_matches(&headers, &state.info.mgmt_password);

    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let reply = error_reply(Value::Null, 400, &format!("parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
        }
    };

    let (status, reply) = dispatch(&state, &request, authorized);
    (status, Json(reply)).into_response()
}

fn bearer_matches(headers: &HeaderMap, password: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == password)
        .unwrap_or(false)
}

fn result_reply(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn http_status(code: i64) -> StatusCode {
    StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Dispatch one parsed request. Pure in everything but the method's own
/// side effects, which keeps it directly testable.
fn dispatch(
    state: &ApiState,
    request: &RpcRequest,
    authorized: bool,
) -> (StatusCode, Value) {
    let id = &request.id;
    let method = request.method.as_str();

    if WRITE_METHODS.contains(&method) && !authorized {
        return (
            StatusCode::FORBIDDEN,
            error_reply(id.clone(), 403, "Forbidden"),
        );
    }

    let result = match method {
        "get_communities" => Ok(get_communities(state)),
        "get_edges" => Ok(get_edges(state)),
        "get_supernodes" => Ok(get_supernodes(state)),
        "get_info" => Ok(get_info(state)),
        "get_packetstats" => Ok(get_packetstats(state)),
        "get_timestamps" => {
            Ok(serde_json::to_value(state.timestamps.snapshot()).unwrap_or(Value::Null))
        }
        "get_verbose" => Ok(json!(state.verbosity.get())),
        "set_verbose" => set_verbose(state, request.params.as_ref()),
        "reload_communities" => reload_communities(state),
        "stop" => {
            let _ = state.shutdown.send(true);
            Ok(json!(0))
        }
        "post.test" => {
            let params = request.params.clone().unwrap_or(Value::Null);
            state.events.post_test(&params);
            Ok(json!("sent"))
        }
        "help" => Ok(help()),
        "help.events" => Ok(help_events(state)),
        _ => Err((404, format!("unknown method '{method}'"))),
    };

    match result {
        Ok(value) => (StatusCode::OK, result_reply(id, value)),
        Err((code, message)) => (http_status(code), error_reply(id.clone(), code, &message)),
    }
}

// ── Read methods ──────────────────────────────────────────────────────────────

fn get_communities(state: &ApiState) -> Value {
    let mut rows = Vec::new();
    state.registry.for_each(|c| {
        rows.push(json!({
            "community": if c.name.is_federation() { "-/-".to_string() } else { c.name.as_str().to_string() },
            "purgeable": c.purgeable,
            "is_federation": c.is_federation,
            "ip4addr": c.auto_ip_net.map(|s| s.to_string()).unwrap_or_default(),
        }));
    });
    rows.sort_by(|a, b| a["community"].as_str().cmp(&b["community"].as_str()));
    Value::Array(rows)
}

fn peer_row(c: &meshgate_core::community::Community, peer: &meshgate_core::peer::PeerRecord) -> Value {
    json!({
        "mode": "sn",
        "community": if c.name.is_federation() { "-/-".to_string() } else { c.name.as_str().to_string() },
        "ip4addr": peer.auto_ip.map(|(ip, bits)| format!("{ip}/{bits}")).unwrap_or_default(),
        "purgeable": peer.purgeable,
        "macaddr": if peer.mac.is_null() { String::new() } else { peer.mac.to_string() },
        "sockaddr": peer.sock.addr.to_string(),
        "proto": peer.sock.transport.as_str(),
        "desc": peer.version,
        "last_p2p": peer.last_p2p.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        "last_sent_query": peer.last_sent_query.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        "last_seen": peer.last_seen.elapsed().as_secs(),
    })
}

fn get_edges(state: &ApiState) -> Value {
    let mut rows = Vec::new();
    state.registry.for_each(|c| {
        for peer in c.edges.iter() {
            rows.push(peer_row(c, peer));
        }
    });
    Value::Array(rows)
}

fn get_supernodes(state: &ApiState) -> Value {
    let mut rows = Vec::new();
    let _ = state.registry.with(&state.registry.federation(), |c| {
        for peer in c.edges.iter() {
            rows.push(json!({
                "version": peer.version,
                "purgeable": peer.purgeable,
                "macaddr": if peer.mac.is_null() { String::new() } else { peer.mac.to_string() },
                "sockaddr": peer.sock.addr.to_string(),
                "selection": peer.selection,
                "last_seen": peer.last_seen.elapsed().as_secs(),
                "uptime": peer.uptime_at_registration,
            }));
        }
    });
    Value::Array(rows)
}

fn get_info(state: &ApiState) -> Value {
    json!({
        "version": state.info.version,
        "builddate": state.info.builddate,
        "role": "supernode",
        "macaddr": state.info.macaddr,
        "sockaddr": state.info.sockaddr,
    })
}

fn get_packetstats(state: &ApiState) -> Value {
    let stats = &state.stats;
    json!([
        { "type": "forward", "tx_pkt": read(&stats.forward_tx) },
        { "type": "broadcast", "tx_pkt": read(&stats.broadcast_tx) },
        { "type": "reg", "rx_pkt": read(&stats.reg_rx), "nak": read(&stats.reg_nak) },
        { "type": "errors", "tx_pkt": read(&stats.errors_tx) },
        { "type": "rx_errors", "rx_pkt": read(&stats.rx_errors) },
    ])
}

fn help() -> Value {
    Value::Array(
        METHODS
            .iter()
            .map(|(method, desc)| json!({ "method": method, "desc": desc }))
            .collect(),
    )
}

fn help_events(state: &ApiState) -> Value {
    Value::Array(
        EventTopic::ALL
            .iter()
            .map(|topic| {
                json!({
                    "topic": topic.as_str(),
                    "sockaddr": state.events.subscriber(*topic).unwrap_or_else(|| "?".into()),
                    "desc": topic.describe(),
                })
            })
            .collect(),
    )
}

// ── Write methods ─────────────────────────────────────────────────────────────

fn set_verbose(state: &ApiState, params: Option<&Value>) -> Result<Value, (i64, String)> {
    let level = match params {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::Array(items)) => items.first().and_then(level_of),
        Some(other) => level_of(other),
        None => None,
    };
    let Some(level) = level else {
        return Err((400, "expecting a verbosity level".into()));
    };
    state.verbosity.set(level.min(u8::MAX as u64) as u8);
    Ok(json!(state.verbosity.get()))
}

fn level_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn reload_communities(state: &ApiState) -> Result<Value, (i64, String)> {
    match state.registry.load_acl() {
        Ok(summary) => Ok(json!({
            "communities": summary.communities,
            "users": summary.users,
        })),
        Err(e) => Err((400, e.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
