//! Embedded debug monitor.
//!
//! A small HTTP listener for operators: process variables under
//! `/debug/vars` and a node overview under `/debug/estuary/node` —
//! role, components, known remotes, cluster members and live sessions.
//! Unless an explicit monitor address is configured, the listener binds
//! the first free port in the ten ports above the service port, so a
//! whole cluster on one host gets predictable monitor addresses.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::node::NodeInner;

const MONITOR_PORT_SCAN: u16 = 10;

pub(crate) async fn start(inner: Arc<NodeInner>) {
    let addr = match inner.monitor_addr.clone() {
        Some(addr) => addr,
        None => match scan_monitor_addr(&inner.service_addr).await {
            Some(addr) => addr,
            None => {
                warn!("no free monitor port near the service port, monitor disabled");
                return;
            }
        },
    };

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(%addr, "monitor bind failed: {e}");
            return;
        }
    };

    let app = Router::new()
        .route("/debug/vars", get(vars))
        .route("/debug/estuary/node", get(node_info))
        .with_state(inner.clone());

    info!("node monitor running at http://{addr}");
    let mut die = inner.env.subscribe_die();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = die.recv().await;
    });
    if let Err(e) = serve.await {
        warn!("monitor server failed: {e}");
    }
}

/// First bindable `host:(service_port + k)`, k in `1..=10`.
async fn scan_monitor_addr(service_addr: &str) -> Option<String> {
    let (host, port) = service_addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    for offset in 1..=MONITOR_PORT_SCAN {
        let candidate = format!("{host}:{}", port.checked_add(offset)?);
        if let Ok(listener) = TcpListener::bind(&candidate).await {
            drop(listener);
            return Some(candidate);
        }
    }
    None
}

async fn vars(State(inner): State<Arc<NodeInner>>) -> Json<serde_json::Value> {
    let uptime = inner
        .started_at
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "node_type": inner.node_type(),
        "uptime_secs": uptime,
        "sessions": inner.sessions.len(),
        "members": inner.membership.members().len(),
    }))
}

async fn node_info(State(inner): State<Arc<NodeInner>>) -> Json<serde_json::Value> {
    let handler = inner.handler();
    let started_at = inner
        .started_at
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(json!({
        "type": inner.node_type(),
        "label": inner.label,
        "service_addr": inner.service_addr,
        "gate_addr": inner.gate_addr,
        "started_at": started_at,
        "components": handler.components(),
        "remotes": handler.remotes(),
        "members": inner.membership.members(),
        "sessions": inner.session_infos(),
    }))
}
