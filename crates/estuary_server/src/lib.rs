//! # Estuary
//!
//! A framework for building real-time, session-oriented application
//! servers: multiplayer games, chat rooms, live collaborative apps.
//! Clients hold a persistent bidirectional connection (TCP or WebSocket
//! binary frames); the server routes typed messages to registered
//! handlers, which push or respond back on the same connection.
//!
//! A deployment is either one standalone node or a cluster: thin **gate**
//! nodes terminate client connections, **backend** nodes host the
//! application logic, and a **hub** (master) tracks membership. Messages
//! whose service is not local forward over an internal RPC bus, sticky
//! per session.
//!
//! ## A minimal server
//!
//! ```ignore
//! use estuary_server::{listen, Component, Components, HandlerRegistry, Options, ServerError, Session};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct Ping { content: String }
//!
//! struct S;
//!
//! impl Component for S {
//!     fn name(&self) -> &'static str { "S" }
//!     fn handlers(&self, registry: &mut HandlerRegistry) {
//!         registry.register("Ping", |session: &Arc<Session>, msg: Ping| {
//!             session.response(&serde_json::json!({ "content": msg.content }))
//!         });
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     estuary_server::logging::init_logging(false);
//!     let mut components = Components::new();
//!     components.register(S);
//!     listen("127.0.0.1:34590", Options::new().with_components(components)).await
//! }
//! ```
//!
//! Handlers run on the node's scheduler, one at a time, which gives them
//! a single-writer view of their sessions without locks. A service can
//! opt into a per-session executor instead (see
//! [`ComponentOptions::with_scheduler_name`]).

pub mod cluster;
pub mod component;
pub mod env;
pub mod error;
pub mod group;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod scheduler;
pub mod serialize;
pub mod service;
pub mod session;

pub use cluster::{CompInfo, MemberInfo, Node, RemoteInfo, SessionInfo};
pub use component::{Component, ComponentOptions, Components, HandlerRegistry};
pub use env::NodeEnv;
pub use error::ServerError;
pub use group::Group;
pub use options::Options;
pub use pipeline::Pipeline;
pub use scheduler::{LocalScheduler, Scheduler, Task};
pub use serialize::{JsonSerializer, Serializer};
pub use session::{NetworkEntity, Session};

use tracing::info;

/// Run a node on `addr` until a termination signal or [`Node`] shutdown.
///
/// A node with no master flag, no registry address and no gate address
/// runs in singleton mode: the listen address doubles as the gate, so a
/// bare `listen` gives a fully working standalone server.
pub async fn listen(addr: &str, mut options: Options) -> Result<(), ServerError> {
    if !options.is_master && options.registry_addr.is_none() && options.gate_addr.is_none() {
        info!("the current server is running in singleton mode");
        options.gate_addr = Some(addr.to_string());
    }

    let node = Node::startup(addr, options).await?;
    let env = node.env();
    let mut die = env.subscribe_die();
    tokio::select! {
        _ = die.recv() => {
            info!("shutdown requested, the node will stop in a few seconds");
        }
        _ = termination_signal() => {
            info!("termination signal received");
        }
    }
    node.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) =
        (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
    else {
        // No signal handling available; rely on the die channel alone.
        std::future::pending::<()>().await;
        return;
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
