//! Node options.
//!
//! A plain builder over everything a node can be told at boot. The
//! library never reads flags or config files; embedders parse whatever
//! they like and translate it into an `Options`.
//!
//! ```ignore
//! let mut components = Components::new();
//! components.register(ChatService::new());
//!
//! estuary_server::listen(
//!     "127.0.0.1:34590",
//!     Options::new()
//!         .with_components(components)
//!         .with_heartbeat_interval(Duration::from_secs(10))
//!         .with_debug_mode(),
//! )
//! .await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use estuary_protocol::Dictionary;

use crate::component::Components;
use crate::env::{EnvConfig, HandshakeValidator};
use crate::error::ServerError;
use crate::pipeline::Pipeline;
use crate::serialize::Serializer;

/// Origin-check callback for WebSocket upgrades; receives the `Origin`
/// header value (empty when absent).
pub type OriginCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Gate WebSocket configuration.
#[derive(Clone, Default)]
pub struct WebsocketOptions {
    pub(crate) enabled: bool,
    pub(crate) path: String,
    pub(crate) tls_certificate: Option<PathBuf>,
    pub(crate) tls_key: Option<PathBuf>,
    pub(crate) check_origin: Option<OriginCheck>,
}

/// Everything a node can be configured with.
pub struct Options {
    pub(crate) pipeline: Option<Pipeline>,
    pub(crate) is_master: bool,
    pub(crate) registry_addr: Option<String>,
    pub(crate) register_interval: Duration,
    pub(crate) gate_addr: Option<String>,
    pub(crate) components: Components,
    pub(crate) label: String,
    pub(crate) monitor_addr: Option<String>,
    pub(crate) websocket: WebsocketOptions,
    pub(crate) max_clients: usize,
    pub(crate) session_ttl: Duration,
    pub(crate) env: EnvConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pipeline: None,
            is_master: false,
            registry_addr: None,
            register_interval: Duration::from_secs(3),
            gate_addr: None,
            components: Components::new(),
            label: String::new(),
            monitor_addr: None,
            websocket: WebsocketOptions::default(),
            max_clients: 1024,
            session_ttl: Duration::from_secs(2 * 60 * 60),
            env: EnvConfig::default(),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound/outbound middleware chains.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Make this node the cluster master (the Hub).
    pub fn with_master(mut self) -> Self {
        self.is_master = true;
        self
    }

    /// Address of the master to register with; members retry at the
    /// register interval until admitted.
    pub fn with_registry_addr(mut self, addr: impl Into<String>) -> Self {
        self.registry_addr = Some(addr.into());
        self
    }

    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    /// Address clients connect to. A node without one hosts services
    /// only (unless it runs standalone, where the service address doubles
    /// as the gate).
    pub fn with_gate_addr(mut self, addr: impl Into<String>) -> Self {
        self.gate_addr = Some(addr.into());
        self
    }

    pub fn with_components(mut self, components: Components) -> Self {
        self.components = components;
        self
    }

    /// Human-readable node label shown in cluster views.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Explicit monitor address; by default the monitor scans the ports
    /// just above the service port.
    pub fn with_monitor_addr(mut self, addr: impl Into<String>) -> Self {
        self.monitor_addr = Some(addr.into());
        self
    }

    /// Accept WebSocket connections on the gate instead of raw TCP.
    pub fn with_websocket(mut self) -> Self {
        self.websocket.enabled = true;
        self
    }

    /// URI path the WebSocket endpoint answers on, e.g. `ws`.
    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.websocket.path = path.into();
        self
    }

    /// TLS certificate and key for the gate. Certificate loading is the
    /// embedder's concern; the paths are carried for it.
    pub fn with_tls_config(mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.websocket.tls_certificate = Some(certificate.into());
        self.websocket.tls_key = Some(key.into());
        self
    }

    /// Check the `Origin` header of WebSocket upgrades.
    pub fn with_check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.websocket.check_origin = Some(Arc::new(check));
        self
    }

    /// Target for the open-file-limit raise at startup.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Sessions idle longer than this are closed by the sweeper.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Interval between server heartbeats; a client silent for twice this
    /// long is dropped.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.env.heartbeat = interval;
        self
    }

    /// Timer granularity for the scheduler. Cannot be below one
    /// millisecond (rejected at startup).
    pub fn with_timer_precision(mut self, precision: Duration) -> Self {
        self.env.timer_precision = precision;
        self
    }

    pub fn with_debug_mode(mut self) -> Self {
        self.env.debug = true;
        self
    }

    /// Gate id stamped into the upper 32 bits of session ids, making them
    /// unique cluster-wide.
    pub fn with_gate_id(mut self, gate_id: u16) -> Self {
        self.env.gate_id = gate_id;
        self
    }

    /// Route dictionary shared with clients; routes in it travel as two
    /// bytes on the wire.
    pub fn with_dictionary<I>(mut self, entries: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = (String, u16)>,
    {
        self.env.dictionary = Arc::new(Dictionary::new(entries)?);
        Ok(self)
    }

    /// Replace the payload serializer (JSON by default).
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.env.serializer = serializer;
        self
    }

    /// Validate the raw handshake payload; rejection closes the session.
    pub fn with_handshake_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[u8]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.env.handshake_validator = Some(Arc::new(validator) as HandshakeValidator);
        self
    }

    /// Extra fields merged into the handshake reply next to `code`/`sys`.
    pub fn with_handshake_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.env.handshake_data = data;
        self
    }
}
