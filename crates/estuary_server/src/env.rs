//! Node environment.
//!
//! Everything that is decided at boot and read-only afterwards lives here:
//! heartbeat cadence, the payload serializer, the route dictionary, the
//! handshake validator, and the pre-encoded handshake/heartbeat packets.
//! One `Arc<NodeEnv>` is threaded through every component instead of
//! process globals, so two nodes can coexist in one process (tests do
//! exactly that).

use std::sync::Arc;
use std::time::Duration;

use estuary_protocol::{packet, Dictionary, PacketType};
use serde_json::json;
use tokio::sync::broadcast;

use crate::error::ServerError;
use crate::serialize::{JsonSerializer, Serializer};
use crate::service::ConnectionService;
use crate::session::Lifetime;

/// Callback over the raw handshake payload; an `Err` closes the session.
pub type HandshakeValidator = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

/// Boot-time inputs for [`NodeEnv::build`].
pub(crate) struct EnvConfig {
    pub heartbeat: Duration,
    pub timer_precision: Duration,
    pub debug: bool,
    pub gate_id: u16,
    pub serializer: Arc<dyn Serializer>,
    pub handshake_validator: Option<HandshakeValidator>,
    pub dictionary: Arc<Dictionary>,
    /// Extra fields merged into the handshake reply next to `code`/`sys`.
    pub handshake_data: serde_json::Map<String, serde_json::Value>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            timer_precision: Duration::from_secs(1),
            debug: false,
            gate_id: 0,
            serializer: Arc::new(JsonSerializer),
            handshake_validator: None,
            dictionary: Arc::new(Dictionary::empty()),
            handshake_data: serde_json::Map::new(),
        }
    }
}

/// Boot-time immutable node state.
pub struct NodeEnv {
    pub heartbeat: Duration,
    pub timer_precision: Duration,
    pub debug: bool,
    pub gate_id: u16,
    pub serializer: Arc<dyn Serializer>,
    pub handshake_validator: Option<HandshakeValidator>,
    pub dictionary: Arc<Dictionary>,
    /// Session close hooks for this node.
    pub lifetime: Lifetime,
    pub(crate) connections: ConnectionService,
    die: broadcast::Sender<()>,
    handshake_response: Vec<u8>,
    heartbeat_packet: Vec<u8>,
}

impl NodeEnv {
    pub(crate) fn build(cfg: EnvConfig) -> Result<Arc<Self>, ServerError> {
        if cfg.timer_precision < Duration::from_millis(1) {
            return Err(ServerError::InvalidOption(
                "timer precision cannot be less than a millisecond".to_string(),
            ));
        }

        // The handshake reply the server sends to every client. App fields
        // ride along but cannot shadow the protocol-owned keys.
        let mut payload = serde_json::Map::new();
        payload.insert("code".to_string(), json!(200));
        payload.insert("sys".to_string(), json!({ "heartbeat": cfg.heartbeat.as_secs() }));
        for (key, value) in cfg.handshake_data {
            if key != "code" && key != "sys" {
                payload.insert(key, value);
            }
        }
        let body = serde_json::to_vec(&serde_json::Value::Object(payload))
            .map_err(|e| ServerError::Serialize(e.to_string()))?;
        let handshake_response = packet::encode(PacketType::Handshake, &body)?;
        let heartbeat_packet = packet::encode(PacketType::Heartbeat, &[])?;

        let (die, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            heartbeat: cfg.heartbeat,
            timer_precision: cfg.timer_precision,
            debug: cfg.debug,
            gate_id: cfg.gate_id,
            serializer: cfg.serializer,
            handshake_validator: cfg.handshake_validator,
            dictionary: cfg.dictionary,
            lifetime: Lifetime::new(),
            connections: ConnectionService::new(cfg.gate_id),
            die,
            handshake_response,
            heartbeat_packet,
        }))
    }

    /// Pre-encoded handshake reply packet.
    pub fn handshake_response(&self) -> &[u8] {
        &self.handshake_response
    }

    /// Pre-encoded heartbeat packet.
    pub fn heartbeat_packet(&self) -> &[u8] {
        &self.heartbeat_packet
    }

    /// Signal every writer and listener on this node to stop.
    pub fn shutdown(&self) {
        let _ = self.die.send(());
    }

    pub fn subscribe_die(&self) -> broadcast::Receiver<()> {
        self.die.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        Self::build(EnvConfig::default()).expect("default env builds")
    }
}
