//! Per-client session state.
//!
//! A `Session` is what handlers see: the client's identity, its attribute
//! map, and the ways to talk back to it. The network side lives behind the
//! [`NetworkEntity`] capability, which has two implementations — a direct
//! agent owning a raw connection, and an acceptor that proxies traffic
//! back to the owning gate over the cluster bus. Handlers never care
//! which one they hold.
//!
//! Attribute and scheduler maps are mutated from the scheduler thread that
//! owns the session, so the locks here are uncontended in practice; the
//! node-wide session index is a separate structure.

pub mod lifetime;
pub mod router;

pub use lifetime::Lifetime;
pub use router::Router;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::env::NodeEnv;
use crate::error::ServerError;
use crate::scheduler::LocalScheduler;
use crate::serialize;

/// The transport-side capability a session talks through.
///
/// Methods are synchronous: the direct agent enqueues onto its bounded
/// writer queue and the acceptor enqueues onto the RPC bus, so neither
/// blocks the caller.
pub trait NetworkEntity: Send + Sync {
    /// Queue a push message to the client.
    fn push(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError>;

    /// Fire an internal notify; this never touches the client socket.
    fn notify(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError>;

    /// Queue a response correlated with `mid`.
    fn response_mid(&self, mid: u64, data: Vec<u8>) -> Result<(), ServerError>;

    /// Tear the entity down. The second call is an error.
    fn close(&self) -> Result<(), ServerError>;

    fn remote_addr(&self) -> String;

    /// Id of the request whose handler is currently running.
    fn last_mid(&self) -> u64;

    fn set_last_mid(&self, mid: u64);

    /// `(gate_addr, session_id)` when this entity proxies for a gate;
    /// `None` for direct connections.
    fn gate_origin(&self) -> Option<(String, i64)> {
        None
    }
}

/// Per-client state exposed to handlers.
pub struct Session {
    id: i64,
    uid: AtomicI64,
    last_time: AtomicI64,
    entity: Arc<dyn NetworkEntity>,
    env: Arc<NodeEnv>,
    attributes: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    schedulers: Mutex<HashMap<String, Arc<dyn LocalScheduler>>>,
    router: Router,
}

impl Session {
    /// Create a session with a freshly allocated node-unique id.
    pub(crate) fn new(entity: Arc<dyn NetworkEntity>, env: Arc<NodeEnv>) -> Arc<Self> {
        let id = env.connections.session_id();
        Self::with_id(id, entity, env)
    }

    /// Create a session with a caller-chosen id. Used for acceptor-backed
    /// sessions, which reuse the gate-assigned id so one id identifies the
    /// client everywhere.
    pub(crate) fn with_id(id: i64, entity: Arc<dyn NetworkEntity>, env: Arc<NodeEnv>) -> Arc<Self> {
        Arc::new(Self {
            id,
            uid: AtomicI64::new(0),
            last_time: AtomicI64::new(unix_now()),
            entity,
            env,
            attributes: Mutex::new(HashMap::new()),
            schedulers: Mutex::new(HashMap::new()),
            router: Router::new(),
        })
    }

    /// Node-unique session id; upper 32 bits carry the gate id in cluster
    /// deployments.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Bound user id, zero while unbound.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    /// Bind a user id to this session. Rebinding replaces the previous uid.
    pub fn bind(&self, uid: i64) -> Result<(), ServerError> {
        if uid <= 0 {
            return Err(ServerError::IllegalUid(uid));
        }
        self.uid.store(uid, Ordering::Release);
        Ok(())
    }

    /// Unix timestamp of the last observed activity.
    pub fn last_time(&self) -> i64 {
        self.last_time.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now: i64) {
        self.last_time.store(now, Ordering::Release);
    }

    // ── Attributes ───────────────────────────────────────────────────

    pub fn set(&self, key: &str, value: impl Any + Send + Sync) {
        self.attributes
            .lock()
            .unwrap()
            .insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.attributes
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.attributes.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.attributes.lock().unwrap().remove(key).is_some()
    }

    // ── Scheduler capabilities ───────────────────────────────────────

    /// Attach a named executor. Services registered with a matching
    /// scheduler name dispatch this session's handlers through it.
    pub fn bind_scheduler(&self, name: &str, scheduler: Arc<dyn LocalScheduler>) {
        self.schedulers
            .lock()
            .unwrap()
            .insert(name.to_string(), scheduler);
    }

    pub fn scheduler(&self, name: &str) -> Option<Arc<dyn LocalScheduler>> {
        self.schedulers.lock().unwrap().get(name).cloned()
    }

    pub fn remove_scheduler(&self, name: &str) -> bool {
        self.schedulers.lock().unwrap().remove(name).is_some()
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Push a typed message to the client.
    pub fn push<T: Serialize>(&self, route: &str, v: &T) -> Result<(), ServerError> {
        let data = serialize::marshal(self.env.serializer.as_ref(), v)?;
        self.entity.push(route, data)
    }

    /// Push pre-serialized payload bytes.
    pub fn push_raw(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
        self.entity.push(route, data)
    }

    /// Fire a typed notify at another service, local or remote. The call
    /// is dispatched through the node, never written to the client.
    pub fn notify<T: Serialize>(&self, route: &str, v: &T) -> Result<(), ServerError> {
        let data = serialize::marshal(self.env.serializer.as_ref(), v)?;
        self.entity.notify(route, data)
    }

    /// Alias of [`Session::notify`], reading better at call sites that
    /// invoke another service as an internal RPC.
    pub fn rpc<T: Serialize>(&self, route: &str, v: &T) -> Result<(), ServerError> {
        self.notify(route, v)
    }

    /// Respond to the request whose handler is currently running.
    pub fn response<T: Serialize>(&self, v: &T) -> Result<(), ServerError> {
        self.response_mid(self.entity.last_mid(), v)
    }

    /// Respond to an explicit request id.
    pub fn response_mid<T: Serialize>(&self, mid: u64, v: &T) -> Result<(), ServerError> {
        let data = serialize::marshal(self.env.serializer.as_ref(), v)?;
        self.entity.response_mid(mid, data)
    }

    /// Respond with pre-serialized payload bytes.
    pub fn response_mid_raw(&self, mid: u64, data: Vec<u8>) -> Result<(), ServerError> {
        self.entity.response_mid(mid, data)
    }

    /// Close the underlying entity.
    pub fn close(&self) -> Result<(), ServerError> {
        self.entity.close()
    }

    pub fn remote_addr(&self) -> String {
        self.entity.remote_addr()
    }

    /// Sticky service-to-backend bindings for this session.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn entity(&self) -> &Arc<dyn NetworkEntity> {
        &self.entity
    }

    pub(crate) fn env(&self) -> &Arc<NodeEnv> {
        &self.env
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("remote_addr", &self.entity.remote_addr())
            .finish()
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A recording entity for tests across the crate.

    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    pub struct MockEntity {
        pub pushes: Mutex<Vec<(String, Vec<u8>)>>,
        pub notifies: Mutex<Vec<(String, Vec<u8>)>>,
        pub responses: Mutex<Vec<(u64, Vec<u8>)>>,
        pub closed: Mutex<u32>,
        pub last_mid: AtomicU64,
        pub fail_push: bool,
    }

    impl NetworkEntity for MockEntity {
        fn push(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
            if self.fail_push {
                return Err(ServerError::BrokenPipe);
            }
            self.pushes.lock().unwrap().push((route.to_string(), data));
            Ok(())
        }

        fn notify(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
            self.notifies.lock().unwrap().push((route.to_string(), data));
            Ok(())
        }

        fn response_mid(&self, mid: u64, data: Vec<u8>) -> Result<(), ServerError> {
            if mid == 0 {
                return Err(ServerError::SessionOnNotify);
            }
            self.responses.lock().unwrap().push((mid, data));
            Ok(())
        }

        fn close(&self) -> Result<(), ServerError> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }

        fn remote_addr(&self) -> String {
            "mock:0".to_string()
        }

        fn last_mid(&self) -> u64 {
            self.last_mid.load(Ordering::Acquire)
        }

        fn set_last_mid(&self, mid: u64) {
            self.last_mid.store(mid, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockEntity;
    use super::*;
    use crate::env::NodeEnv;

    fn session() -> (Arc<Session>, Arc<MockEntity>) {
        let env = NodeEnv::for_tests();
        let entity = Arc::new(MockEntity::default());
        let s = Session::new(entity.clone(), env);
        (s, entity)
    }

    #[test]
    fn bind_rejects_non_positive_uid() {
        let (s, _) = session();
        assert!(matches!(s.bind(0), Err(ServerError::IllegalUid(0))));
        assert!(matches!(s.bind(-3), Err(ServerError::IllegalUid(-3))));
        s.bind(9).unwrap();
        assert_eq!(s.uid(), 9);
    }

    #[test]
    fn attributes_round_trip() {
        let (s, _) = session();
        s.set("room", 42i64);
        s.set("nick", "kelp".to_string());
        assert_eq!(s.get::<i64>("room"), Some(42));
        assert_eq!(s.get::<String>("nick"), Some("kelp".to_string()));
        // Wrong type reads as absent.
        assert_eq!(s.get::<String>("room"), None);
        assert!(s.remove("room"));
        assert!(!s.exists("room"));
        assert!(!s.remove("room"));
    }

    #[test]
    fn response_without_request_fails() {
        let (s, _) = session();
        let err = s.response(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ServerError::SessionOnNotify));
    }

    #[test]
    fn response_uses_current_mid() {
        let (s, entity) = session();
        entity.set_last_mid(7);
        s.response(&serde_json::json!({"ok": true})).unwrap();
        let responses = entity.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, 7);
    }

    #[test]
    fn push_serializes_through_env() {
        let (s, entity) = session();
        s.push("Chat.OnMessage", &serde_json::json!({"x": 1})).unwrap();
        let pushes = entity.pushes.lock().unwrap();
        assert_eq!(pushes[0].0, "Chat.OnMessage");
        let value: serde_json::Value = serde_json::from_slice(&pushes[0].1).unwrap();
        assert_eq!(value["x"], 1);
    }
}
