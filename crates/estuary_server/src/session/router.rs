//! Sticky per-session routing.
//!
//! Once a session's message for some service lands on a backend, every
//! later message for that service from the same session goes to the same
//! backend instance. The binding lives for the life of the session.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct Router {
    table: RwLock<HashMap<String, String>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `service` to a backend address.
    pub fn bind(&self, service: &str, addr: &str) {
        self.table
            .write()
            .unwrap()
            .insert(service.to_string(), addr.to_string());
    }

    /// Look up the pinned address for `service`.
    pub fn find(&self, service: &str) -> Option<String> {
        self.table.read().unwrap().get(service).cloned()
    }
}
