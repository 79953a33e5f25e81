//! Session lifetime hooks.
//!
//! Callbacks registered here run on the scheduler thread, once per session
//! close, in registration order. Groups use this to drop departed members;
//! applications use it to persist state or notify peers.

use std::sync::{Arc, Mutex};

use super::Session;

type LifetimeHandler = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

#[derive(Default)]
pub struct Lifetime {
    on_closed: Mutex<Vec<LifetimeHandler>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when any session closes.
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.on_closed.lock().unwrap().push(Box::new(handler));
    }

    /// Invoke every callback for `session`. Called from the scheduler
    /// thread by the closing entity, exactly once per session.
    pub(crate) fn close(&self, session: &Arc<Session>) {
        let handlers = self.on_closed.lock().unwrap();
        for handler in handlers.iter() {
            handler(session);
        }
    }
}
