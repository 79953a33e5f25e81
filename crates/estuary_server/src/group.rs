//! Session groups.
//!
//! A `Group` is a named set of bound sessions, indexed by uid, used for
//! room- or channel-style fan-out. Broadcast failures on one member never
//! abort delivery to the rest. Membership reflects live sessions only: a
//! group wired to the node lifetime hooks drops members the moment their
//! session closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use tracing::warn;

use crate::env::NodeEnv;
use crate::error::ServerError;
use crate::serialize;
use crate::session::Session;

pub struct Group {
    name: String,
    closed: AtomicBool,
    members: RwLock<HashMap<i64, Arc<Session>>>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            closed: AtomicBool::new(false),
            members: RwLock::new(HashMap::new()),
        })
    }

    /// Create a group that automatically drops sessions when they close.
    pub fn with_lifetime_hook(name: impl Into<String>, env: &NodeEnv) -> Arc<Self> {
        let group = Self::new(name);
        let weak: Weak<Group> = Arc::downgrade(&group);
        env.lifetime.on_closed(move |session| {
            if let Some(group) = weak.upgrade() {
                let _ = group.leave(session);
            }
        });
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a bound session. Unbound sessions have no uid to key on.
    pub fn add(&self, session: &Arc<Session>) -> Result<(), ServerError> {
        self.check_open()?;
        let uid = session.uid();
        if uid == 0 {
            return Err(ServerError::SessionNotBound);
        }
        self.members.write().unwrap().insert(uid, session.clone());
        Ok(())
    }

    pub fn leave(&self, session: &Session) -> Result<(), ServerError> {
        self.check_open()?;
        self.members.write().unwrap().remove(&session.uid());
        Ok(())
    }

    pub fn leave_all(&self) -> Result<(), ServerError> {
        self.check_open()?;
        self.members.write().unwrap().clear();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn contains(&self, uid: i64) -> bool {
        self.members.read().unwrap().contains_key(&uid)
    }

    /// Member uids, in no particular order.
    pub fn members(&self) -> Vec<i64> {
        self.members.read().unwrap().keys().copied().collect()
    }

    /// Push `v` to every member. Per-session failures are logged and do
    /// not abort the fan-out.
    pub fn broadcast<T: Serialize>(&self, route: &str, v: &T) -> Result<(), ServerError> {
        self.multicast(route, v, |_| true)
    }

    /// Push `v` to every member accepted by `filter`.
    pub fn multicast<T, F>(&self, route: &str, v: &T, filter: F) -> Result<(), ServerError>
    where
        T: Serialize,
        F: Fn(&Session) -> bool,
    {
        self.check_open()?;
        let sessions: Vec<Arc<Session>> = self.members.read().unwrap().values().cloned().collect();
        let Some(first) = sessions.first() else {
            return Ok(());
        };

        // Every member lives on this node and shares its serializer, so
        // the payload is rendered once for the whole fan-out.
        let payload = serialize::marshal(first.env().serializer.as_ref(), v)?;
        for session in &sessions {
            if !filter(session) {
                continue;
            }
            if let Err(e) = session.push_raw(route, payload.clone()) {
                warn!(
                    group = %self.name,
                    session = session.id(),
                    uid = session.uid(),
                    route,
                    "broadcast to member failed: {e}"
                );
            }
        }
        Ok(())
    }

    /// Mark the group closed and drop its members. Later operations fail
    /// with `GroupClosed`.
    pub fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ServerError::GroupClosed);
        }
        self.members.write().unwrap().clear();
        Ok(())
    }

    fn check_open(&self) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::GroupClosed);
        }
        Ok(())
    }
}
