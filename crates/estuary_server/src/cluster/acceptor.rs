//! Remote virtual connection.
//!
//! When a gate forwards a client message to a backend, the backend
//! materializes an acceptor: a network entity with the same contract as a
//! direct agent, except outbound traffic travels back to the owning gate
//! over the cluster bus. The acceptor carries the gate-assigned session
//! id, so the same id names the client on every node that has met it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use estuary_protocol::Message;
use tracing::debug;

use super::handler::ForwardFn;
use super::rpc::{RpcClient, RpcRequest};
use crate::error::ServerError;
use crate::session::{NetworkEntity, Session};

pub(crate) struct Acceptor {
    sid: i64,
    gate_addr: String,
    rpc_client: Arc<RpcClient>,
    forward: ForwardFn,
    last_mid: AtomicU64,
    session: OnceLock<Weak<Session>>,
}

impl Acceptor {
    pub(crate) fn new(
        sid: i64,
        gate_addr: String,
        rpc_client: Arc<RpcClient>,
        forward: ForwardFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            gate_addr,
            rpc_client,
            forward,
            last_mid: AtomicU64::new(0),
            session: OnceLock::new(),
        })
    }

    pub(crate) fn attach_session(&self, session: &Arc<Session>) {
        let _ = self.session.set(Arc::downgrade(session));
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }
}

impl NetworkEntity for Acceptor {
    fn push(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
        self.rpc_client.cast(
            &self.gate_addr,
            RpcRequest::HandlePush {
                session_id: self.sid,
                route: route.to_string(),
                data,
            },
        );
        Ok(())
    }

    // A notify from a backend handler may target a third node; it goes
    // back through the local forwarding path, not to the gate.
    fn notify(&self, route: &str, data: Vec<u8>) -> Result<(), ServerError> {
        let session = self.session().ok_or(ServerError::BrokenPipe)?;
        (self.forward)(&session, Message::notify(route, data));
        Ok(())
    }

    fn response_mid(&self, mid: u64, data: Vec<u8>) -> Result<(), ServerError> {
        if mid == 0 {
            return Err(ServerError::SessionOnNotify);
        }
        self.rpc_client.cast(
            &self.gate_addr,
            RpcRequest::HandleResponse {
                session_id: self.sid,
                id: mid,
                data,
            },
        );
        Ok(())
    }

    fn close(&self) -> Result<(), ServerError> {
        debug!(sid = self.sid, gate = %self.gate_addr, "closing remote session via gate");
        self.rpc_client.cast(
            &self.gate_addr,
            RpcRequest::CloseSession { session_id: self.sid },
        );
        Ok(())
    }

    fn remote_addr(&self) -> String {
        self.gate_addr.clone()
    }

    fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::Acquire)
    }

    fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::Release);
    }

    fn gate_origin(&self) -> Option<(String, i64)> {
        Some((self.gate_addr.clone(), self.sid))
    }
}
