//! Node lifecycle.
//!
//! A node is one process in an estuary deployment. Depending on its
//! options it plays one of four roles: `Standalone` (no cluster at all),
//! `Hub` (the master owning membership), `Gate` (terminates client
//! connections) or `Backend` (hosts services behind gates). One codebase,
//! one startup path; the roles differ only in which listeners come up.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use estuary_protocol::Message;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::acceptor::Acceptor;
use super::agent::GateStream;
use super::handler::LocalHandler;
use super::master::Membership;
use super::monitor;
use super::rpc::{self, MemberInfo, RpcClient, RpcDispatch, RpcReply, RpcRequest};
use crate::component::{Component, ComponentOptions};
use crate::env::NodeEnv;
use crate::error::ServerError;
use crate::options::{Options, WebsocketOptions};
use crate::scheduler::Scheduler;
use crate::session::{unix_now, NetworkEntity, Session};

/// Stale sessions are collected on this cadence.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(67);

/// Connection pools to departed members are collected on this cadence.
const POOL_SHRINK_INTERVAL: Duration = Duration::from_secs(61);

/// Session row in the monitor view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: i64,
    pub uid: i64,
    pub remote_addr: String,
    pub last_time: i64,
}

/// Shared node state, referenced by the handler, the RPC dispatch and the
/// monitor.
pub(crate) struct NodeInner {
    pub env: Arc<NodeEnv>,
    pub scheduler: Scheduler,
    pub label: String,
    pub service_addr: String,
    pub gate_addr: Option<String>,
    pub is_master: bool,
    pub registry_addr: Option<String>,
    pub register_interval: Duration,
    pub monitor_addr: Option<String>,
    pub websocket: WebsocketOptions,
    pub session_ttl: Duration,
    pub sessions: DashMap<i64, Arc<Session>>,
    pub rpc_client: Arc<RpcClient>,
    pub membership: Membership,
    pub started_at: SystemTime,
    handler: OnceLock<Arc<LocalHandler>>,
}

impl NodeInner {
    pub fn handler(&self) -> Arc<LocalHandler> {
        self.handler
            .get()
            .expect("handler is set before any listener starts")
            .clone()
    }

    pub fn store_session(&self, session: &Arc<Session>) {
        self.sessions.insert(session.id(), session.clone());
    }

    pub fn remove_session(&self, id: i64) {
        self.sessions.remove(&id);
    }

    pub fn find_session(&self, id: i64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Look up a forwarded session or materialize its acceptor, keyed by
    /// the gate-assigned id.
    pub fn find_or_create_session(self: &Arc<Self>, sid: i64, gate_addr: &str) -> Arc<Session> {
        match self.sessions.entry(sid) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let forward = self.handler().forward_fn();
                let acceptor = Acceptor::new(sid, gate_addr.to_string(), self.rpc_client.clone(), forward);
                let session = Session::with_id(
                    sid,
                    acceptor.clone() as Arc<dyn NetworkEntity>,
                    self.env.clone(),
                );
                acceptor.attach_session(&session);
                entry.insert(session.clone());
                session
            }
        }
    }

    /// "Standalone", "Hub", "Gate" or "Backend".
    pub fn node_type(&self) -> &'static str {
        if !self.is_master && self.registry_addr.is_none() {
            "Standalone"
        } else if self.is_master {
            "Hub"
        } else if self.gate_addr.is_some() {
            "Gate"
        } else {
            "Backend"
        }
    }

    /// Sessions sorted by id, for the monitor.
    pub fn session_infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionInfo {
                    id: s.id(),
                    uid: s.uid(),
                    remote_addr: s.remote_addr(),
                    last_time: s.last_time(),
                }
            })
            .collect();
        infos.sort_by_key(|s| s.id);
        infos
    }

    /// Close sessions idle longer than the configured TTL.
    fn remove_stale_sessions(&self) {
        let deadline = unix_now() - self.session_ttl.as_secs() as i64;
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_time() < deadline)
            .map(|entry| entry.value().clone())
            .collect();
        for session in stale {
            if self.env.debug {
                debug!(session = session.id(), uid = session.uid(), "closing stale session");
            }
            self.sessions.remove(&session.id());
            let _ = session.close();
        }
    }
}

#[async_trait]
impl RpcDispatch for Arc<NodeInner> {
    async fn dispatch(&self, request: RpcRequest) -> RpcReply {
        match request {
            RpcRequest::Register { member } => {
                if !self.is_master {
                    return RpcReply::Error("this node is not the master".to_string());
                }
                self.handler().add_remote_service(&member);
                RpcReply::Members(self.membership.register(member))
            }
            RpcRequest::Unregister { service_addr } => {
                if !self.is_master {
                    return RpcReply::Error("this node is not the master".to_string());
                }
                self.handler().del_member(&service_addr);
                match self.membership.unregister(&service_addr) {
                    Ok(()) => RpcReply::Ok,
                    Err(e) => RpcReply::Error(e.to_string()),
                }
            }
            RpcRequest::Heartbeat { service_addr } => {
                self.membership.heartbeat(&service_addr);
                RpcReply::Ok
            }
            RpcRequest::NewMember { member } => {
                self.handler().add_remote_service(&member);
                self.membership.add_member(member);
                RpcReply::Ok
            }
            RpcRequest::DelMember { service_addr } => {
                self.handler().del_member(&service_addr);
                self.membership.del_member(&service_addr);
                RpcReply::Ok
            }
            RpcRequest::HandleRequest {
                gate_addr,
                session_id,
                id,
                route,
                data,
            } => {
                let Some(handler) = self.handler().find_handler(&route) else {
                    return RpcReply::Error(ServerError::ServiceNotFound(route).to_string());
                };
                let session = self.find_or_create_session(session_id, &gate_addr);
                let message = Message::request(id, route, data);
                self.handler().local_process(handler, id, session, message);
                RpcReply::Ok
            }
            RpcRequest::HandleNotify {
                gate_addr,
                session_id,
                route,
                data,
            } => {
                let Some(handler) = self.handler().find_handler(&route) else {
                    return RpcReply::Error(ServerError::ServiceNotFound(route).to_string());
                };
                let session = self.find_or_create_session(session_id, &gate_addr);
                let message = Message::notify(route, data);
                self.handler().local_process(handler, 0, session, message);
                RpcReply::Ok
            }
            RpcRequest::HandlePush {
                session_id,
                route,
                data,
            } => match self.find_session(session_id) {
                Some(session) => match session.push_raw(&route, data) {
                    Ok(()) => RpcReply::Ok,
                    Err(e) => RpcReply::Error(e.to_string()),
                },
                None => RpcReply::Error(ServerError::SessionNotFound(session_id).to_string()),
            },
            RpcRequest::HandleResponse { session_id, id, data } => match self.find_session(session_id) {
                Some(session) => match session.response_mid_raw(id, data) {
                    Ok(()) => RpcReply::Ok,
                    Err(e) => RpcReply::Error(e.to_string()),
                },
                None => RpcReply::Error(ServerError::SessionNotFound(session_id).to_string()),
            },
            RpcRequest::SessionClosed { session_id } => {
                if let Some((_, session)) = self.sessions.remove(&session_id) {
                    let env = self.env.clone();
                    self.scheduler.run(Box::new(move || env.lifetime.close(&session)));
                }
                RpcReply::Ok
            }
            RpcRequest::CloseSession { session_id } => {
                if let Some((_, session)) = self.sessions.remove(&session_id) {
                    let _ = session.close();
                }
                RpcReply::Ok
            }
        }
    }
}

/// A running node.
pub struct Node {
    inner: Arc<NodeInner>,
    components: Vec<(Arc<dyn Component>, ComponentOptions)>,
}

impl Node {
    /// Bring a node up: validate the address, register components, join
    /// the cluster, open the gate, start the housekeeping timers.
    pub async fn startup(service_addr: &str, options: Options) -> Result<Self, ServerError> {
        validate_listen_addr(service_addr).await?;

        let Options {
            pipeline,
            is_master,
            registry_addr,
            register_interval,
            gate_addr,
            components,
            label,
            monitor_addr,
            websocket,
            max_clients,
            session_ttl,
            env: env_config,
        } = options;

        let env = NodeEnv::build(env_config)?;
        let scheduler = Scheduler::new(env.timer_precision);
        let rpc_client = RpcClient::new();
        // A backend missing this many register intervals of heartbeats is
        // declared dead by the master.
        let heartbeat_deadline = register_interval * 4;
        let membership = Membership::new(service_addr.to_string(), heartbeat_deadline, rpc_client.clone());

        if websocket.tls_certificate.is_some() || websocket.tls_key.is_some() {
            warn!("gate TLS termination is not built in; terminate TLS at a fronting proxy");
        }

        let inner = Arc::new(NodeInner {
            env: env.clone(),
            scheduler: scheduler.clone(),
            label,
            service_addr: service_addr.to_string(),
            gate_addr: gate_addr.clone(),
            is_master,
            registry_addr: registry_addr.clone(),
            register_interval,
            monitor_addr,
            websocket,
            session_ttl,
            sessions: DashMap::new(),
            rpc_client: rpc_client.clone(),
            membership,
            started_at: SystemTime::now(),
            handler: OnceLock::new(),
        });

        let component_list: Vec<(Arc<dyn Component>, ComponentOptions)> = components
            .list()
            .iter()
            .map(|(c, o)| (c.clone(), o.clone()))
            .collect();

        let mut handler = LocalHandler::new(inner.clone(), pipeline);
        for (component, comp_options) in &component_list {
            handler.register(component.clone(), comp_options)?;
        }
        let handler = Arc::new(handler);
        inner
            .handler
            .set(handler.clone())
            .unwrap_or_else(|_| unreachable!("handler set once"));

        raise_fd_limit(max_clients);

        // Cluster plane: the bus listener, plus role-specific startup.
        if inner.is_master || inner.registry_addr.is_some() {
            let listener = TcpListener::bind(&inner.service_addr).await?;
            tokio::spawn(rpc::serve(
                listener,
                Arc::new(inner.clone()) as Arc<dyn RpcDispatch>,
                env.subscribe_die(),
            ));

            if inner.is_master {
                inner.membership.seed_self(MemberInfo {
                    label: inner.label.clone(),
                    service_addr: inner.service_addr.clone(),
                    services: handler.local_service_names(),
                    is_master: true,
                });
                let sweep_inner = inner.clone();
                scheduler.repeat(
                    move || {
                        for addr in sweep_inner.membership.sweep_stale() {
                            sweep_inner.handler().del_member(&addr);
                        }
                    },
                    heartbeat_deadline,
                );
            } else if let Some(registry) = inner.registry_addr.clone() {
                register_with_master(&inner, &handler, &registry).await;

                let hb_client = rpc_client.clone();
                let hb_addr = inner.service_addr.clone();
                scheduler.repeat(
                    move || {
                        hb_client.cast(
                            &registry,
                            RpcRequest::Heartbeat {
                                service_addr: hb_addr.clone(),
                            },
                        );
                    },
                    register_interval,
                );
            }
        }

        // Gate listener: where clients connect.
        if let Some(gate) = inner.gate_addr.clone() {
            let listener = TcpListener::bind(&gate).await?;
            tokio::spawn(gate_accept_loop(listener, inner.clone(), env.subscribe_die()));
            info!(node_type = inner.node_type(), "gate listening on {gate}");
        }

        // Components come alive only after the node is wired up.
        for (component, _) in &component_list {
            component.init();
        }
        for (component, _) in &component_list {
            component.after_init();
        }

        // Housekeeping.
        let sweep = inner.clone();
        scheduler.repeat(move || sweep.remove_stale_sessions(), SESSION_SWEEP_INTERVAL);
        let shrink = inner.clone();
        scheduler.repeat(
            move || {
                let live: HashSet<String> = shrink.membership.remote_addrs().into_iter().collect();
                shrink.rpc_client.shrink_to(&live);
            },
            POOL_SHRINK_INTERVAL,
        );

        tokio::spawn(monitor::start(inner.clone()));

        info!(
            node_type = inner.node_type(),
            service_addr = %inner.service_addr,
            "🚀 node started"
        );
        Ok(Self {
            inner,
            components: component_list,
        })
    }

    /// Reverse-order component hooks, cluster goodbye, stop everything.
    pub async fn shutdown(&self) {
        info!("🛑 node shutting down");
        for (component, _) in self.components.iter().rev() {
            component.before_shutdown();
        }
        for (component, _) in self.components.iter().rev() {
            component.shutdown();
        }

        if !self.inner.is_master {
            if let Some(registry) = &self.inner.registry_addr {
                let result = self
                    .inner
                    .rpc_client
                    .call(
                        registry,
                        RpcRequest::Unregister {
                            service_addr: self.inner.service_addr.clone(),
                        },
                    )
                    .await;
                if let Err(e) = result {
                    warn!("unregister from master failed: {e}");
                }
            }
        }

        self.inner.env.shutdown();
        self.inner.scheduler.close();
        info!("✅ node stopped");
    }

    pub fn node_type(&self) -> &'static str {
        self.inner.node_type()
    }

    pub fn env(&self) -> Arc<NodeEnv> {
        self.inner.env.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.inner.scheduler.clone()
    }

    /// Cluster members as this node currently sees them.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.inner.membership.members()
    }

    /// Remote services this node can forward to.
    pub fn remote_services(&self) -> Vec<String> {
        self.inner.handler().remote_service_names()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

/// Dial the master until registration lands, clearing any stale entry
/// between attempts.
async fn register_with_master(inner: &Arc<NodeInner>, handler: &Arc<LocalHandler>, registry: &str) {
    let member = MemberInfo {
        label: inner.label.clone(),
        service_addr: inner.service_addr.clone(),
        services: handler.local_service_names(),
        is_master: false,
    };
    loop {
        match inner
            .rpc_client
            .call(registry, RpcRequest::Register { member: member.clone() })
            .await
        {
            Ok(RpcReply::Members(members)) => {
                handler.init_remote_services(&members);
                inner.membership.init_members(members);
                info!(registry, "registered with master");
                return;
            }
            Ok(other) => {
                warn!(registry, "unexpected register reply: {other:?}");
            }
            Err(e) => {
                warn!(
                    registry,
                    "register failed: {e}, retrying in {:?}", inner.register_interval
                );
            }
        }
        // A half-applied registration on the master would shadow the next
        // attempt; clear it first.
        let _ = inner
            .rpc_client
            .call(
                registry,
                RpcRequest::Unregister {
                    service_addr: inner.service_addr.clone(),
                },
            )
            .await;
        tokio::time::sleep(inner.register_interval).await;
    }
}

async fn gate_accept_loop(listener: TcpListener, inner: Arc<NodeInner>, mut die: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = die.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        serve_gate_conn(stream, inner).await;
                    });
                    debug!(%peer, "gate connection accepted");
                }
                Err(e) => {
                    error!("gate accept failed: {e}");
                }
            },
        }
    }
    debug!("gate listener stopped");
}

async fn serve_gate_conn(stream: TcpStream, inner: Arc<NodeInner>) {
    let handler = inner.handler();
    if inner.websocket.enabled {
        let path = inner.websocket.path.clone();
        let check_origin = inner.websocket.check_origin.clone();
        let callback = move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                             response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
            use tokio_tungstenite::tungstenite::http::StatusCode;

            if !path.is_empty() {
                let want = format!("/{}", path.trim_start_matches('/'));
                if req.uri().path() != want {
                    let mut reject = ErrorResponse::new(None);
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    return Err(reject);
                }
            }
            if let Some(check) = &check_origin {
                let origin = req
                    .headers()
                    .get("Origin")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if !check(origin) {
                    let mut reject = ErrorResponse::new(None);
                    *reject.status_mut() = StatusCode::FORBIDDEN;
                    return Err(reject);
                }
            }
            Ok(response)
        };
        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => handler.serve(GateStream::Ws(Box::new(ws))).await,
            Err(e) => debug!("websocket upgrade failed: {e}"),
        }
    } else {
        let _ = stream.set_nodelay(true);
        handler.serve(GateStream::Tcp(stream)).await;
    }
}

/// A node address must name an explicit, bindable port; picking one
/// automatically would leave cluster peers with nothing to dial.
async fn validate_listen_addr(addr: &str) -> Result<(), ServerError> {
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ServerError::InvalidAddress(format!("{addr}: missing port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ServerError::InvalidAddress(format!("{addr}: bad port")))?;
    if port == 0 {
        return Err(ServerError::InvalidAddress(format!(
            "{addr}: port number cannot be automatically chosen"
        )));
    }
    let probe = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::InvalidAddress(format!("{addr}: {e}")))?;
    drop(probe);
    Ok(())
}

/// Best-effort raise of the open-file limit toward `max_clients` plus
/// room for listeners, the bus and the monitor.
#[cfg(unix)]
fn raise_fd_limit(max_clients: usize) {
    const RESERVED: u64 = 64;
    let want = max_clients as u64 + RESERVED;

    // SAFETY: getrlimit/setrlimit with a valid struct pointer.
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            return;
        }
        let current = limit.rlim_cur as u64;
        if current >= want {
            return;
        }
        let hard = limit.rlim_max as u64;
        let mut target = if limit.rlim_max == libc::RLIM_INFINITY {
            want
        } else {
            want.min(hard)
        };
        while target > current {
            let request = libc::rlimit {
                rlim_cur: target as libc::rlim_t,
                rlim_max: limit.rlim_max,
            };
            if libc::setrlimit(libc::RLIMIT_NOFILE, &request) == 0 {
                info!(target, "raised open-file limit");
                return;
            }
            // Step down until the kernel accepts.
            target = current + (target - current) / 2;
        }
        warn!(want, current, "could not raise open-file limit");
    }
}

#[cfg(not(unix))]
fn raise_fd_limit(_max_clients: usize) {}
