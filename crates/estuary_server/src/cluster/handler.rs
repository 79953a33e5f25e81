//! Local handler: the node's dispatch table and serve loop.
//!
//! One `LocalHandler` per node holds every registered service, the route
//! table `Service.Method -> handler`, and the mirror of which remote
//! members provide which services. The serve loop owns the read side of
//! each client connection: bytes feed the packet decoder, packets walk
//! the agent's handshake state machine, and decoded messages either
//! dispatch to a local handler on a scheduler or forward over the cluster
//! bus to a member that has the service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use estuary_protocol::{Message, MessageType, Packet, PacketDecoder, PacketType};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::agent::{Agent, GateStream, STATUS_HANDSHAKE, STATUS_WORKING};
use super::node::NodeInner;
use super::rpc::{MemberInfo, RpcRequest};
use crate::component::{Component, ComponentOptions, Handler, Service};
use crate::error::ServerError;
use crate::pipeline::Pipeline;
use crate::session::{unix_now, NetworkEntity, Session};

/// Hands a message to the node's forwarding path. Agents and acceptors
/// call this for `notify`, which never touches the client socket.
pub(crate) type ForwardFn = Arc<dyn Fn(&Arc<Session>, Message) + Send + Sync>;

/// `"Service.Method"` -> `("Service", "Method")`, splitting on the last dot.
pub(crate) fn split_route(route: &str) -> Option<(&str, &str)> {
    let idx = route.rfind('.')?;
    let (service, method) = (&route[..idx], &route[idx + 1..]);
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// Which remote members provide which services.
#[derive(Default)]
pub(crate) struct RemoteRegistry {
    services: RwLock<HashMap<String, Vec<MemberInfo>>>,
}

impl RemoteRegistry {
    pub fn add_member(&self, member: &MemberInfo) {
        let mut services = self.services.write().unwrap();
        for service in &member.services {
            let providers = services.entry(service.clone()).or_default();
            providers.retain(|m| m.service_addr != member.service_addr);
            providers.push(member.clone());
            debug!(service = %service, addr = %member.service_addr, "remote service registered");
        }
    }

    pub fn del_member(&self, addr: &str) {
        let mut services = self.services.write().unwrap();
        services.retain(|_, providers| {
            providers.retain(|m| m.service_addr != addr);
            !providers.is_empty()
        });
    }

    pub fn find(&self, service: &str) -> Vec<MemberInfo> {
        self.services
            .read()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().unwrap().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn entries(&self) -> Vec<(String, MemberInfo)> {
        let services = self.services.read().unwrap();
        let mut entries: Vec<(String, MemberInfo)> = services
            .iter()
            .flat_map(|(name, providers)| providers.iter().map(|m| (name.clone(), m.clone())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Handler metadata for the debug monitor.
#[derive(Debug, Clone, Serialize)]
pub struct CompInfo {
    pub name: String,
    pub is_raw: bool,
    pub scheduler: Option<String>,
}

/// Remote provider metadata for the debug monitor.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteInfo {
    pub name: String,
    pub member: MemberInfo,
}

/// Container for all registered components and the dispatch logic.
pub(crate) struct LocalHandler {
    node: Arc<NodeInner>,
    pipeline: Option<Pipeline>,
    local_services: HashMap<String, Arc<Service>>,
    local_handlers: HashMap<String, Arc<Handler>>,
    remote: RemoteRegistry,
}

impl LocalHandler {
    pub fn new(node: Arc<NodeInner>, pipeline: Option<Pipeline>) -> Self {
        Self {
            node,
            pipeline,
            local_services: HashMap::new(),
            local_handlers: HashMap::new(),
            remote: RemoteRegistry::default(),
        }
    }

    /// Register one component's service. Duplicate service names reject
    /// the whole startup.
    pub fn register(
        &mut self,
        component: Arc<dyn Component>,
        options: &ComponentOptions,
    ) -> Result<(), ServerError> {
        let service = Service::build(component, options)?;
        if self.local_services.contains_key(&service.name) {
            return Err(ServerError::DuplicateService(service.name));
        }
        for (method, handler) in &service.handlers {
            let route = format!("{}.{}", service.name, method);
            info!(route = %route, "local handler registered");
            self.local_handlers.insert(route, handler.clone());
        }
        self.local_services.insert(service.name.clone(), Arc::new(service));
        Ok(())
    }

    pub fn local_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local_services.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn remote_service_names(&self) -> Vec<String> {
        self.remote.service_names()
    }

    pub fn find_handler(&self, route: &str) -> Option<Arc<Handler>> {
        self.local_handlers.get(route).cloned()
    }

    pub fn init_remote_services(&self, members: &[MemberInfo]) {
        for member in members {
            self.remote.add_member(member);
        }
    }

    pub fn add_remote_service(&self, member: &MemberInfo) {
        self.remote.add_member(member);
    }

    pub fn del_member(&self, addr: &str) {
        self.remote.del_member(addr);
    }

    /// Sorted handler list for the monitor.
    pub fn components(&self) -> Vec<CompInfo> {
        let mut infos = Vec::new();
        for name in self.local_service_names() {
            let service = &self.local_services[&name];
            for method in service.sorted_methods() {
                infos.push(CompInfo {
                    name: format!("{name}.{method}"),
                    is_raw: service.handlers[method].is_raw(),
                    scheduler: service.scheduler_name.clone(),
                });
            }
        }
        infos
    }

    /// Sorted remote provider list for the monitor.
    pub fn remotes(&self) -> Vec<RemoteInfo> {
        self.remote
            .entries()
            .into_iter()
            .map(|(name, member)| RemoteInfo { name, member })
            .collect()
    }

    pub(crate) fn forward_fn(self: &Arc<Self>) -> ForwardFn {
        let handler = self.clone();
        Arc::new(move |session, message| handler.remote_process(session, message))
    }

    /// Serve one accepted connection until it dies.
    pub(crate) async fn serve(self: Arc<Self>, stream: GateStream) {
        let env = self.node.env.clone();
        let forward = self.forward_fn();
        let (agent, session, mut reader) = Agent::spawn(
            env.clone(),
            self.node.scheduler.clone(),
            self.pipeline.clone(),
            forward,
            stream,
        );
        self.node.store_session(&session);
        if env.debug {
            debug!(
                session = session.id(),
                remote = %session.remote_addr(),
                "new session established"
            );
        }

        let mut decoder = PacketDecoder::new();
        let mut die = agent.subscribe_die();
        'serve: loop {
            tokio::select! {
                _ = die.changed() => break,
                chunk = reader.next_chunk() => {
                    let bytes = match chunk {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(session = session.id(), "read failed, session will close: {e}");
                            break;
                        }
                    };
                    let packets = match decoder.feed(&bytes) {
                        Ok(packets) => packets,
                        Err(e) => {
                            warn!(session = session.id(), "malformed stream: {e}");
                            break;
                        }
                    };
                    for packet in packets {
                        if let Err(e) = self.process_packet(&agent, &session, packet) {
                            warn!(session = session.id(), "fatal packet error: {e}");
                            break 'serve;
                        }
                    }
                }
            }
        }

        // Resource teardown happens exactly once, whatever killed the loop.
        self.notify_session_closed(session.id());
        self.node.remove_session(session.id());
        let _ = agent.close();
        if env.debug {
            debug!(session = session.id(), "session reader exited");
        }
    }

    /// Tell every cluster member this gate-owned session is gone.
    fn notify_session_closed(&self, session_id: i64) {
        for addr in self.node.membership.remote_addrs() {
            self.node
                .rpc_client
                .cast(&addr, RpcRequest::SessionClosed { session_id });
        }
    }

    pub(crate) fn process_packet(
        &self,
        agent: &Arc<Agent>,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<(), ServerError> {
        let env = &self.node.env;
        match packet.kind {
            PacketType::Handshake => {
                if let Some(validator) = &env.handshake_validator {
                    validator(&packet.data).map_err(ServerError::HandshakeRejected)?;
                }
                agent.send_raw(env.handshake_response().to_vec())?;
                agent.set_status(STATUS_HANDSHAKE);
                if env.debug {
                    debug!(session = session.id(), "session handshake");
                }
            }
            PacketType::HandshakeAck => {
                agent.set_status(STATUS_WORKING);
                if env.debug {
                    debug!(session = session.id(), "handshake ack received");
                }
            }
            PacketType::Data => {
                if agent.status() < STATUS_WORKING {
                    return Err(ServerError::DataBeforeAck);
                }
                let message = Message::decode(&packet.data, &env.dictionary)?;
                self.process_message(session, message);
            }
            // Pure keepalive; receipt alone refreshes the activity clock.
            PacketType::Heartbeat => {}
            PacketType::Kick => {}
        }

        let now = unix_now();
        agent.touch(now);
        session.touch(now);
        Ok(())
    }

    pub(crate) fn process_message(&self, session: &Arc<Session>, message: Message) {
        let last_mid = match message.kind {
            MessageType::Request => message.id,
            MessageType::Notify => 0,
            _ => {
                warn!(kind = ?message.kind, "client sent a server-side message type");
                return;
            }
        };
        let Some(route) = message.route.as_deref() else {
            warn!("routed message without route");
            return;
        };
        match self.local_handlers.get(route) {
            Some(handler) => self.local_process(handler.clone(), last_mid, session.clone(), message),
            None => self.remote_process(session, message),
        }
    }

    /// Dispatch to a local handler, on the main scheduler or on the
    /// session executor named by the service.
    pub(crate) fn local_process(
        &self,
        handler: Arc<Handler>,
        last_mid: u64,
        session: Arc<Session>,
        mut message: Message,
    ) {
        if let Some(pipeline) = &self.pipeline {
            if let Err(e) = pipeline.inbound().process(&session, &mut message) {
                warn!("inbound pipeline failed: {e}");
                return;
            }
        }

        let Some(route) = message.route.clone() else {
            warn!("routed message without route");
            return;
        };
        let scheduler_name = match split_route(&route) {
            Some((service_name, _)) => self
                .local_services
                .get(service_name)
                .and_then(|s| s.scheduler_name.clone()),
            None => {
                warn!(route = %route, "invalid route");
                return;
            }
        };

        let env = self.node.env.clone();
        let payload = message.data;
        let task_session = session.clone();
        let task = Box::new(move || {
            // The handler may respond without naming a request id; point
            // the entity at the one we are serving.
            task_session.entity().set_last_mid(last_mid);
            if let Err(e) = handler.call(&task_session, payload, &env) {
                error!(route = %route, "service handler error: {e}");
            }
        });

        match scheduler_name {
            Some(scheduler_name) => match session.scheduler(&scheduler_name) {
                Some(local) => local.schedule(task),
                None => {
                    error!(
                        session = session.id(),
                        scheduler = %scheduler_name,
                        "session has no such scheduler capability"
                    );
                }
            },
            None => self.node.scheduler.run(task),
        }
    }

    /// Forward a message to a member that provides its service, sticky per
    /// session.
    pub(crate) fn remote_process(&self, session: &Arc<Session>, message: Message) {
        let Some(route) = message.route.as_deref() else {
            warn!("cannot forward a message without a route");
            return;
        };
        let Some((service, _)) = split_route(route) else {
            warn!(route, "invalid route");
            return;
        };

        let members = self.remote.find(service);
        if members.is_empty() {
            warn!(route, "service not found (forgot to register?)");
            return;
        }

        let remote_addr = match session.router().find(service) {
            Some(addr) => addr,
            None => {
                let pick = rand::thread_rng().gen_range(0..members.len());
                let addr = members[pick].service_addr.clone();
                session.router().bind(service, &addr);
                addr
            }
        };

        // A session that is itself gate-forwarded keeps its origin, so
        // the next hop can answer the real client.
        let (gate_addr, session_id) = session
            .entity()
            .gate_origin()
            .unwrap_or_else(|| (self.node.service_addr.clone(), session.id()));

        let request = match message.kind {
            MessageType::Request => RpcRequest::HandleRequest {
                gate_addr,
                session_id,
                id: message.id,
                route: route.to_string(),
                data: message.data,
            },
            MessageType::Notify => RpcRequest::HandleNotify {
                gate_addr,
                session_id,
                route: route.to_string(),
                data: message.data,
            },
            _ => {
                warn!(kind = ?message.kind, "only requests and notifies forward");
                return;
            }
        };
        self.node.rpc_client.cast(&remote_addr, request);
    }
}
