//! Cluster membership.
//!
//! The master owns the authoritative member list: registration appends and
//! broadcasts `NewMember`, unregistration and heartbeat expiry remove and
//! broadcast `DelMember`. Every other node keeps a mirror of the list,
//! maintained by those broadcasts. Both roles share this structure; only
//! the master calls the mutating-and-broadcasting half.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::rpc::{MemberInfo, RpcClient, RpcRequest};
use crate::error::ServerError;

struct MemberEntry {
    info: MemberInfo,
    last_heartbeat: Instant,
}

pub(crate) struct Membership {
    self_addr: String,
    heartbeat_deadline: Duration,
    rpc_client: Arc<RpcClient>,
    members: RwLock<Vec<MemberEntry>>,
}

impl Membership {
    pub fn new(self_addr: String, heartbeat_deadline: Duration, rpc_client: Arc<RpcClient>) -> Self {
        Self {
            self_addr,
            heartbeat_deadline,
            rpc_client,
            members: RwLock::new(Vec::new()),
        }
    }

    /// The master seeds its own entry so newcomers learn its services.
    pub fn seed_self(&self, info: MemberInfo) {
        self.members.write().unwrap().push(MemberEntry {
            info,
            last_heartbeat: Instant::now(),
        });
    }

    /// Master: admit a member. Pre-existing members are told about the
    /// newcomer; the full list (newcomer included) is returned for its
    /// initial routing table. Re-registration replaces the stale entry.
    pub fn register(&self, member: MemberInfo) -> Vec<MemberInfo> {
        let mut members = self.members.write().unwrap();
        let rejoin = members.iter().any(|m| m.info.service_addr == member.service_addr);
        members.retain(|m| m.info.service_addr != member.service_addr);

        if !rejoin {
            for existing in members.iter() {
                if existing.info.service_addr != self.self_addr {
                    self.rpc_client.cast(
                        &existing.info.service_addr,
                        RpcRequest::NewMember { member: member.clone() },
                    );
                }
            }
        }

        info!(addr = %member.service_addr, label = %member.label, rejoin, "member registered");
        members.push(MemberEntry {
            info: member,
            last_heartbeat: Instant::now(),
        });
        members.iter().map(|m| m.info.clone()).collect()
    }

    /// Master: drop a member and tell the survivors.
    pub fn unregister(&self, addr: &str) -> Result<(), ServerError> {
        let mut members = self.members.write().unwrap();
        let before = members.len();
        members.retain(|m| m.info.service_addr != addr);
        if members.len() == before {
            return Err(ServerError::Rpc(format!("member not found: {addr}")));
        }
        info!(%addr, "member unregistered");
        for remaining in members.iter() {
            if remaining.info.service_addr != self.self_addr {
                self.rpc_client.cast(
                    &remaining.info.service_addr,
                    RpcRequest::DelMember {
                        service_addr: addr.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Master: stamp a member's liveness.
    pub fn heartbeat(&self, addr: &str) {
        let mut members = self.members.write().unwrap();
        if let Some(entry) = members.iter_mut().find(|m| m.info.service_addr == addr) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Master: evict members whose heartbeat went quiet, broadcasting
    /// their departure. Returns the evicted addresses so the caller can
    /// purge its own routing tables.
    pub fn sweep_stale(&self) -> Vec<String> {
        let deadline = Instant::now() - self.heartbeat_deadline;
        let mut members = self.members.write().unwrap();
        let mut evicted = Vec::new();
        members.retain(|m| {
            if m.info.service_addr == self.self_addr || m.last_heartbeat >= deadline {
                true
            } else {
                evicted.push(m.info.service_addr.clone());
                false
            }
        });
        for addr in &evicted {
            warn!(%addr, "member heartbeat expired, evicting");
            for remaining in members.iter() {
                if remaining.info.service_addr != self.self_addr {
                    self.rpc_client.cast(
                        &remaining.info.service_addr,
                        RpcRequest::DelMember {
                            service_addr: addr.clone(),
                        },
                    );
                }
            }
        }
        evicted
    }

    /// Member: adopt the list returned by registration.
    pub fn init_members(&self, infos: Vec<MemberInfo>) {
        let now = Instant::now();
        *self.members.write().unwrap() = infos
            .into_iter()
            .map(|info| MemberEntry {
                info,
                last_heartbeat: now,
            })
            .collect();
    }

    /// Member: mirror a master broadcast.
    pub fn add_member(&self, info: MemberInfo) {
        let mut members = self.members.write().unwrap();
        members.retain(|m| m.info.service_addr != info.service_addr);
        members.push(MemberEntry {
            info,
            last_heartbeat: Instant::now(),
        });
    }

    /// Member: mirror a master broadcast.
    pub fn del_member(&self, addr: &str) {
        self.members
            .write()
            .unwrap()
            .retain(|m| m.info.service_addr != addr);
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.read().unwrap().iter().map(|m| m.info.clone()).collect()
    }

    /// Every member address except this node's own.
    pub fn remote_addrs(&self) -> Vec<String> {
        self.members
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.info.service_addr != self.self_addr)
            .map(|m| m.info.service_addr.clone())
            .collect()
    }
}
