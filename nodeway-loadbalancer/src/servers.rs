//! Backend membership and health state for one load-balancer

use std::collections::HashMap;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::balancer::{unknown_health_check, HealthCheckFunc, HealthCheckResult};

/// Health state of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No health information yet
    Unchecked,
    Healthy,
    Failed,
}

#[derive(Debug)]
struct Server {
    state: ServerState,
    failures: u32,
    /// Cancelled to close every proxied connection to this server
    connections: CancellationToken,
}

#[derive(Default)]
struct Inner {
    /// Dialable servers: the membership plus the default server
    servers: IndexMap<String, Server>,
    /// Last membership passed to `update`
    members: Vec<String>,
    default_server: String,
    active: Option<String>,
    /// Checks for current servers, plus registrations for addresses that
    /// have not joined yet. Dropped when their server is removed.
    health_checks: HashMap<String, HealthCheckFunc>,
}

/// Thread-safe server list
///
/// Dial order is: the active server if healthy, other healthy servers, the
/// default server, unchecked servers, then failed servers. Failed servers
/// are still dialed as a last resort.
pub struct ServerList {
    inner: RwLock<Inner>,
    failure_threshold: u32,
    root: CancellationToken,
}

impl ServerList {
    /// Create a list whose only member is `default_server`.
    ///
    /// Connection tokens are children of `root`.
    #[must_use]
    pub fn new(default_server: String, failure_threshold: u32, root: CancellationToken) -> Self {
        let mut servers = IndexMap::new();
        servers.insert(default_server.clone(), Self::new_server(&root));

        Self {
            inner: RwLock::new(Inner {
                servers,
                members: vec![default_server.clone()],
                default_server,
                ..Inner::default()
            }),
            failure_threshold: failure_threshold.max(1),
            root,
        }
    }

    fn new_server(root: &CancellationToken) -> Server {
        Server {
            state: ServerState::Unchecked,
            failures: 0,
            connections: root.child_token(),
        }
    }

    /// Replace the membership. Returns `true` if it changed.
    ///
    /// Empty and duplicate entries are ignored. State of retained servers is
    /// kept. Removed servers have their connections closed and their health
    /// check dropped.
    pub fn update(&self, addresses: &[String]) -> bool {
        let mut members: Vec<String> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !address.is_empty() && !members.contains(address) {
                members.push(address.clone());
            }
        }

        let mut inner = self.inner.write();
        if inner.members == members {
            return false;
        }

        let mut previous = std::mem::take(&mut inner.servers);
        let mut servers = IndexMap::with_capacity(members.len() + 1);
        for address in members.iter().chain(std::iter::once(&inner.default_server)) {
            if servers.contains_key(address) {
                continue;
            }
            let server = previous
                .shift_remove(address)
                .unwrap_or_else(|| Self::new_server(&self.root));
            servers.insert(address.clone(), server);
        }

        for (address, removed) in previous {
            tracing::debug!(server = %address, "Closing connections to removed server");
            removed.connections.cancel();
            inner.health_checks.remove(&address);
            if inner.active.as_deref() == Some(address.as_str()) {
                inner.active = None;
            }
        }

        inner.servers = servers;
        inner.members = members;
        true
    }

    /// Change the default server. Returns `true` if it changed.
    pub fn set_default(&self, address: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.default_server == address {
            return false;
        }

        let old = std::mem::replace(&mut inner.default_server, address.to_string());
        if !inner.members.contains(&old) {
            if let Some(removed) = inner.servers.shift_remove(&old) {
                removed.connections.cancel();
            }
            inner.health_checks.remove(&old);
            if inner.active.as_deref() == Some(old.as_str()) {
                inner.active = None;
            }
        }

        if !inner.servers.contains_key(address) {
            inner
                .servers
                .insert(address.to_string(), Self::new_server(&self.root));
        }
        true
    }

    pub fn set_health_check(&self, address: &str, health_check: HealthCheckFunc) {
        self.inner
            .write()
            .health_checks
            .insert(address.to_string(), health_check);
    }

    /// Current membership, as last passed to `update`
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().members.clone()
    }

    #[must_use]
    pub fn default_server(&self) -> String {
        self.inner.read().default_server.clone()
    }

    #[must_use]
    pub fn active(&self) -> Option<String> {
        self.inner.read().active.clone()
    }

    #[must_use]
    pub fn state(&self, address: &str) -> Option<ServerState> {
        self.inner.read().servers.get(address).map(|s| s.state)
    }

    /// Servers in dial order, each with the token that closes its connections
    #[must_use]
    pub fn candidates(&self) -> Vec<(String, CancellationToken)> {
        let inner = self.inner.read();
        let rank = |address: &str, server: &Server| match server.state {
            ServerState::Healthy if inner.active.as_deref() == Some(address) => 0,
            ServerState::Healthy => 1,
            ServerState::Failed => 4,
            ServerState::Unchecked if address == inner.default_server => 2,
            ServerState::Unchecked => 3,
        };

        let mut ranked: Vec<(u8, &String, &Server)> = inner
            .servers
            .iter()
            .map(|(address, server)| (rank(address, server), address, server))
            .collect();
        ranked.sort_by_key(|(rank, _, _)| *rank);

        ranked
            .into_iter()
            .map(|(_, address, server)| (address.clone(), server.connections.clone()))
            .collect()
    }

    /// A dial to `address` succeeded; it becomes the active server.
    pub fn record_success(&self, address: &str) {
        let mut inner = self.inner.write();
        let Some(server) = inner.servers.get_mut(address) else {
            return;
        };
        server.failures = 0;
        if server.state == ServerState::Failed {
            server.state = ServerState::Unchecked;
        }
        if inner.active.as_deref() != Some(address) {
            tracing::info!(server = %address, "Load balancer active server changed");
            inner.active = Some(address.to_string());
        }
    }

    /// A dial or health check against `address` failed.
    pub fn record_failure(&self, address: &str) {
        let mut inner = self.inner.write();
        self.apply_failure(&mut inner, address);
    }

    fn apply_failure(&self, inner: &mut Inner, address: &str) {
        let Some(server) = inner.servers.get_mut(address) else {
            return;
        };
        server.failures = server.failures.saturating_add(1);
        if server.failures < self.failure_threshold || server.state == ServerState::Failed {
            return;
        }

        tracing::warn!(
            server = %address,
            consecutive_failures = server.failures,
            "Server marked as failed, closing its connections"
        );
        server.state = ServerState::Failed;
        server.connections.cancel();
        server.connections = self.root.child_token();
        if inner.active.as_deref() == Some(address) {
            inner.active = None;
        }
    }

    /// Run every server's health check once and apply the results.
    ///
    /// Checks run outside the lock so they may call back into the list.
    pub fn run_health_checks(&self) {
        let checks: Vec<(String, HealthCheckFunc)> = {
            let inner = self.inner.read();
            inner
                .servers
                .keys()
                .map(|address| {
                    let check = inner
                        .health_checks
                        .get(address)
                        .cloned()
                        .unwrap_or_else(unknown_health_check);
                    (address.clone(), check)
                })
                .collect()
        };

        let results: Vec<(String, HealthCheckResult)> = checks
            .into_iter()
            .map(|(address, check)| {
                let result = check();
                (address, result)
            })
            .collect();

        let mut inner = self.inner.write();
        for (address, result) in results {
            match result {
                HealthCheckResult::Unknown => {}
                HealthCheckResult::Failed => self.apply_failure(&mut inner, &address),
                HealthCheckResult::Ok => {
                    let Some(server) = inner.servers.get_mut(&address) else {
                        continue;
                    };
                    server.failures = 0;
                    if server.state != ServerState::Healthy {
                        tracing::info!(server = %address, "Server is healthy");
                        server.state = ServerState::Healthy;
                    }
                }
            }
        }
    }
}
