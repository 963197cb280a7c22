//! Supervisor proxy
//!
//! Keeps the supervisor and API server URLs handed out to the rest of the
//! agent consistent with the discovered control-plane membership. When load
//! balancing is enabled both URLs point at local load-balancers, otherwise
//! they point straight at a backend.
//!
//! Mutable state sits behind one `RwLock`. `set_api_server_port` awaits
//! load-balancer construction, so it is serialized by a separate async gate
//! and only commits under the lock once construction has succeeded.

use std::path::PathBuf;
use std::sync::Arc;

use nodeway_core::address::{join_host_port, split_host_port, with_port};
use nodeway_core::EndpointUrl;
use nodeway_loadbalancer::{
    Balancer, BalancerFactory, HealthCheckFunc, API_SERVER_SERVICE_NAME, SUPERVISOR_SERVICE_NAME,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Default)]
struct State {
    api_server_enabled: bool,
    api_server_url: String,
    supervisor_url: String,
    api_server_port: Option<u16>,
    fallback_supervisor_address: String,
    supervisor_addresses: Vec<String>,
    api_server_lb: Option<Arc<dyn Balancer>>,
}

/// Endpoint steering for the supervisor and API server
pub struct SupervisorProxy {
    cancel: CancellationToken,
    factory: Arc<dyn BalancerFactory>,
    data_dir: PathBuf,
    lb_server_port: u16,
    initial_supervisor_url: EndpointUrl,
    supervisor_port: String,
    supervisor_lb: Option<Arc<dyn Balancer>>,
    state: RwLock<State>,
    api_server_gate: tokio::sync::Mutex<()>,
}

impl SupervisorProxy {
    /// Create the proxy for `supervisor_url`.
    ///
    /// With `lb_enabled` a supervisor load-balancer is started on
    /// `lb_server_port` (0 for an ephemeral port). The process-wide HTTP
    /// proxy must already have been installed with
    /// `nodeway_loadbalancer::set_http_proxy`.
    pub async fn new(
        cancel: CancellationToken,
        factory: Arc<dyn BalancerFactory>,
        lb_enabled: bool,
        data_dir: impl Into<PathBuf>,
        supervisor_url: &str,
        lb_server_port: u16,
        is_ipv6: bool,
    ) -> Result<Self> {
        let initial_supervisor_url = EndpointUrl::parse(supervisor_url)?;
        let data_dir = data_dir.into();

        let supervisor_lb = if lb_enabled {
            let lb = factory
                .create(
                    &cancel,
                    &data_dir,
                    SUPERVISOR_SERVICE_NAME,
                    supervisor_url,
                    lb_server_port,
                    is_ipv6,
                )
                .await?;
            Some(lb)
        } else {
            None
        };

        let supervisor_url = supervisor_lb
            .as_ref()
            .map_or_else(|| supervisor_url.to_string(), |lb| lb.local_url());

        let state = State {
            api_server_url: supervisor_url.clone(),
            supervisor_url,
            fallback_supervisor_address: initial_supervisor_url.host_port(),
            ..State::default()
        };

        let proxy = Self {
            cancel,
            factory,
            data_dir,
            lb_server_port,
            supervisor_port: initial_supervisor_url.port().to_string(),
            initial_supervisor_url,
            supervisor_lb,
            state: RwLock::new(state),
            api_server_gate: tokio::sync::Mutex::new(()),
        };

        tracing::debug!(
            supervisor_url = %proxy.supervisor_url(),
            api_server_url = %proxy.api_server_url(),
            lb_enabled,
            "Supervisor proxy created"
        );
        Ok(proxy)
    }

    /// Replace the known control-plane members.
    ///
    /// Once the API server is enabled the incoming addresses are assumed to
    /// carry the API server port and are re-pointed at the supervisor port
    /// for the supervisor side. Malformed entries are dropped.
    pub fn update(&self, addresses: &[String]) {
        let mut state = self.state.write();

        let supervisor_addresses = if state.api_server_enabled {
            with_port(addresses, &self.supervisor_port)
        } else {
            addresses.to_vec()
        };

        if let Some(lb) = &state.api_server_lb {
            lb.update(addresses);
        }
        if let Some(lb) = &self.supervisor_lb {
            lb.update(&supervisor_addresses);
        }

        state.supervisor_addresses = supervisor_addresses;
    }

    /// Enable the API server on `port`. Calls after the first success are
    /// no-ops.
    pub async fn set_api_server_port(&self, port: u16, is_ipv6: bool) -> Result<()> {
        let _gate = self.api_server_gate.lock().await;

        let existing_lb = {
            let state = self.state.read();
            if state.api_server_enabled {
                tracing::debug!(
                    api_server_port = ?state.api_server_port,
                    requested_port = port,
                    "Supervisor proxy apiserver port already set"
                );
                return Ok(());
            }
            state.api_server_lb.clone()
        };

        let api_server = EndpointUrl::parse(&self.initial_supervisor_url.with_port(port))?;

        let (api_server_url, created_lb) = if self.supervisor_lb.is_some() && existing_lb.is_none() {
            // 0 stays ephemeral
            let lb_port = self.lb_server_port.saturating_sub(1);
            let lb = self
                .factory
                .create(
                    &self.cancel,
                    &self.data_dir,
                    API_SERVER_SERVICE_NAME,
                    api_server.as_str(),
                    lb_port,
                    is_ipv6,
                )
                .await?;
            (lb.local_url(), Some(lb))
        } else {
            (api_server.as_str().to_string(), None)
        };

        let mut state = self.state.write();
        if created_lb.is_some() {
            state.api_server_lb = created_lb;
        }
        state.api_server_url = api_server_url;
        state.api_server_port = Some(port);
        state.api_server_enabled = true;

        tracing::debug!(
            supervisor_url = %state.supervisor_url,
            api_server_url = %state.api_server_url,
            lb_enabled = self.supervisor_lb.is_some(),
            "Supervisor proxy apiserver port changed"
        );
        Ok(())
    }

    /// Set the address used when no membership is known.
    ///
    /// Malformed addresses are logged and ignored.
    pub fn set_supervisor_default(&self, address: &str) {
        let host = match split_host_port(address) {
            Ok((host, _)) => host,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Failed to parse supervisor default address");
                return;
            }
        };

        let mut state = self.state.write();
        let address = if state.api_server_enabled {
            join_host_port(host, &self.supervisor_port)
        } else {
            address.to_string()
        };

        match &self.supervisor_lb {
            Some(lb) => lb.set_default(&address),
            None => state.supervisor_url = format!("https://{address}"),
        }
        state.fallback_supervisor_address = address;
    }

    /// Register `health_check` for a supervisor-port `address` on every
    /// load-balancer. The API server load-balancer gets the same host on the
    /// API server port.
    pub fn set_health_check(&self, address: &str, health_check: HealthCheckFunc) {
        if let Some(lb) = &self.supervisor_lb {
            lb.set_health_check(address, Arc::clone(&health_check));
        }

        let state = self.state.read();
        let Some(lb) = &state.api_server_lb else {
            return;
        };
        let Some(port) = state.api_server_port else {
            return;
        };
        match split_host_port(address) {
            Ok((host, _)) => lb.set_health_check(&join_host_port(host, &port.to_string()), health_check),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Failed to parse health check address");
            }
        }
    }

    #[must_use]
    pub fn supervisor_url(&self) -> String {
        self.state.read().supervisor_url.clone()
    }

    #[must_use]
    pub fn api_server_url(&self) -> String {
        self.state.read().api_server_url.clone()
    }

    /// Current supervisor members, or the default address when none are
    /// known. Never empty.
    #[must_use]
    pub fn supervisor_addresses(&self) -> Vec<String> {
        let state = self.state.read();
        if state.supervisor_addresses.is_empty() {
            vec![state.fallback_supervisor_address.clone()]
        } else {
            state.supervisor_addresses.clone()
        }
    }

    #[must_use]
    pub const fn is_supervisor_lb_enabled(&self) -> bool {
        self.supervisor_lb.is_some()
    }

    #[must_use]
    pub fn is_api_server_lb_enabled(&self) -> bool {
        self.state.read().api_server_lb.is_some()
    }

    #[must_use]
    pub fn api_server_enabled(&self) -> bool {
        self.state.read().api_server_enabled
    }
}
