//! The contract between the supervisor proxy and its load-balancers
//!
//! The proxy only ever sees `dyn Balancer` handles produced by a
//! `BalancerFactory`, so the local TCP balancer can be swapped out in tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::load_balancer::LoadBalancer;

/// Service name of the supervisor load-balancer
pub const SUPERVISOR_SERVICE_NAME: &str = "nodeway-agent-load-balancer";

/// Service name of the API server load-balancer
pub const API_SERVER_SERVICE_NAME: &str = "nodeway-api-server-agent-load-balancer";

/// Outcome of a single health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    /// Not enough information; server state is left alone
    Unknown,
    Failed,
    Ok,
}

/// Liveness probe for one backend address
pub type HealthCheckFunc = Arc<dyn Fn() -> HealthCheckResult + Send + Sync>;

/// A health check that never has an opinion
#[must_use]
pub fn unknown_health_check() -> HealthCheckFunc {
    Arc::new(|| HealthCheckResult::Unknown)
}

/// A running load-balancer for one logical backend service
pub trait Balancer: Send + Sync {
    /// Loopback URL clients use instead of any individual backend
    fn local_url(&self) -> String;

    /// Replace the backend membership. Never blocks on reachability.
    fn update(&self, addresses: &[String]);

    /// Attach a health check to a backend address. Unknown addresses are
    /// remembered until they join the membership.
    fn set_health_check(&self, address: &str, health_check: HealthCheckFunc);

    /// Designate the fallback backend used when health information is
    /// insufficient to choose.
    fn set_default(&self, address: &str);
}

/// Constructs load-balancers
#[async_trait]
pub trait BalancerFactory: Send + Sync {
    /// Start a load-balancer for `service_name`. `local_port` 0 requests an
    /// ephemeral port. The balancer stops when `cancel` fires.
    async fn create(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        service_name: &str,
        server_url: &str,
        local_port: u16,
        is_ipv6: bool,
    ) -> Result<Arc<dyn Balancer>>;
}

/// Tunables for the local load-balancer
#[derive(Debug, Clone)]
pub struct BalancerOptions {
    pub dial_timeout: Duration,
    pub health_check_interval: Duration,
    /// Consecutive failures before a server is marked failed
    pub failure_threshold: u32,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(5),
            failure_threshold: 2,
        }
    }
}

impl From<&nodeway_core::config::LoadBalancerConfig> for BalancerOptions {
    fn from(config: &nodeway_core::config::LoadBalancerConfig) -> Self {
        Self {
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            failure_threshold: config.failure_threshold.max(1),
        }
    }
}

/// Factory for the loopback TCP `LoadBalancer`
#[derive(Debug, Clone, Default)]
pub struct LocalBalancerFactory {
    options: BalancerOptions,
}

impl LocalBalancerFactory {
    #[must_use]
    pub const fn new(options: BalancerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BalancerFactory for LocalBalancerFactory {
    async fn create(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        service_name: &str,
        server_url: &str,
        local_port: u16,
        is_ipv6: bool,
    ) -> Result<Arc<dyn Balancer>> {
        let lb = LoadBalancer::new(
            cancel.clone(),
            data_dir,
            service_name,
            server_url,
            local_port,
            is_ipv6,
            self.options.clone(),
        )
        .await?;
        Ok(lb)
    }
}
