pub mod balancer;
pub mod dialer;
pub mod error;
pub mod health;
pub mod http_proxy;
pub mod load_balancer;
pub mod servers;
pub mod state_file;

pub use balancer::{
    Balancer, BalancerFactory, BalancerOptions, HealthCheckFunc, HealthCheckResult,
    LocalBalancerFactory, API_SERVER_SERVICE_NAME, SUPERVISOR_SERVICE_NAME,
};
pub use error::{Error, Result};
pub use health::{tcp_health_check, HealthProbeConfig};
pub use http_proxy::set_http_proxy;
pub use load_balancer::LoadBalancer;
pub use servers::{ServerList, ServerState};
