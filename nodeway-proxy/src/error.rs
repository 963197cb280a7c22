use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Address(#[from] nodeway_core::Error),

    #[error("load balancer error: {0}")]
    LoadBalancer(#[from] nodeway_loadbalancer::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
