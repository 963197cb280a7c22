//! Error types for the load-balancer

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid server URL: {0}")]
    ServerUrl(#[from] nodeway_core::Error),

    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP proxy has already been configured for this process")]
    HttpProxyAlreadySet,

    #[error("Invalid HTTP proxy {url}: {reason}")]
    InvalidHttpProxy { url: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
