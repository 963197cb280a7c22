//! Error types for address and URL handling

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },

    #[error("failed to parse {url}: {source}")]
    UrlParse {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to parse {url}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },
}

impl Error {
    pub(crate) fn address(address: &str, reason: &'static str) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
