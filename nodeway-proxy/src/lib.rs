//! Supervisor and API server endpoint steering for the node agent
//!
//! `SupervisorProxy` tracks control-plane membership and hands out stable
//! URLs for the supervisor and API server, backed by local load-balancers
//! when load balancing is enabled.

pub mod error;
pub mod supervisor;

#[cfg(test)]
pub mod test_helpers;

pub use error::{Error, Result};
pub use supervisor::SupervisorProxy;
