pub mod address;
pub mod config;
pub mod error;
pub mod logging;

pub use address::EndpointUrl;
pub use config::Config;
pub use error::{Error, Result};
