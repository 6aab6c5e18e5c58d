//! Outbound proxy pool.
//!
//! [`ProxyEndpoint`] describes a proxy and knows how to parse the notations
//! found in configuration; [`ProxyRotator`] owns the pool and its health.

mod endpoint;
mod rotator;

pub use endpoint::{ProxyCredentials, ProxyEndpoint, ProxyScheme};
pub use rotator::{
    EndpointStatus, ProxyRotator, ProxyRotatorConfig, DEFAULT_COOLDOWN_SECS,
    DEFAULT_FAILURE_THRESHOLD,
};
