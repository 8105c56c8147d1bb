//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds >= 1)
//! - Reject duplicate or unparsable upstreams
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::keepalive::PolicyError;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("keepalive.{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("keepalive policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("upstream #{index} has an empty name")]
    EmptyUpstreamName { index: usize },

    #[error("upstream '{0}' is defined more than once")]
    DuplicateUpstream(String),

    #[error("upstream '{name}' has invalid address '{address}'")]
    InvalidUpstreamAddress { name: String, address: String },

    #[error("upstream '{0}' must keep at least one connection")]
    ZeroConnections(String),

    #[error("reconnect.{0} must be greater than 0")]
    ZeroReconnect(&'static str),

    #[error("{field} '{value}' is not a valid socket address")]
    InvalidBindAddress { field: &'static str, value: String },
}

/// Validate a parsed config, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let keepalive = &config.keepalive;
    if keepalive.timeout_ms == 0 {
        errors.push(ValidationError::ZeroDuration("timeout_ms"));
    }
    if keepalive.interval_ms == 0 {
        errors.push(ValidationError::ZeroDuration("interval_ms"));
    }
    if let Err(e) = keepalive.policy().validate() {
        errors.push(e.into());
    }

    let mut seen = HashSet::new();
    for (index, upstream) in config.upstreams.iter().enumerate() {
        if upstream.name.trim().is_empty() {
            errors.push(ValidationError::EmptyUpstreamName { index });
        } else if !seen.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateUpstream(upstream.name.clone()));
        }
        if !is_host_port(&upstream.address) {
            errors.push(ValidationError::InvalidUpstreamAddress {
                name: upstream.name.clone(),
                address: upstream.address.clone(),
            });
        }
        if upstream.connections == 0 {
            errors.push(ValidationError::ZeroConnections(upstream.name.clone()));
        }
    }

    if config.reconnect.connect_timeout_ms == 0 {
        errors.push(ValidationError::ZeroReconnect("connect_timeout_ms"));
    }
    if config.reconnect.base_delay_ms == 0 {
        errors.push(ValidationError::ZeroReconnect("base_delay_ms"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidBindAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }
    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress {
            field: "admin.bind_address",
            value: config.admin.bind_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Accepts `ip:port` and `hostname:port`.
fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::UpstreamConfig;

    fn upstream(name: &str, address: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            address: address.to_string(),
            connections: 1,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.keepalive.timeout_ms = 0;
        config.keepalive.fail_count_to_close = 0;
        config.upstreams.push(upstream("a", "127.0.0.1:1000"));
        config.upstreams.push(upstream("a", "not an address"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroDuration("timeout_ms"),
                ValidationError::Policy(PolicyError::ZeroFailCount),
                ValidationError::DuplicateUpstream("a".into()),
                ValidationError::InvalidUpstreamAddress {
                    name: "a".into(),
                    address: "not an address".into(),
                },
            ]
        );
    }

    #[test]
    fn hostnames_are_accepted() {
        let mut config = ProxyConfig::default();
        config.upstreams.push(upstream("svc", "orders.internal:12200"));
        config.upstreams.push(upstream("v6", "[::1]:12200"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn admin_address_checked_only_when_enabled() {
        let mut config = ProxyConfig::default();
        config.admin.bind_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidBindAddress { field: "admin.bind_address", .. }));
    }
}
