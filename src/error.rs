//! Error types for the telemetry core.
//!
//! Expected degradation (a full edge buffer, a rejected admission check inside
//! the limiter) is signalled with `bool` returns. The types here cover what
//! callers actually have to handle.

use thiserror::Error;

/// Admission denied by the per-tenant token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API rate limit exceeded for tenant '{tenant_id}'")]
pub struct RateLimitExceeded {
    pub tenant_id: String,
}

/// Error returned by [`crate::instrument::Instrumentation::run`].
///
/// `Operation` carries the wrapped operation's own error untouched.
#[derive(Debug, Error)]
pub enum InstrumentError<E> {
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error("{0}")]
    Operation(E),
}

impl<E: std::fmt::Display> InstrumentError<E> {
    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            InstrumentError::RateLimited(_) => {
                "API Rate Limit Exceeded. Please upgrade your plan.".to_string()
            }
            InstrumentError::Operation(e) => e.to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, InstrumentError::RateLimited(_))
    }

    /// Unwrap the operation's error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            InstrumentError::Operation(e) => Some(e),
            InstrumentError::RateLimited(_) => None,
        }
    }
}

/// A batch could not be delivered upstream by the edge uplink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UplinkError {
    #[error("uplink unreachable: {0}")]
    Unreachable(String),
    #[error("uplink rejected batch of {size}: {reason}")]
    Rejected { size: usize, reason: String },
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_display_names_tenant() {
        let e = RateLimitExceeded { tenant_id: "basic-01".into() };
        assert_eq!(e.to_string(), "API rate limit exceeded for tenant 'basic-01'");
    }

    #[test]
    fn test_user_message_rate_limited_mentions_upgrade() {
        let e: InstrumentError<std::io::Error> =
            RateLimitExceeded { tenant_id: "t".into() }.into();
        assert!(e.is_rate_limited());
        assert!(e.user_message().contains("upgrade your plan"));
    }

    #[test]
    fn test_user_message_operation_passes_through() {
        let e: InstrumentError<String> = InstrumentError::Operation("Module Disabled".into());
        assert_eq!(e.user_message(), "Module Disabled");
        assert_eq!(e.to_string(), "Module Disabled");
        assert_eq!(e.into_operation().as_deref(), Some("Module Disabled"));
    }

    #[test]
    fn test_uplink_rejected_display() {
        let e = UplinkError::Rejected { size: 50, reason: "quota".into() };
        assert_eq!(e.to_string(), "uplink rejected batch of 50: quota");
    }

    #[test]
    fn test_config_invalid_display() {
        let e = ConfigError::Invalid("trace_capacity must be > 0".into());
        assert_eq!(e.to_string(), "invalid config: trace_capacity must be > 0");
    }
}
