//! Error taxonomy.
//!
//! Four classes drive what the scheduler does next:
//! - [`ConfigurationError`]: skip that rule for this tick, retry next tick.
//! - `Resolution`: the store is unreachable, abandon the whole tick.
//! - [`ProviderError`]: per-recipient, retried with backoff.
//! - `Race`: another worker holds the claim, skip silently.

use std::time::Duration;

/// Tenant configuration that cannot be evaluated or rendered.
///
/// Never retried within a tick. Heals once an administrator fixes the stored document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("malformed configuration document: {0}")]
    MalformedDocument(String),

    #[error("rule '{rule}' is malformed: {reason}")]
    MalformedRule { rule: String, reason: String },

    #[error("invalid time of day '{0}' (expected HH:MM)")]
    InvalidTimeOfDay(String),

    #[error("days-before offset {0} is outside 0..={max}", max = crate::model::MAX_DAYS_BEFORE)]
    DaysBeforeOutOfRange(i64),

    #[error("invalid weekday {0} (expected 0=Sunday..6=Saturday)")]
    InvalidWeekday(u8),

    #[error("unknown digest detail '{0}'")]
    UnknownDigestDetail(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("schedule '{schedule}' cannot be used with selector '{selector}'")]
    UnsupportedPairing { schedule: String, selector: String },

    #[error("template '{name}' ({language}) is not in the provider catalog")]
    UnknownTemplate { name: String, language: String },

    #[error("template '{name}' expects {expected} parameters, rule provides {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("template parameter #{index} must be '{expected}', rule declares '{actual}'")]
    ParameterKindMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("no value bound for template parameter '{0}'")]
    MissingBinding(String),

    #[error("unresolved placeholder '{{{0}}}' in message text")]
    UnresolvedPlaceholder(String),

    #[error("rule has neither message text nor a provider template")]
    NoRenderableContent,
}

/// Failure reported by (or on the way to) the messaging provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// Missing credentials or sender id; no attempt was made.
    #[error("provider not configured: {0}")]
    Unconfigured(String),
}

impl ProviderError {
    /// Whether another attempt may succeed.
    /// Client-side rejections (bad number, unapproved template) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout(_) => true,
            ProviderError::Rejected { status, .. } => *status == 429 || *status >= 500,
            ProviderError::InvalidResponse(_) | ProviderError::Unconfigured(_) => false,
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AvisosError {
    /// Engine settings (config.toml) problem.
    #[error("Config error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A backing store could not be read; the tick is abandoned.
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] ProviderError),

    /// Exclusive claim already held by another worker.
    #[error("Claim already held: {0}")]
    Race(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Unknown tenant or rule.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AvisosError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_race(&self) -> bool {
        matches!(self, AvisosError::Race(_))
    }
}

pub type Result<T> = std::result::Result<T, AvisosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(
            ProviderError::Rejected {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            ProviderError::Rejected {
                status: 429,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Rejected {
                status: 400,
                body: "invalid number".into()
            }
            .is_retryable()
        );
        assert!(!ProviderError::InvalidResponse("no id".into()).is_retryable());
    }

    #[test]
    fn test_configuration_error_wraps() {
        let err: AvisosError = ConfigurationError::NoRenderableContent.into();
        assert!(matches!(err, AvisosError::Configuration(_)));
        assert!(!err.is_race());
        assert!(AvisosError::Race("x".into()).is_race());
    }
}
