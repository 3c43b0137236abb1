use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`MusterError`].
pub type MusterResult<T> = Result<T, MusterError>;

/// Top-level error type for muster.
///
/// Provider-scoped variants carry the provider name so that every failure
/// can be reported with its origin.
#[derive(Error, Debug)]
pub enum MusterError {
    /// Malformed or missing configuration. Never retried.
    #[error("Config error: {0}")]
    Config(String),

    /// The provider process could not be started.
    #[error("Launch error for '{provider}': {reason}")]
    Launch {
        /// Provider name.
        provider: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The handshake or manifest query exceeded the per-attempt bound.
    #[error("Handshake with '{provider}' timed out after {}ms", timeout.as_millis())]
    HandshakeTimeout {
        /// Provider name.
        provider: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The provider answered, but with something incompatible.
    #[error("Protocol error from '{provider}': {reason}")]
    Protocol {
        /// Provider name.
        provider: String,
        /// Human-readable cause.
        reason: String,
    },

    /// I/O or JSON-RPC level failure while talking to a provider.
    #[error("Transport error for '{provider}': {reason}")]
    Transport {
        /// Provider name.
        provider: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The run was stopped by an external signal.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Fail-fast policy aborted the run.
    #[error("Aborted at tier {tier}: provider '{provider}' failed")]
    Aborted {
        /// Tier being processed when the abort fired.
        tier: u32,
        /// Provider whose failure triggered the abort.
        provider: String,
    },

    /// No provider reached Ready and fallback is disabled.
    #[error("No providers available")]
    NoProviders,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MusterError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Launch failures, handshake timeouts and transport faults are
    /// transient. Configuration and protocol errors are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MusterError::Launch { .. }
                | MusterError::HandshakeTimeout { .. }
                | MusterError::Transport { .. }
        )
    }

    /// The provider this error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            MusterError::Launch { provider, .. }
            | MusterError::HandshakeTimeout { provider, .. }
            | MusterError::Protocol { provider, .. }
            | MusterError::Transport { provider, .. }
            | MusterError::Aborted { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Short stable label for reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MusterError::Config(_) => "config",
            MusterError::Launch { .. } => "launch",
            MusterError::HandshakeTimeout { .. } => "handshake_timeout",
            MusterError::Protocol { .. } => "protocol",
            MusterError::Transport { .. } => "transport",
            MusterError::Cancelled(_) => "cancelled",
            MusterError::Aborted { .. } => "aborted",
            MusterError::NoProviders => "no_providers",
            MusterError::Json(_) => "json",
            MusterError::Io(_) => "io",
        }
    }
}
