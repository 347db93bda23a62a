//! Error types for the discovery engine

use thiserror::Error;

/// Main error type for discovery operations.
///
/// The taxonomy is deliberately small and tagged by severity: configuration
/// errors are fatal and propagate to the caller, while Kubernetes API errors
/// are recovered locally (logged and surfaced as an empty result) at the call
/// site that observes them. Callers can use [`DiscoveryError::is_fatal`] to
/// tell the two apart without matching on variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// Unsatisfiable configuration, e.g. a primary port name that matches no
    /// port on an endpoint subset. Never silently defaulted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kubernetes API error from an upstream call
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl DiscoveryError {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error must propagate to the caller.
    ///
    /// Non-fatal errors are handled where they occur: logged as a warning and
    /// turned into an empty result, so emptiness rather than an error is the
    /// normal signal for "nothing currently known".
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
