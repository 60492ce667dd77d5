//! Error types for the UDB provider.

use thiserror::Error;

use crate::client::ApiError;

/// Errors that can occur while managing UDB resources.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested resource was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A local constraint was violated before any remote call was made.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A remote API call failed.
    #[error("do {operation} failed for {id}: {source}")]
    Api {
        /// The remote operation name, e.g. `ResizeUDBInstance`.
        operation: &'static str,
        /// The resource the call targeted.
        id: String,
        /// The underlying client error.
        #[source]
        source: ApiError,
    },

    /// The state poller gave up before the resource reached a target state.
    #[error("timed out waiting for {id} to reach {targets:?} (last state: {})", .last_state.as_deref().unwrap_or("unknown"))]
    Timeout {
        /// The resource being polled.
        id: String,
        /// The states that would have ended the wait.
        targets: Vec<String>,
        /// The last state reported before the deadline, if any.
        last_state: Option<String>,
    },

    /// A retried operation did not finish before its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A parameter override names a key the source group does not have.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A delete was issued but the resource is still reported.
    #[error("Resource still exists: {0}")]
    StillExists(String),

    /// A create or update failed part way; `state` reflects what was applied.
    #[error("{id} stopped after applying {applied:?}: {source}")]
    Partial {
        /// The resource being changed.
        id: String,
        /// Attributes whose remote change completed before the failure.
        applied: Vec<String>,
        /// Resource state with only the applied attributes advanced.
        state: Box<serde_json::Value>,
        /// The error that stopped the update.
        #[source]
        source: Box<ProviderError>,
    },

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl ProviderError {
    /// Get the error message as a string.
    ///
    /// Variants that wrap another error return a short pointer to it; use
    /// `Display` for the full text.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Api { operation, .. } => operation,
            Self::Timeout { id, .. } => id,
            Self::DeadlineExceeded(msg) => msg,
            Self::InvalidKey(msg) => msg,
            Self::StillExists(msg) => msg,
            Self::Partial { id, .. } => id,
            Self::Unimplemented(msg) => msg,
        }
    }

    /// Wrap a client error with the operation name and resource id.
    pub fn api(operation: &'static str, id: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            operation,
            id: id.into(),
            source,
        }
    }

    /// Whether this error means the remote resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
