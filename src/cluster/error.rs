//! Error types for cluster API access.

use thiserror::Error;

/// Errors raised while talking to the cluster API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Raised when creating an object whose name is already taken.
    #[error("{kind} {target} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        target: String,
    },
    /// Raised when the addressed object does not exist.
    #[error("{kind} {target} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        target: String,
    },
    /// Raised when the API server rejects a request.
    #[error("failed to {operation} {kind} {target}: HTTP {status}: {message}")]
    Api {
        /// Operation that was rejected (`create`, `delete`, ...).
        operation: &'static str,
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        target: String,
        /// HTTP status code.
        status: u16,
        /// Response body or status message.
        message: String,
    },
    /// Raised when a request does not finish within the request timeout.
    #[error("timed out trying to {operation} {kind} {target} after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        target: String,
        /// Request timeout in seconds.
        seconds: u64,
    },
    /// Raised when the request could not be delivered.
    #[error("cluster API request failed: {message}")]
    Transport {
        /// Message from the HTTP client.
        message: String,
    },
    /// Raised when a response body does not match the expected shape.
    #[error("failed to decode {kind} from cluster response: {message}")]
    Decode {
        /// Object kind.
        kind: &'static str,
        /// Decoder message.
        message: String,
    },
    /// Raised when the server reports an error inside a watch stream.
    #[error("watch on {kind} {target} failed: {message}")]
    Watch {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the watched object.
        target: String,
        /// Status message from the server.
        message: String,
    },
}

impl ClusterError {
    /// Returns true for name conflicts on create.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true when a request ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true when the object is missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}
