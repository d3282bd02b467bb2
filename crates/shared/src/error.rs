use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a remote call, classified for retry decisions.
///
/// Transient errors may be retried per policy; permanent errors flip the
/// entity to `Failed` and are surfaced once, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RemoteError {
    #[error("network unreachable: {message}")]
    Network { message: String },
    #[error("request timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("rate limited")]
    RateLimited,
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RemoteError::network("offline").is_transient());
        assert!(RemoteError::Timeout { millis: 5000 }.is_transient());
        assert!(RemoteError::RateLimited.is_transient());
        assert!(!RemoteError::validation("bad cid").is_transient());
        assert!(!RemoteError::PermissionDenied {
            message: "read only".into()
        }
        .is_transient());
    }
}
