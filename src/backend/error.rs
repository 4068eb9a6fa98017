//! Error types for the orchestration backend.
//!
//! The taxonomy separates three caller-visible failure classes:
//! - workload submission rejected by the cluster (conflict, quota, validation)
//! - no pods matching a container's selector (distinct from transport failure)
//! - any other cluster-API failure, propagated verbatim

use thiserror::Error;

/// Errors from backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The cluster rejected the workload object at creation time.
    ///
    /// Returned synchronously from `start_container`; starting a container
    /// that already has a live deployment surfaces here as a conflict.
    #[error("Workload submission rejected: {reason}")]
    Submission {
        /// Server-side rejection message.
        reason: String,
    },

    /// No pods matched the container's label selector.
    #[error("No running pods for {short_id}")]
    NotFound {
        /// Short ID of the container that has no pods.
        short_id: String,
    },

    /// Any other cluster-API failure (network, auth, server error).
    #[error("Cluster request failed: {0}")]
    Transport(#[from] kube::Error),

    /// I/O error while streaming data (logs, tunnels).
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Classify a deployment-creation failure.
    ///
    /// Conflict (409), validation (422) and quota denial (403) become
    /// [`BackendError::Submission`]; everything else stays a transport error.
    pub(crate) fn from_submission(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if matches!(ae.code, 403 | 409 | 422) => BackendError::Submission {
                reason: ae.message,
            },
            other => BackendError::Transport(other),
        }
    }

    /// True when the underlying cluster response was a 404.
    ///
    /// Stale background watches and the idempotent delete path use this to
    /// treat "already gone" as a normal termination signal.
    pub(crate) fn is_gone(&self) -> bool {
        matches!(self, BackendError::Transport(kube::Error::Api(ae)) if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_conflict_is_submission_error() {
        let err = BackendError::from_submission(api_error(409, "deployments \"abc\" already exists"));
        assert!(matches!(err, BackendError::Submission { .. }));
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_validation_is_submission_error() {
        let err = BackendError::from_submission(api_error(422, "spec.template is invalid"));
        assert!(matches!(err, BackendError::Submission { .. }));
    }

    #[test]
    fn test_server_error_stays_transport() {
        let err = BackendError::from_submission(api_error(500, "internal"));
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[test]
    fn test_is_gone() {
        let err = BackendError::Transport(api_error(404, "not found"));
        assert!(err.is_gone());

        let err = BackendError::Transport(api_error(500, "boom"));
        assert!(!err.is_gone());
    }

    #[test]
    fn test_not_found_names_short_id() {
        let err = BackendError::NotFound {
            short_id: "2107007eb7c8".to_string(),
        };
        assert!(err.to_string().contains("2107007eb7c8"));
    }
}
