//! Host error types.

use std::io;

use thiserror::Error;

/// Errors returned by a [`ContainerHost`](crate::ContainerHost).
#[derive(Debug, Error)]
pub enum HostError {
    /// The container (or image) does not exist. For removal this is the
    /// desired end state.
    #[error("no such container: {0}")]
    NotFound(String),

    /// The runtime rejected an operation.
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    /// The runtime did not answer in time.
    #[error("{operation} timed out after {waited_ms}ms")]
    TimedOut {
        operation: &'static str,
        waited_ms: u64,
    },

    /// The runtime could not be reached at all.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HostError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }

    /// Whether the error means the target resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Whether CLI stderr reports a missing container or object.
pub(crate) fn is_missing_resource(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn not_found_is_distinguished() {
        assert!(HostError::NotFound("box-1".into()).is_not_found());
        assert!(!HostError::operation("rm", "permission denied").is_not_found());
        assert!(!HostError::Unavailable("socket".into()).is_not_found());
    }

    #[test]
    fn operation_display() {
        let err = HostError::operation("docker rm", "daemon busy");
        assert_eq!(err.to_string(), "docker rm failed: daemon busy");
    }

    #[rstest]
    #[case("Error response from daemon: No such container: sandrun-1", true)]
    #[case("Error: No such object: sandrun-1", true)]
    #[case("Error response from daemon: removal already in progress", false)]
    #[case("", false)]
    fn detects_missing_resource(#[case] stderr: &str, #[case] expected: bool) {
        assert_eq!(is_missing_resource(stderr), expected);
    }
}
