//! Run error taxonomy.

use thiserror::Error;

use crate::sandbox::Sandbox;

/// Stage of the run that failed. Callers branch on this and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Code execution outlived the deadline.
    Timeout,
    /// The sandbox could not be created, started or attached to.
    CreateRunner,
    /// Forced removal failed. The sandbox may be leaked.
    DestroyRunner,
    /// The strategy's execution (or post-run) hook failed.
    Run,
    /// Removal was requested but never confirmed.
    WaitingDestruction,
    /// The strategy's preparation hook failed.
    BeforeRun,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::CreateRunner => "create_runner",
            Self::DestroyRunner => "destroy_runner",
            Self::Run => "run",
            Self::WaitingDestruction => "waiting_destruction",
            Self::BeforeRun => "before_run",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run.
///
/// Carries the sandbox that was live when the failure happened, if any. When
/// best-effort cleanup after the failure also failed, that error is attached
/// as [`RunError::cleanup_error`] and the original kind stays primary.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", cleanup_suffix(.cleanup))]
pub struct RunError {
    kind: ErrorKind,
    sandbox: Option<Sandbox>,
    message: String,
    cleanup: Option<Box<RunError>>,
}

fn cleanup_suffix(cleanup: &Option<Box<RunError>>) -> String {
    cleanup
        .as_ref()
        .map(|c| format!(" (cleanup also failed: {c})"))
        .unwrap_or_default()
}

impl RunError {
    pub fn new(kind: ErrorKind, sandbox: Option<Sandbox>, message: impl Into<String>) -> Self {
        Self {
            kind,
            sandbox,
            message: message.into(),
            cleanup: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.sandbox.as_ref()
    }

    pub fn sandbox_name(&self) -> Option<&str> {
        self.sandbox.as_ref().map(Sandbox::name)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Failure of the best-effort cleanup that followed this error.
    pub fn cleanup_error(&self) -> Option<&RunError> {
        self.cleanup.as_deref()
    }

    pub(crate) fn with_cleanup_failure(mut self, cleanup: RunError) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, sandrun_host::ContainerHandle};

    #[rstest]
    #[case(ErrorKind::Timeout, "timeout")]
    #[case(ErrorKind::CreateRunner, "create_runner")]
    #[case(ErrorKind::DestroyRunner, "destroy_runner")]
    #[case(ErrorKind::Run, "run")]
    #[case(ErrorKind::WaitingDestruction, "waiting_destruction")]
    #[case(ErrorKind::BeforeRun, "before_run")]
    fn kind_display(#[case] kind: ErrorKind, #[case] expected: &str) {
        assert_eq!(kind.to_string(), expected);
    }

    #[test]
    fn display_without_cleanup() {
        let err = RunError::new(ErrorKind::CreateRunner, None, "image not found");
        assert_eq!(err.to_string(), "create_runner: image not found");
        assert!(err.sandbox().is_none());
        assert!(err.cleanup_error().is_none());
    }

    #[test]
    fn cleanup_failure_keeps_original_kind() {
        let sandbox = Sandbox::new("box-1", ContainerHandle::new("id", "box-1"));
        let err = RunError::new(ErrorKind::Timeout, Some(sandbox.clone()), "exceeded 10ms")
            .with_cleanup_failure(RunError::new(
                ErrorKind::DestroyRunner,
                Some(sandbox),
                "daemon busy",
            ));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.sandbox_name(), Some("box-1"));
        assert_eq!(
            err.cleanup_error().map(RunError::kind),
            Some(ErrorKind::DestroyRunner)
        );
        assert_eq!(
            err.to_string(),
            "timeout: exceeded 10ms (cleanup also failed: destroy_runner: daemon busy)"
        );
    }
}
