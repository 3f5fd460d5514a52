//! Metric names shared across sandrun crates.
//!
//! Only the `metrics` facade is used here; recording is a no-op until the
//! embedding application installs a recorder.

pub use metrics::{counter, gauge, histogram};

/// Sandbox run lifecycle metrics.
pub mod runner {
    /// Completed runs, labelled with `outcome` (`removed` or an error kind).
    pub const RUNS_TOTAL: &str = "sandrun_runs_total";
    /// Wall-clock time from run start to the terminal event.
    pub const RUN_DURATION_SECONDS: &str = "sandrun_run_duration_seconds";
    /// Best-effort cleanups that failed after another error.
    pub const CLEANUP_FAILURES_TOTAL: &str = "sandrun_cleanup_failures_total";
    /// Runs currently holding a live sandbox.
    pub const ACTIVE_SANDBOXES: &str = "sandrun_active_sandboxes";
}

/// Image management metrics.
pub mod images {
    pub const PULLS_TOTAL: &str = "sandrun_image_pulls_total";
}
