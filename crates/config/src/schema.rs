/// Config schema types (runner, run defaults, inline strategy, docker host, limits).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandrunConfig {
    pub runner: RunnerSection,
    pub run: RunDefaults,
    pub inline: InlineSection,
    pub docker: DockerSection,
    pub limits: LimitsSection,
}

/// Which image runs the sandboxes and how their names are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Prefix for sandbox names; each run appends `-<uuid>`.
    pub base_name: String,
    pub image: String,
    pub tag: String,
    /// Pull the image at startup when it is missing locally.
    pub auto_pull: bool,
    /// How long to wait for output streams to drain once a sandbox is gone.
    pub output_drain_ms: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            base_name: "sandrun".into(),
            image: "python".into(),
            tag: "3-alpine".into(),
            auto_pull: true,
            output_drain_ms: 1000,
        }
    }
}

/// Defaults applied to every run unless overridden by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub network_disabled: bool,
    pub timeout_ms: u64,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            network_disabled: true,
            timeout_ms: 3000,
        }
    }
}

/// Settings for the inline (source text) strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineSection {
    /// Command executed inside the sandbox. `{file}` expands to the source file name.
    pub command: Vec<String>,
    /// Directory inside the sandbox the source file is copied to.
    pub working_dir: String,
    /// Extension used to derive `tmp.<ext>` when a run names no file.
    pub extension: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for InlineSection {
    fn default() -> Self {
        Self {
            command: vec!["sh".into(), "-c".into(), "python {file}".into()],
            working_dir: "/sandbox".into(),
            extension: Some("py".into()),
            env: BTreeMap::new(),
        }
    }
}

/// Docker CLI host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Container CLI binary (e.g. `"docker"` or `"podman"`).
    pub cli: String,
    pub removal_poll_ms: u64,
    pub removal_poll_attempts: u32,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            cli: "docker".into(),
            removal_poll_ms: 100,
            removal_poll_attempts: 50,
        }
    }
}

/// Resource limits for every sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Memory limit (e.g. "256M", "1G").
    pub memory_limit: Option<String>,
    /// CPU quota as a fraction (e.g. 0.5 = half a core).
    pub cpu_quota: Option<f64>,
    pub pids_max: Option<u32>,
}
