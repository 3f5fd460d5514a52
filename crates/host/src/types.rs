use std::pin::Pin;

use {
    serde::{Deserialize, Serialize},
    tokio::io::AsyncRead,
};

/// Opaque reference to a live host-side container.
///
/// Valid from successful creation until removal is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    id: String,
    name: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resource limits for sandboxed execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit (e.g. "512M", "1G").
    pub memory_limit: Option<String>,
    /// CPU quota as a fraction (e.g. 0.5 = half a core, 2.0 = two cores).
    pub cpu_quota: Option<f64>,
    /// Maximum number of PIDs.
    pub pids_max: Option<u32>,
}

impl From<&sandrun_config::schema::LimitsSection> for ResourceLimits {
    fn from(cfg: &sandrun_config::schema::LimitsSection) -> Self {
        Self {
            memory_limit: cfg.memory_limit.clone(),
            cpu_quota: cfg.cpu_quota,
            pids_max: cfg.pids_max,
        }
    }
}

/// Strategy-shaped creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOptions {
    pub network_disabled: bool,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    /// Main process of the container. Keeps the container alive for `exec`.
    pub command: Vec<String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            network_disabled: true,
            working_dir: None,
            env: Vec::new(),
            limits: ResourceLimits::default(),
            command: vec!["sleep".into(), "infinity".into()],
        }
    }
}

/// Full creation request: runner-assigned identity plus strategy options.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub name: String,
    /// Image reference, `name:tag`.
    pub image: String,
    pub options: ContainerOptions,
}

/// A command to run inside a live container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Demultiplexed output of a container.
pub struct OutputStreams {
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

impl std::fmt::Debug for OutputStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStreams").finish_non_exhaustive()
    }
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// `repository:tag` references pointing at this image.
    pub repo_tags: Vec<String>,
    pub size: String,
}

impl ImageInfo {
    pub fn has_tag(&self, reference: &str) -> bool {
        self.repo_tags.iter().any(|t| t == reference)
    }
}

/// One progress record of an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Layer id, when the record concerns a single layer.
    pub id: Option<String>,
    pub status: String,
    /// Rendered progress bar, when the runtime provides one.
    pub progress: Option<String>,
}

impl PullProgress {
    /// Parse one line of `docker pull` output (`<id>: <status> [<bar>] <a>/<b>`).
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (id, rest) = match line.split_once(": ") {
            Some((id, rest)) if !id.contains(' ') => (Some(id.to_string()), rest),
            _ => (None, line),
        };
        let (status, progress) = match rest.find('[') {
            Some(idx) => (
                rest[..idx].trim().to_string(),
                Some(rest[idx..].trim().to_string()),
            ),
            None => (rest.trim().to_string(), None),
        };
        Some(Self {
            id,
            status,
            progress,
        })
    }
}
