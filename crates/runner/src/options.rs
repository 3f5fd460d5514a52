use std::time::Duration;

use serde::{Deserialize, Serialize};

use sandrun_config::schema::{RunDefaults, SandrunConfig};

/// Per-run options. Fixed once the run has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub network_disabled: bool,
    /// Deadline for code execution, counted from the moment it is invoked.
    pub timeout_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            network_disabled: true,
            timeout_ms: 3000,
        }
    }
}

impl RunOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_disabled = !enabled;
        self
    }
}

impl From<&RunDefaults> for RunOptions {
    fn from(cfg: &RunDefaults) -> Self {
        Self {
            network_disabled: cfg.network_disabled,
            timeout_ms: cfg.timeout_ms,
        }
    }
}

/// Runner-wide settings: which image sandboxes use and how they are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub base_name: String,
    pub image: String,
    pub tag: String,
    /// Grace period for output streams to reach EOF after the sandbox is gone.
    pub output_drain: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&SandrunConfig::default())
    }
}

impl From<&SandrunConfig> for RunnerConfig {
    fn from(cfg: &SandrunConfig) -> Self {
        Self {
            base_name: cfg.runner.base_name.clone(),
            image: cfg.runner.image.clone(),
            tag: cfg.runner.tag.clone(),
            output_drain: Duration::from_millis(cfg.runner.output_drain_ms),
        }
    }
}

impl RunnerConfig {
    pub fn new(base_name: impl Into<String>, image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            image: image.into(),
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// `image:tag` reference passed to the host.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = RunOptions::default();
        assert!(opts.network_disabled);
        assert_eq!(opts.timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let opts: RunOptions = serde_json::from_str(r#"{"timeout_ms": 10}"#).unwrap();
        assert_eq!(opts.timeout_ms, 10);
        assert!(opts.network_disabled);
    }

    #[test]
    fn builders() {
        let opts = RunOptions::default().with_network(true).with_timeout_ms(50);
        assert!(!opts.network_disabled);
        assert_eq!(opts.timeout_ms, 50);
    }

    #[test]
    fn runner_config_from_file_config() {
        let mut cfg = SandrunConfig::default();
        cfg.runner.image = "node".into();
        cfg.runner.tag = "alpine".into();
        cfg.runner.output_drain_ms = 250;
        let runner = RunnerConfig::from(&cfg);
        assert_eq!(runner.image_ref(), "node:alpine");
        assert_eq!(runner.output_drain, Duration::from_millis(250));
        assert_eq!(runner.base_name, "sandrun");
    }
}
