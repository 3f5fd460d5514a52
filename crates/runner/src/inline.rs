//! Inline strategy: run source text passed in with the request.
//!
//! The source is packed into a single-file tar archive, copied into the
//! sandbox working directory, and executed with a configured command in
//! which `{file}` expands to the file name.

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use {
    sandrun_config::schema::SandrunConfig,
    sandrun_host::{ContainerHost, ContainerOptions, ExecRequest, ResourceLimits},
};

use crate::{archive::pack_source, options::RunOptions, sandbox::Sandbox, strategy::Strategy};

const FILE_PLACEHOLDER: &str = "{file}";
const DEFAULT_STEM: &str = "tmp";

/// Source text and naming for one inline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlinePayload {
    pub code: String,
    /// Explicit file name. Takes precedence over `extension`.
    pub file_name: Option<String>,
    /// Extension for the default `tmp.<ext>` file name.
    pub extension: Option<String>,
}

impl InlinePayload {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// Runs inline source text with a fixed command.
#[derive(Debug, Clone)]
pub struct InlineStrategy {
    command: Vec<String>,
    working_dir: String,
    env: Vec<(String, String)>,
    limits: ResourceLimits,
    default_extension: Option<String>,
}

impl InlineStrategy {
    pub fn new(command: Vec<String>, working_dir: impl Into<String>) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
            env: Vec::new(),
            limits: ResourceLimits::default(),
            default_extension: None,
        }
    }

    /// `sh -c <script>`, e.g. `InlineStrategy::shell("python {file}")`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(
            vec!["sh".into(), "-c".into(), script.into()],
            SandrunConfig::default().inline.working_dir,
        )
    }

    pub fn from_config(config: &SandrunConfig) -> Self {
        let inline = &config.inline;
        Self {
            command: inline.command.clone(),
            working_dir: inline.working_dir.clone(),
            env: inline
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            limits: ResourceLimits::from(&config.limits),
            default_extension: inline.extension.clone(),
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = Some(extension.into());
        self
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// File name the payload's source is written to.
    pub fn resolve_file_name(&self, payload: &InlinePayload) -> anyhow::Result<String> {
        if payload.code.is_empty() {
            bail!("code cannot be empty");
        }
        if let Some(name) = payload.file_name.as_deref() {
            validate_file_name(name)?;
            return Ok(name.to_string());
        }
        let ext = payload
            .extension
            .as_deref()
            .or(self.default_extension.as_deref())
            .map(|e| e.trim_start_matches('.'))
            .filter(|e| !e.is_empty())
            .context("either a file name or an extension is required")?;
        let name = format!("{DEFAULT_STEM}.{ext}");
        validate_file_name(&name)?;
        Ok(name)
    }

    /// Command with every `{file}` replaced by `file_name`.
    pub fn command_for(&self, file_name: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, file_name))
            .collect()
    }
}

fn validate_file_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        bail!("invalid file name {name:?}: must be a plain file name");
    }
    Ok(())
}

#[async_trait]
impl Strategy for InlineStrategy {
    type Payload = InlinePayload;

    fn container_options(&self, options: &RunOptions) -> ContainerOptions {
        ContainerOptions {
            network_disabled: options.network_disabled,
            working_dir: Some(self.working_dir.clone()),
            env: self.env.clone(),
            limits: self.limits.clone(),
            ..Default::default()
        }
    }

    async fn before_run_code(
        &self,
        host: &dyn ContainerHost,
        sandbox: &Sandbox,
        payload: &InlinePayload,
    ) -> anyhow::Result<()> {
        let file_name = self.resolve_file_name(payload)?;
        let archive = pack_source(&file_name, &payload.code)
            .with_context(|| format!("failed to pack {file_name}"))?;
        debug!(sandbox = %sandbox.name(), file = %file_name, bytes = archive.len(), "copying source");
        host.put_archive(sandbox.handle(), &self.working_dir, archive)
            .await
            .with_context(|| format!("failed to copy {file_name} into {}", self.working_dir))?;
        Ok(())
    }

    async fn run_code(
        &self,
        host: &dyn ContainerHost,
        sandbox: &Sandbox,
        payload: &InlinePayload,
    ) -> anyhow::Result<()> {
        let file_name = self.resolve_file_name(payload)?;
        let request = ExecRequest {
            command: self.command_for(&file_name),
            working_dir: Some(self.working_dir.clone()),
            env: self.env.clone(),
        };
        let output = host
            .exec(sandbox.handle(), &request)
            .await
            .with_context(|| format!("failed to execute {file_name}"))?;
        debug!(sandbox = %sandbox.name(), exit_code = output.exit_code, "command exited");
        sandbox.record_exit_code(output.exit_code);
        Ok(())
    }
}
