use std::{process::Stdio, time::Duration};

use {
    async_trait::async_trait,
    futures::Stream,
    tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, warn},
};

use crate::{
    ContainerHost, PullStream, Result,
    error::{HostError, is_missing_resource},
    types::{
        ContainerHandle, CreateSpec, ExecOutput, ExecRequest, ImageInfo, OutputStreams,
        PullProgress, ResourceLimits,
    },
};

/// Shell wrapper that sends an exec'd command's output to the container's
/// main process, so it shows up on the attached (`logs --follow`) streams.
const EXEC_REDIRECT: &str = r#"exec "$@" >/proc/1/fd/1 2>/proc/1/fd/2"#;

/// Docker host driven through the container CLI (`docker` or a compatible binary).
#[derive(Debug, Clone)]
pub struct DockerCliHost {
    cli: String,
    removal_poll: Duration,
    removal_poll_attempts: u32,
}

impl Default for DockerCliHost {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl From<&sandrun_config::schema::DockerSection> for DockerCliHost {
    fn from(cfg: &sandrun_config::schema::DockerSection) -> Self {
        Self::new(cfg.cli.clone()).with_removal_poll(
            Duration::from_millis(cfg.removal_poll_ms),
            cfg.removal_poll_attempts,
        )
    }
}

impl DockerCliHost {
    pub fn new(cli: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            removal_poll: Duration::from_millis(100),
            removal_poll_attempts: 50,
        }
    }

    pub fn with_removal_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.removal_poll = interval;
        self.removal_poll_attempts = attempts.max(1);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> HostError {
        if e.kind() == std::io::ErrorKind::NotFound {
            HostError::Unavailable(format!("`{}` not found on PATH", self.cli))
        } else {
            HostError::Io(e)
        }
    }

    /// Run a CLI invocation to completion, returning its trimmed stdout.
    async fn run(&self, operation: &'static str, target: &str, args: &[String]) -> Result<String> {
        debug!(cli = %self.cli, operation, target, "container cli");
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_resource(&stderr) {
            return Err(HostError::NotFound(target.to_string()));
        }
        Err(HostError::operation(operation, stderr.trim()))
    }

    fn create_args(spec: &CreateSpec) -> Vec<String> {
        let opts = &spec.options;
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            "sandrun.sandbox=1".to_string(),
        ];
        if opts.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref dir) = opts.working_dir {
            args.extend(["-w".to_string(), dir.clone()]);
        }
        for (k, v) in &opts.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        args.extend(resource_args(&opts.limits));
        args.push(spec.image.clone());
        args.extend(opts.command.iter().cloned());
        args
    }

    fn exec_args(handle: &ContainerHandle, request: &ExecRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(ref dir) = request.working_dir {
            args.extend(["-w".to_string(), dir.clone()]);
        }
        for (k, v) in &request.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        args.push(handle.name().to_string());
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            EXEC_REDIRECT.to_string(),
            "sandrun-exec".to_string(),
        ]);
        args.extend(request.command.iter().cloned());
        args
    }
}

fn resource_args(limits: &ResourceLimits) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(ref mem) = limits.memory_limit {
        args.extend(["--memory".to_string(), mem.clone()]);
    }
    if let Some(cpu) = limits.cpu_quota {
        args.extend(["--cpus".to_string(), cpu.to_string()]);
    }
    if let Some(pids) = limits.pids_max {
        args.extend(["--pids-limit".to_string(), pids.to_string()]);
    }
    args
}

/// Parse `docker image ls` rows (`repo:tag\tid\tsize`), grouping tags by image id.
fn parse_image_list(stdout: &str) -> Vec<ImageInfo> {
    let mut images: Vec<ImageInfo> = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.splitn(3, '\t').collect();
        let [reference, id, size] = parts[..] else {
            continue;
        };
        let tag = (!reference.contains("<none>")).then(|| reference.to_string());
        match images.iter_mut().find(|img| img.id == id) {
            Some(img) => img.repo_tags.extend(tag),
            None => images.push(ImageInfo {
                id: id.to_string(),
                repo_tags: tag.into_iter().collect(),
                size: size.to_string(),
            }),
        }
    }
    images
}

/// Stream `docker pull` progress from stdout. Stderr is collected on its own
/// task so a chatty pull cannot block on a full pipe.
fn pull_progress(mut child: Child) -> impl Stream<Item = Result<PullProgress>> {
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text).await;
            text
        })
    });
    async_stream::try_stream! {
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(progress) = PullProgress::parse_line(&line) {
                    yield progress;
                }
            }
        }
        let status = child.wait().await?;
        if !status.success() {
            let stderr = match stderr {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            Err::<(), _>(HostError::operation("pull", stderr.trim()))?;
        }
    }
}

#[async_trait]
impl ContainerHost for DockerCliHost {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        match self.run("version", "daemon", &args).await {
            Ok(version) => {
                debug!(version, "container runtime reachable");
                Ok(())
            },
            Err(HostError::Operation { message, .. }) => Err(HostError::Unavailable(message)),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerHandle> {
        let id = self
            .run("create", &spec.name, &Self::create_args(spec))
            .await?;
        Ok(ContainerHandle::new(id, spec.name.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let args = ["start".to_string(), handle.name().to_string()];
        self.run("start", handle.name(), &args).await.map(|_| ())
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStreams> {
        // `logs --follow` replays from container start, so nothing written
        // before the follower connects is lost. It exits once the container is removed.
        let mut child = self
            .command()
            .args(["logs", "--follow", handle.name()])
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(HostError::operation("attach", "output pipes unavailable"));
        };
        let name = handle.name().to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    debug!(sandbox = %name, %status, "log follower exited");
                },
                Ok(_) => {},
                Err(e) => warn!(sandbox = %name, error = %e, "log follower wait failed"),
            }
        });
        Ok(OutputStreams {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        })
    }

    async fn exec(&self, handle: &ContainerHandle, request: &ExecRequest) -> Result<ExecOutput> {
        debug!(sandbox = %handle, command = ?request.command, "exec");
        let output = self
            .command()
            .args(Self::exec_args(handle, request))
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        // The command's own output is redirected, so stderr only carries CLI errors.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_resource(&stderr) {
            return Err(HostError::NotFound(handle.name().to_string()));
        }
        if stderr.contains("Error response from daemon") {
            return Err(HostError::operation("exec", stderr.trim()));
        }
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let mut child = self
            .command()
            .args(["cp", "-", &format!("{}:{dest_dir}", handle.name())])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&archive).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_resource(&stderr) {
            return Err(HostError::NotFound(handle.name().to_string()));
        }
        Err(HostError::operation("cp", stderr.trim()))
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(handle.name().to_string());
        self.run("rm", handle.name(), &args).await.map(|_| ())
    }

    async fn wait_removed(&self, handle: &ContainerHandle) -> Result<()> {
        let args = ["inspect", "--format", "{{.Id}}", handle.name()].map(String::from);
        for _ in 0..self.removal_poll_attempts {
            match self.run("inspect", handle.name(), &args).await {
                Err(HostError::NotFound(_)) => return Ok(()),
                Ok(_) => tokio::time::sleep(self.removal_poll).await,
                Err(e) => return Err(e),
            }
        }
        Err(HostError::TimedOut {
            operation: "wait for removal",
            waited_ms: (self.removal_poll * self.removal_poll_attempts).as_millis() as u64,
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let args = [
            "image",
            "ls",
            "--format",
            "{{.Repository}}:{{.Tag}}\t{{.ID}}\t{{.Size}}",
        ]
        .map(String::from);
        let stdout = self.run("image ls", "images", &args).await?;
        Ok(parse_image_list(&stdout))
    }

    async fn pull(&self, image: &str, tag: &str) -> Result<PullStream> {
        let reference = format!("{image}:{tag}");
        debug!(image = %reference, "pulling image");
        let child = self
            .command()
            .args(["pull", &reference])
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        Ok(Box::pin(pull_progress(child)))
    }
}
