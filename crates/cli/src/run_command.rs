use std::{
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    futures::StreamExt,
    sandrun_host::{
        ContainerHost,
        docker::DockerCliHost,
        images::{HostReadiness, ImagePuller},
    },
    sandrun_runner::{
        InlinePayload, InlineStrategy, RunEvent, RunOptions, Runner, RunnerConfig, SandboxInfo,
    },
};

use crate::image_commands::report_pull_progress;

#[derive(Args)]
pub struct RunArgs {
    /// Source code to run. Read from `--file` or stdin when omitted.
    #[arg(short, long, conflicts_with = "file")]
    code: Option<String>,

    /// Read the source code from a file ("-" for stdin).
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Extension for the default `tmp.<ext>` file name.
    #[arg(long)]
    ext: Option<String>,

    /// Name of the source file inside the sandbox.
    #[arg(long)]
    file_name: Option<String>,

    /// Shell command run inside the sandbox; `{file}` expands to the file name.
    #[arg(long)]
    command: Option<String>,

    /// Image name (defaults to `runner.image`).
    #[arg(long)]
    image: Option<String>,

    /// Image tag (defaults to `runner.tag`).
    #[arg(long)]
    tag: Option<String>,

    /// Execution deadline in milliseconds (defaults to `run.timeout_ms`).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Allow network access from the sandbox.
    #[arg(long, default_value_t = false)]
    network: bool,

    /// Do not pull the image when it is missing.
    #[arg(long, default_value_t = false)]
    no_pull: bool,

    /// Print lifecycle events to stderr.
    #[arg(long, default_value_t = false)]
    events: bool,

    /// Print the final sandbox summary as JSON on stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl RunArgs {
    fn source(&self) -> Result<String> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }
        match self.file.as_deref() {
            Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display())),
            _ => {
                let mut code = String::new();
                std::io::stdin()
                    .read_to_string(&mut code)
                    .context("failed to read source from stdin")?;
                Ok(code)
            },
        }
    }

    fn payload(&self, code: String) -> InlinePayload {
        let mut payload = InlinePayload::new(code);
        payload.extension = self.ext.clone();
        payload.file_name = self.file_name.clone().or_else(|| {
            // A named source file keeps its name unless an extension was forced.
            if self.ext.is_some() {
                return None;
            }
            self.file
                .as_deref()
                .filter(|p| p.as_os_str() != "-")
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
        });
        payload
    }
}

/// Execute one run and return the program's exit code.
pub async fn handle_run(args: RunArgs) -> Result<i32> {
    let config = sandrun_config::discover_and_load();
    let code = args.source()?;

    let mut runner_config = RunnerConfig::from(&config);
    if let Some(image) = &args.image {
        runner_config.image = image.clone();
    }
    if let Some(tag) = &args.tag {
        runner_config.tag = tag.clone();
    }

    let host: Arc<dyn ContainerHost> = Arc::new(DockerCliHost::from(&config.docker));
    ensure_image(
        Arc::clone(&host),
        &runner_config,
        config.runner.auto_pull && !args.no_pull,
    )
    .await?;

    let mut strategy = InlineStrategy::from_config(&config);
    if let Some(script) = &args.command {
        strategy = strategy.with_command(vec!["sh".into(), "-c".into(), script.clone()]);
    }

    let mut options = RunOptions::from(&config.run).with_network(args.network);
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.with_timeout_ms(timeout_ms);
    }

    let runner = Runner::new(host, Arc::new(strategy), runner_config);
    let mut stream = runner.run(options, args.payload(code));

    while let Some(event) = stream.next().await {
        if args.events {
            eprintln!("[{}] {}", event.label(), stream.sandbox_name());
        }
        match event {
            RunEvent::Removed(info) => {
                print_output(&info)?;
                if args.json {
                    print_summary(&info, None)?;
                }
                return Ok(info.exit_code().unwrap_or(0));
            },
            RunEvent::Errored(err) => {
                if let Some(sandbox) = err.sandbox() {
                    print_output(sandbox.info())?;
                    if args.json {
                        print_summary(sandbox.info(), Some(err.kind().as_str()))?;
                    }
                }
                return Err(err.into());
            },
            _ => {},
        }
    }
    bail!("run of {} ended without a result", stream.sandbox_name())
}

async fn ensure_image(host: Arc<dyn ContainerHost>, config: &RunnerConfig, auto_pull: bool) -> Result<()> {
    let puller = ImagePuller::new(host);
    let reporter = report_pull_progress(&puller);
    let readiness = puller.ensure_image(&config.image, &config.tag, auto_pull).await;
    drop(puller);
    let _ = reporter.await;
    match readiness? {
        HostReadiness::Ready => Ok(()),
        HostReadiness::MissingImage => bail!(
            "image {} is not available locally; run `sandrun images pull`",
            config.image_ref()
        ),
    }
}

fn print_output(info: &SandboxInfo) -> Result<()> {
    std::io::stdout().write_all(&info.stdout.contents())?;
    std::io::stderr().write_all(&info.stderr.contents())?;
    Ok(())
}

fn print_summary(info: &SandboxInfo, error: Option<&str>) -> Result<()> {
    let summary = serde_json::json!({
        "sandbox": info.name,
        "exit_code": info.exit_code(),
        "stdout_bytes": info.stdout.len(),
        "stderr_bytes": info.stderr.len(),
        "error": error,
    });
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
