//! The sandbox lifecycle driver.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    futures::future::join_all,
    tokio::{
        io::AsyncReadExt,
        sync::mpsc,
        task::{AbortHandle, JoinHandle},
    },
    tracing::{debug, info, warn},
};

use sandrun_host::{BoxedReader, ContainerHandle, ContainerHost, CreateSpec, OutputStreams};

#[cfg(feature = "metrics")]
use sandrun_metrics::{counter, gauge, histogram, runner as run_metrics};

use crate::{
    error::{ErrorKind, RunError},
    events::{EventBus, RemovalOutcome, RunEmitter, RunStream},
    options::{RunOptions, RunnerConfig},
    sandbox::{OutputSink, Sandbox, sandbox_name},
    strategy::Strategy,
};

/// Drives one-shot sandboxes through their lifecycle.
///
/// Cheap to clone; clones share the host, the strategy and the event bus.
pub struct Runner<S: Strategy> {
    host: Arc<dyn ContainerHost>,
    strategy: Arc<S>,
    config: RunnerConfig,
    bus: EventBus,
}

impl<S: Strategy> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            strategy: Arc::clone(&self.strategy),
            config: self.config.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<S: Strategy> Runner<S> {
    pub fn new(host: Arc<dyn ContainerHost>, strategy: Arc<S>, config: RunnerConfig) -> Self {
        Self {
            host,
            strategy,
            config,
            bus: EventBus::default(),
        }
    }

    /// Publish on an existing bus, e.g. one shared with other runners.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Start a run in the background and return its event stream.
    ///
    /// The sandbox name is assigned before this returns. The run proceeds
    /// whether or not the stream is polled. Must be called from within a
    /// Tokio runtime.
    pub fn run(&self, options: RunOptions, payload: S::Payload) -> RunStream {
        let name = sandbox_name(&self.config.base_name);
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = RunEmitter::new(name.clone(), self.bus.clone(), tx);
        let runner = self.clone();
        let task_name = name.clone();
        tokio::spawn(async move {
            runner.execute(&task_name, options, payload, emitter).await;
        });
        RunStream::new(name, rx)
    }

    /// Run and wait for the terminal outcome.
    pub async fn run_to_completion(&self, options: RunOptions, payload: S::Payload) -> RemovalOutcome {
        self.run(options, payload).outcome().await
    }

    async fn execute(&self, name: &str, options: RunOptions, payload: S::Payload, emitter: RunEmitter) {
        let started = Instant::now();
        info!(sandbox = %name, image = %self.config.image_ref(), timeout_ms = options.timeout_ms, "run requested");

        let outcome = self.drive(name, &options, &payload, &emitter).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(info) => info!(
                sandbox = %name,
                exit_code = ?info.exit_code(),
                elapsed_ms = elapsed.as_millis() as u64,
                "run completed, sandbox removed"
            ),
            Err(e) => warn!(
                sandbox = %name,
                kind = %e.kind(),
                error = %e,
                elapsed_ms = elapsed.as_millis() as u64,
                "run failed"
            ),
        }

        #[cfg(feature = "metrics")]
        {
            let label = match &outcome {
                Ok(_) => "removed",
                Err(e) => e.kind().as_str(),
            };
            counter!(run_metrics::RUNS_TOTAL, "outcome" => label).increment(1);
            histogram!(run_metrics::RUN_DURATION_SECONDS).record(elapsed.as_secs_f64());
        }

        emitter.finish(outcome);
    }

    async fn drive(
        &self,
        name: &str,
        options: &RunOptions,
        payload: &S::Payload,
        emitter: &RunEmitter,
    ) -> RemovalOutcome {
        let (sandbox, pump) = self.create_sandbox(name, options).await?;
        emitter.created(&sandbox);

        #[cfg(feature = "metrics")]
        gauge!(run_metrics::ACTIVE_SANDBOXES).increment(1.0);

        let guard = RemovalGuard::arm(Arc::clone(&self.host), sandbox.handle().clone());
        let result = match self.execute_code(&sandbox, options, payload, emitter).await {
            Ok(()) => self.destroy(&sandbox).await,
            Err(err) => Err(self.cleanup_after_error(err, &sandbox).await),
        };
        // A failed destroy is terminal too; no second removal attempt.
        guard.disarm();

        #[cfg(feature = "metrics")]
        gauge!(run_metrics::ACTIVE_SANDBOXES).decrement(1.0);

        pump.drain(name, self.config.output_drain).await;
        result.map(|()| sandbox.info().clone())
    }

    /// Create, start and attach. Once the container exists any failure goes
    /// through cleanup so it is not stranded.
    async fn create_sandbox(&self, name: &str, options: &RunOptions) -> Result<(Sandbox, OutputPump), RunError> {
        let spec = CreateSpec {
            name: name.to_string(),
            image: self.config.image_ref(),
            options: self.strategy.container_options(options),
        };
        debug!(sandbox = %name, image = %spec.image, network_disabled = spec.options.network_disabled, "creating sandbox");

        let handle = self.host.create_container(&spec).await.map_err(|e| {
            RunError::new(
                ErrorKind::CreateRunner,
                None,
                format!("failed to create sandbox {name}: {e}"),
            )
        })?;
        let sandbox = Sandbox::new(name, handle);

        match self.start_and_attach(&sandbox).await {
            Ok(pump) => Ok((sandbox, pump)),
            Err(e) => {
                let err = RunError::new(
                    ErrorKind::CreateRunner,
                    Some(sandbox.clone()),
                    format!("failed to start sandbox {name}: {e}"),
                );
                Err(self.cleanup_after_error(err, &sandbox).await)
            },
        }
    }

    async fn start_and_attach(&self, sandbox: &Sandbox) -> sandrun_host::Result<OutputPump> {
        self.host.start(sandbox.handle()).await?;
        let streams = self.host.attach(sandbox.handle()).await?;
        Ok(OutputPump::spawn(sandbox, streams))
    }

    async fn execute_code(
        &self,
        sandbox: &Sandbox,
        options: &RunOptions,
        payload: &S::Payload,
        emitter: &RunEmitter,
    ) -> Result<(), RunError> {
        self.strategy
            .before_run_code(self.host.as_ref(), sandbox, payload)
            .await
            .map_err(|e| RunError::new(ErrorKind::BeforeRun, Some(sandbox.clone()), format!("{e:#}")))?;

        emitter.started(sandbox.info());
        self.race_deadline(sandbox, options, payload).await?;
        emitter.finished(sandbox.info());

        self.strategy
            .before_remove_runner(self.host.as_ref(), sandbox, payload)
            .await
            .map_err(|e| RunError::new(ErrorKind::Run, Some(sandbox.clone()), format!("{e:#}")))
    }

    /// `run_code` against the deadline. Whichever loses is dropped.
    async fn race_deadline(
        &self,
        sandbox: &Sandbox,
        options: &RunOptions,
        payload: &S::Payload,
    ) -> Result<(), RunError> {
        let deadline = tokio::time::sleep(options.timeout());
        let execution = self.strategy.run_code(self.host.as_ref(), sandbox, payload);
        tokio::select! {
            biased;
            result = execution => result.map_err(|e| {
                RunError::new(ErrorKind::Run, Some(sandbox.clone()), format!("{e:#}"))
            }),
            () = deadline => {
                debug!(sandbox = %sandbox.name(), timeout_ms = options.timeout_ms, "deadline reached");
                Err(RunError::new(
                    ErrorKind::Timeout,
                    Some(sandbox.clone()),
                    format!("run exceeded {}ms", options.timeout_ms),
                ))
            },
        }
    }

    /// Forced removal, then wait until the host confirms it. "Not found" at
    /// either step means the sandbox is already gone.
    async fn destroy(&self, sandbox: &Sandbox) -> Result<(), RunError> {
        let handle = sandbox.handle();
        debug!(sandbox = %sandbox.name(), "removing sandbox");

        match self.host.remove(handle, true).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {
                debug!(sandbox = %sandbox.name(), "sandbox already gone");
            },
            Err(e) => {
                warn!(sandbox = %sandbox.name(), error = %e, "sandbox removal failed, it may be leaked");
                return Err(RunError::new(
                    ErrorKind::DestroyRunner,
                    Some(sandbox.clone()),
                    format!("failed to remove sandbox: {e}"),
                ));
            },
        }

        match self.host.wait_removed(handle).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(RunError::new(
                ErrorKind::WaitingDestruction,
                Some(sandbox.clone()),
                format!("removal not confirmed: {e}"),
            )),
        }
    }

    /// Best-effort destroy after `err`. A cleanup failure is attached to
    /// `err`, which keeps its kind.
    async fn cleanup_after_error(&self, err: RunError, sandbox: &Sandbox) -> RunError {
        debug!(sandbox = %sandbox.name(), kind = %err.kind(), "cleaning up after error");
        match self.destroy(sandbox).await {
            Ok(()) => err,
            Err(cleanup) => {
                warn!(sandbox = %sandbox.name(), error = %cleanup, "cleanup after error failed");
                #[cfg(feature = "metrics")]
                counter!(run_metrics::CLEANUP_FAILURES_TOTAL).increment(1);
                err.with_cleanup_failure(cleanup)
            },
        }
    }
}

/// Forces removal of a sandbox whose run task was torn down mid-flight.
struct RemovalGuard {
    host: Arc<dyn ContainerHost>,
    handle: Option<ContainerHandle>,
}

impl RemovalGuard {
    fn arm(host: Arc<dyn ContainerHost>, handle: ContainerHandle) -> Self {
        Self {
            host,
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sandbox = %handle, "runtime gone, sandbox may be leaked");
            return;
        };
        warn!(sandbox = %handle, "run aborted with a live sandbox, forcing removal");
        let host = Arc::clone(&self.host);
        runtime.spawn(async move {
            match host.remove(&handle, true).await {
                Ok(()) => {},
                Err(e) if e.is_not_found() => {},
                Err(e) => warn!(sandbox = %handle, error = %e, "forced removal failed"),
            }
        });
    }
}

/// Copies attached output into the sandbox sinks.
struct OutputPump {
    tasks: Vec<JoinHandle<()>>,
}

impl OutputPump {
    fn spawn(sandbox: &Sandbox, streams: OutputStreams) -> Self {
        let tasks = vec![
            tokio::spawn(pump(streams.stdout, sandbox.stdout().clone())),
            tokio::spawn(pump(streams.stderr, sandbox.stderr().clone())),
        ];
        Self { tasks }
    }

    /// Wait up to `grace` for both streams to reach EOF, then stop pumping.
    async fn drain(self, name: &str, grace: Duration) {
        let aborts: Vec<AbortHandle> = self.tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(self.tasks)).await.is_err() {
            debug!(sandbox = %name, grace_ms = grace.as_millis() as u64, "output still open after grace period");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

async fn pump(mut reader: BoxedReader, sink: OutputSink) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.append(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "output stream error");
                break;
            },
        }
    }
}
