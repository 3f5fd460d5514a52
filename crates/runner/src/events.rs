//! Lifecycle events: a shared four-channel bus plus a per-run stream.

use std::{
    pin::Pin,
    sync::{Arc, Mutex, OnceLock},
    task::{Context, Poll},
};

use {
    futures::{Stream, StreamExt},
    tokio::sync::mpsc,
    tokio_stream::wrappers::UnboundedReceiverStream,
    tracing::warn,
};

use crate::{
    error::{ErrorKind, RunError},
    sandbox::{Sandbox, SandboxInfo},
};

/// A bus value tagged with the sandbox it concerns.
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub sandbox_name: String,
    pub value: T,
}

/// Terminal outcome carried by the removal channel.
pub type RemovalOutcome = Result<SandboxInfo, RunError>;

/// Receiving end of one bus channel. Never lags: every value published after
/// subscribing is delivered.
pub type Subscription<T> = mpsc::UnboundedReceiver<Tagged<T>>;

/// One lifecycle event of a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The sandbox exists and its output is attached.
    Created(SandboxInfo),
    /// Code execution is about to begin.
    Started(SandboxInfo),
    /// Code execution completed successfully.
    Finished(SandboxInfo),
    /// Terminal: the sandbox is confirmed gone.
    Removed(SandboxInfo),
    /// Terminal: the run failed.
    Errored(RunError),
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed(_) | Self::Errored(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Started(_) => "started",
            Self::Finished(_) => "finished",
            Self::Removed(_) => "removed",
            Self::Errored(_) => "errored",
        }
    }
}

/// Fan-out to any number of unbounded subscribers. Closed subscribers are
/// pruned on the next send.
struct Channel<T> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Tagged<T>>>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Channel<T> {
    fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn send(&self, sandbox_name: &str, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| {
            tx.send(Tagged {
                sandbox_name: sandbox_name.to_string(),
                value: value.clone(),
            })
            .is_ok()
        });
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Event channels shared by every run of a runner.
///
/// Each channel carries at most one value per run. `removed` doubles as the
/// error channel: it carries `Err` when a run fails. Subscriptions are
/// unbounded, so a slow subscriber never loses events; drop a subscription
/// once it is no longer read.
#[derive(Clone, Default)]
pub struct EventBus {
    created: Channel<SandboxInfo>,
    started: Channel<SandboxInfo>,
    finished: Channel<SandboxInfo>,
    removed: Channel<RemovalOutcome>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("removed_subscribers", &self.removed.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn on_runner_created(&self) -> Subscription<SandboxInfo> {
        self.created.subscribe()
    }

    pub fn on_run_started(&self) -> Subscription<SandboxInfo> {
        self.started.subscribe()
    }

    pub fn on_run_finished(&self) -> Subscription<SandboxInfo> {
        self.finished.subscribe()
    }

    pub fn on_runner_removed(&self) -> Subscription<RemovalOutcome> {
        self.removed.subscribe()
    }

    /// Route an event to its channel. Dropped silently when nobody listens.
    pub(crate) fn publish(&self, sandbox_name: &str, event: &RunEvent) {
        match event {
            RunEvent::Created(info) => self.created.send(sandbox_name, info.clone()),
            RunEvent::Started(info) => self.started.send(sandbox_name, info.clone()),
            RunEvent::Finished(info) => self.finished.send(sandbox_name, info.clone()),
            RunEvent::Removed(info) => self.removed.send(sandbox_name, Ok(info.clone())),
            RunEvent::Errored(err) => self.removed.send(sandbox_name, Err(err.clone())),
        }
    }
}

/// Emits one run's events to both the shared bus and the run's own stream.
///
/// The terminal event is sent through [`RunEmitter::finish`], which consumes
/// the emitter. An emitter dropped without finishing (the run task panicked
/// or was cancelled) sends a `Run` error instead, so every run ends with
/// exactly one terminal event.
pub(crate) struct RunEmitter {
    sandbox_name: String,
    bus: EventBus,
    tx: mpsc::UnboundedSender<RunEvent>,
    sandbox: OnceLock<Sandbox>,
    finished: bool,
}

impl RunEmitter {
    pub(crate) fn new(
        sandbox_name: String,
        bus: EventBus,
        tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            sandbox_name,
            bus,
            tx,
            sandbox: OnceLock::new(),
            finished: false,
        }
    }

    fn emit(&self, event: RunEvent) {
        self.bus.publish(&self.sandbox_name, &event);
        // The caller may have dropped its stream; the bus still gets the event.
        let _ = self.tx.send(event);
    }

    /// Also remembers the sandbox for the abandoned-run error.
    pub(crate) fn created(&self, sandbox: &Sandbox) {
        let _ = self.sandbox.set(sandbox.clone());
        self.emit(RunEvent::Created(sandbox.info().clone()));
    }

    pub(crate) fn started(&self, info: &SandboxInfo) {
        self.emit(RunEvent::Started(info.clone()));
    }

    pub(crate) fn finished(&self, info: &SandboxInfo) {
        self.emit(RunEvent::Finished(info.clone()));
    }

    pub(crate) fn finish(mut self, outcome: RemovalOutcome) {
        self.finished = true;
        self.emit(match outcome {
            Ok(info) => RunEvent::Removed(info),
            Err(err) => RunEvent::Errored(err),
        });
    }
}

impl Drop for RunEmitter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(sandbox = %self.sandbox_name, "run task ended without a result");
        let sandbox = self.sandbox.get().cloned();
        let message = if sandbox.is_some() {
            "run aborted; sandbox removal was forced"
        } else {
            "run aborted before the sandbox was created"
        };
        self.emit(RunEvent::Errored(RunError::new(
            ErrorKind::Run,
            sandbox,
            message,
        )));
    }
}

/// Events of a single run, ending with exactly one terminal event.
pub struct RunStream {
    sandbox_name: String,
    inner: UnboundedReceiverStream<RunEvent>,
}

impl RunStream {
    pub(crate) fn new(sandbox_name: String, rx: mpsc::UnboundedReceiver<RunEvent>) -> Self {
        Self {
            sandbox_name,
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Name of the sandbox this run creates (assigned before creation starts).
    pub fn sandbox_name(&self) -> &str {
        &self.sandbox_name
    }

    /// Drain the stream and return the terminal outcome.
    pub async fn outcome(mut self) -> RemovalOutcome {
        while let Some(event) = self.inner.next().await {
            match event {
                RunEvent::Removed(info) => return Ok(info),
                RunEvent::Errored(err) => return Err(err),
                _ => {},
            }
        }
        Err(RunError::new(
            ErrorKind::Run,
            None,
            format!(
                "run of {} ended without a terminal event",
                self.sandbox_name
            ),
        ))
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
