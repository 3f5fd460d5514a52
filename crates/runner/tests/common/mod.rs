//! In-memory container host for lifecycle tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    io::Read,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    sandrun_host::{
        ContainerHandle, ContainerHost, CreateSpec, ExecOutput, ExecRequest, HostError, ImageInfo,
        OutputStreams, PullStream, Result,
    },
    tokio::io::{AsyncWriteExt, DuplexStream},
};

/// How the mock answers `remove` or `wait_removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Removal {
    #[default]
    Ok,
    NotFound,
    Fail,
}

/// What an `exec` writes and returns.
#[derive(Debug, Clone, Default)]
pub struct ExecReply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecReply {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }
}

/// Files uploaded to one container, keyed by absolute path.
pub type Files = HashMap<String, String>;

type ExecHandler = Box<dyn Fn(&ExecRequest, &Files) -> ExecReply + Send + Sync>;

struct Container {
    stdout_tx: DuplexStream,
    stderr_tx: DuplexStream,
    attach: Option<(DuplexStream, DuplexStream)>,
    files: Files,
}

/// Failure injection for [`MockHost`].
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_attach: bool,
    pub exec_hangs: bool,
    pub removal: Removal,
    pub wait: Removal,
}

#[derive(Default)]
pub struct MockHost {
    behavior: Behavior,
    exec_handler: Option<ExecHandler>,
    containers: tokio::sync::Mutex<HashMap<String, Container>>,
    calls: Mutex<HashMap<(&'static str, String), usize>>,
    created: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn on_exec(
        mut self,
        handler: impl Fn(&ExecRequest, &Files) -> ExecReply + Send + Sync + 'static,
    ) -> Self {
        self.exec_handler = Some(Box::new(handler));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn record(&self, op: &'static str, name: &str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry((op, name.to_string()))
            .or_default() += 1;
    }

    /// Number of `op` calls made for the sandbox `name`.
    pub fn calls(&self, op: &'static str, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&(op, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self, op: &'static str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|((o, _), _)| *o == op)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// Containers the mock still considers alive.
    pub async fn live(&self) -> usize {
        self.containers.lock().await.len()
    }
}

fn unpack(archive: &[u8], dest_dir: &str) -> Files {
    let mut files = Files::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        files.insert(format!("{}/{path}", dest_dir.trim_end_matches('/')), body);
    }
    files
}

#[async_trait]
impl ContainerHost for MockHost {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerHandle> {
        self.record("create", &spec.name);
        if self.behavior.fail_create {
            return Err(HostError::operation("create", "image not found"));
        }
        let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
        self.containers.lock().await.insert(spec.name.clone(), Container {
            stdout_tx,
            stderr_tx,
            attach: Some((stdout_rx, stderr_rx)),
            files: Files::new(),
        });
        self.created.lock().unwrap().push(spec.name.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerHandle::new(format!("mock-{id}"), &spec.name))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("start", handle.name());
        if self.behavior.fail_start {
            return Err(HostError::operation("start", "cannot start"));
        }
        Ok(())
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStreams> {
        self.record("attach", handle.name());
        if self.behavior.fail_attach {
            return Err(HostError::operation("attach", "failed to attach"));
        }
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(handle.name())
            .ok_or_else(|| HostError::NotFound(handle.name().to_string()))?;
        let (stdout, stderr) = container
            .attach
            .take()
            .ok_or_else(|| HostError::operation("attach", "already attached"))?;
        Ok(OutputStreams {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        })
    }

    async fn exec(&self, handle: &ContainerHandle, request: &ExecRequest) -> Result<ExecOutput> {
        self.record("exec", handle.name());
        if self.behavior.exec_hangs {
            std::future::pending::<()>().await;
        }
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(handle.name())
            .ok_or_else(|| HostError::NotFound(handle.name().to_string()))?;
        let reply = self
            .exec_handler
            .as_ref()
            .map(|h| h(request, &container.files))
            .unwrap_or_default();
        container.stdout_tx.write_all(&reply.stdout).await?;
        container.stderr_tx.write_all(&reply.stderr).await?;
        Ok(ExecOutput {
            exit_code: reply.exit_code,
        })
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        self.record("put_archive", handle.name());
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(handle.name())
            .ok_or_else(|| HostError::NotFound(handle.name().to_string()))?;
        container.files.extend(unpack(&archive, dest_dir));
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle, _force: bool) -> Result<()> {
        self.record("remove", handle.name());
        match self.behavior.removal {
            Removal::Ok => {
                // Dropping the writers closes the attached streams.
                self.containers.lock().await.remove(handle.name());
                Ok(())
            },
            Removal::NotFound => {
                self.containers.lock().await.remove(handle.name());
                Err(HostError::NotFound(handle.name().to_string()))
            },
            Removal::Fail => Err(HostError::operation("rm", "daemon busy")),
        }
    }

    async fn wait_removed(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("wait", handle.name());
        match self.behavior.wait {
            Removal::Ok => Ok(()),
            Removal::NotFound => Err(HostError::NotFound(handle.name().to_string())),
            Removal::Fail => Err(HostError::TimedOut {
                operation: "wait",
                waited_ms: 5000,
            }),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(Vec::new())
    }

    async fn pull(&self, _image: &str, _tag: &str) -> Result<PullStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}
