//! Sandbox descriptor and its output sinks.

use std::sync::{Arc, Mutex, OnceLock};

use sandrun_host::ContainerHandle;

/// Append-only byte buffer collecting one output stream of a sandbox.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputSink(Arc<Mutex<Vec<u8>>>);

impl OutputSink {
    pub fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(bytes);
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Public view of a sandbox: what event consumers get to see.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub name: String,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    exit_code: Arc<OnceLock<i32>>,
}

impl SandboxInfo {
    /// Exit code of the executed command, once a strategy recorded one.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }
}

/// Descriptor of one live sandbox, owned by a single run.
#[derive(Debug, Clone)]
pub struct Sandbox {
    info: SandboxInfo,
    handle: ContainerHandle,
}

impl Sandbox {
    pub fn new(name: impl Into<String>, handle: ContainerHandle) -> Self {
        Self {
            info: SandboxInfo {
                name: name.into(),
                stdout: OutputSink::default(),
                stderr: OutputSink::default(),
                exit_code: Arc::new(OnceLock::new()),
            },
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn stdout(&self) -> &OutputSink {
        &self.info.stdout
    }

    pub fn stderr(&self) -> &OutputSink {
        &self.info.stderr
    }

    pub fn info(&self) -> &SandboxInfo {
        &self.info
    }

    /// Record the executed command's exit code. Only the first call sticks.
    pub fn record_exit_code(&self, code: i32) {
        let _ = self.info.exit_code.set(code);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.info.exit_code()
    }
}

/// Unique sandbox name: `<base>-<uuid v4>`.
pub fn sandbox_name(base: &str) -> String {
    format!("{base}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn sink_clones_share_buffer() {
        let sink = OutputSink::default();
        let clone = sink.clone();
        sink.append(b"hello ");
        clone.append(b"world");
        assert_eq!(sink.to_string_lossy(), "hello world");
        assert_eq!(clone.len(), 11);
        assert!(!clone.is_empty());
    }

    #[test]
    fn exit_code_is_write_once() {
        let sandbox = Sandbox::new("box", ContainerHandle::new("id", "box"));
        assert_eq!(sandbox.exit_code(), None);
        sandbox.record_exit_code(3);
        sandbox.record_exit_code(0);
        assert_eq!(sandbox.info().clone().exit_code(), Some(3));
    }

    #[test]
    fn names_carry_base_and_are_unique() {
        let names: HashSet<String> = (0..1000).map(|_| sandbox_name("python-runner")).collect();
        assert_eq!(names.len(), 1000);
        assert!(names.iter().all(|n| n.starts_with("python-runner-")));
    }
}
