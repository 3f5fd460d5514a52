//! Container host boundary.
//!
//! [`ContainerHost`] is the set of calls the runner makes against a container
//! runtime: create, start, attach, exec, archive upload, forced removal,
//! removal wait, image listing and pulling. [`docker::DockerCliHost`] drives
//! the `docker` CLI; tests substitute an in-memory host.

pub mod docker;
pub mod error;
pub mod images;
pub mod types;

use {async_trait::async_trait, futures::stream::BoxStream};

pub use {
    error::HostError,
    types::{
        BoxedReader, ContainerHandle, ContainerOptions, CreateSpec, ExecOutput, ExecRequest,
        ImageInfo, OutputStreams, PullProgress, ResourceLimits,
    },
};

pub type Result<T> = std::result::Result<T, HostError>;

/// Stream of progress records produced by an image pull.
pub type PullStream = BoxStream<'static, Result<PullProgress>>;

/// Operations a container runtime must provide to host sandboxes.
///
/// Calls for one container are never issued concurrently by the runner, but
/// an implementation is shared by every in-flight run.
#[async_trait]
pub trait ContainerHost: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn backend_name(&self) -> &'static str;

    /// Check that the runtime is reachable.
    async fn ping(&self) -> Result<()>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Open the container's stdout/stderr. Streams end once the container is gone.
    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStreams>;

    /// Run a command inside the container. Its output goes to the attached streams.
    async fn exec(&self, handle: &ContainerHandle, request: &ExecRequest) -> Result<ExecOutput>;

    /// Extract a tar archive into `dest_dir` inside the container.
    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Remove the container. `HostError::NotFound` when it is already gone.
    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<()>;

    /// Resolve once the container has been removed.
    async fn wait_removed(&self, handle: &ContainerHandle) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Pull `image:tag`, yielding progress records until the pull completes.
    async fn pull(&self, image: &str, tag: &str) -> Result<PullStream>;
}
