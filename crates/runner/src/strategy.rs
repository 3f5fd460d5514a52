use {async_trait::async_trait, sandrun_host::{ContainerHost, ContainerOptions}};

use crate::{options::RunOptions, sandbox::Sandbox};

/// How a particular language or mode gets code into a sandbox and runs it.
///
/// The runner owns the lifecycle; a strategy only fills in the steps. Hooks
/// receive the live sandbox and the caller's payload, which the runner never
/// inspects. Hook errors are classified by the stage that called them.
#[async_trait]
pub trait Strategy: Send + Sync + 'static {
    /// Strategy-specific input of one run (source text, file names, …).
    type Payload: Send + Sync + 'static;

    /// Host creation parameters for a run with `options`.
    fn container_options(&self, options: &RunOptions) -> ContainerOptions;

    /// Prepare the sandbox before execution (copy files in, …).
    async fn before_run_code(
        &self,
        _host: &dyn ContainerHost,
        _sandbox: &Sandbox,
        _payload: &Self::Payload,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Execute the code. Raced against the run's deadline; dropped if it loses.
    async fn run_code(
        &self,
        host: &dyn ContainerHost,
        sandbox: &Sandbox,
        payload: &Self::Payload,
    ) -> anyhow::Result<()>;

    /// Called once after successful execution, before the sandbox is destroyed.
    async fn before_remove_runner(
        &self,
        _host: &dyn ContainerHost,
        _sandbox: &Sandbox,
        _payload: &Self::Payload,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
