//! One-shot sandbox runs.
//!
//! A [`Runner`] drives a single sandbox through create → prepare → execute
//! (raced against a deadline) → destroy, delegating code injection and
//! execution to a [`Strategy`]. Every sandbox that gets created is destroyed
//! on every exit path. Lifecycle events are published on an [`EventBus`]
//! shared by all runs and on a per-run [`RunStream`].

pub mod archive;
pub mod error;
pub mod events;
pub mod inline;
pub mod options;
pub mod runner;
pub mod sandbox;
pub mod strategy;

pub use {
    error::{ErrorKind, RunError},
    events::{EventBus, RemovalOutcome, RunEvent, RunStream, Subscription, Tagged},
    inline::{InlinePayload, InlineStrategy},
    options::{RunOptions, RunnerConfig},
    runner::Runner,
    sandbox::{OutputSink, Sandbox, SandboxInfo},
    strategy::Strategy,
};
