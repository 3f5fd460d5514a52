//! Configuration loading for sandrun.
//!
//! Config files are discovered in the working directory first, then in
//! `~/.config/sandrun/`. `${ENV_VAR}` placeholders are substituted before
//! parsing. Supported formats: TOML, YAML, JSON.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, config_dir, discover_and_load, load_config, set_config_dir},
    schema::SandrunConfig,
};
