mod image_commands;
mod run_command;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    sandrun_host::{ContainerHost, docker::DockerCliHost},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "sandrun", about = "sandrun: run untrusted code in one-shot containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run source code in a fresh sandbox and remove it afterwards.
    Run(run_command::RunArgs),
    /// Sandbox image management.
    Images {
        #[command(subcommand)]
        action: image_commands::ImageAction,
    },
    /// Check that the container runtime is reachable.
    Ping,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the path of the config file in use.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Logs go to stderr; stdout carries the sandboxed program's output.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn ping() -> anyhow::Result<()> {
    let config = sandrun_config::discover_and_load();
    let host = DockerCliHost::from(&config.docker);
    host.ping().await?;
    println!("{} is reachable", host.backend_name());
    Ok(())
}

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = sandrun_config::discover_and_load();
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
        },
        ConfigAction::Path => match sandrun_config::loader::find_config_file() {
            Some(path) => println!("{}", path.display()),
            None => println!("No config file found, using defaults."),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "sandrun starting");

    match cli.command {
        Commands::Run(args) => {
            let code = run_command::handle_run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        },
        Commands::Images { action } => image_commands::handle_images(action).await,
        Commands::Ping => ping().await,
        Commands::Config { action } => handle_config(action),
    }
}
