mod doctor_commands;
mod run_commands;
mod sandbox_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "crucible", about = "Crucible, sandboxed code execution for LLM agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of the standard locations.
    #[arg(long, global = true, env = "CRUCIBLE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// MicroVM controller: forwards to the backend over the selected transport.
    Microvmctl {
        #[command(subcommand)]
        action: sandbox_commands::MicrovmAction,
    },
    /// Check whether the local microVM provider is ready.
    Probe {
        /// Ignore the cached result.
        #[arg(long)]
        fresh: bool,
        /// Kill the probe after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Validate configuration and audit the environment.
    Doctor,
    /// Run one request through the workflow and print events as JSON lines.
    Run(run_commands::RunArgs),
}

/// Logs always go to stderr; `microvmctl` uses stdout as its data channel.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
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

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<crucible_config::CrucibleConfig> {
    match path {
        Some(path) => {
            let mut config = crucible_config::load_config(path)?;
            crucible_config::apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(crucible_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    debug!(version = env!("CARGO_PKG_VERSION"), "crucible starting");

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Microvmctl { action } => {
            let code = sandbox_commands::handle_microvmctl(action, &config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        },
        Commands::Probe { fresh, timeout_ms } => {
            sandbox_commands::handle_probe(&config, fresh, timeout_ms).await
        },
        Commands::Doctor => doctor_commands::handle_doctor(&config, cli.config.as_deref()).await,
        Commands::Run(args) => run_commands::handle_run(args, &config).await,
    }
}
