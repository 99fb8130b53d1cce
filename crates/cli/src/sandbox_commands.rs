//! `crucible microvmctl` and `crucible probe`.

use std::time::Duration;

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    crucible_config::CrucibleConfig,
    crucible_sandbox::{MicrovmController, ReadinessProber},
};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MicrovmAction {
    /// Provision a sandbox instance.
    Create {
        #[arg(long)]
        id: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Run a shell command inside the instance.
    Exec {
        #[arg(long)]
        id: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Write stdin to a path inside the instance.
    Write {
        #[arg(long)]
        id: String,
        #[arg(long)]
        path: String,
    },
    /// Read a path from the instance.
    Read {
        #[arg(long)]
        id: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        base64: bool,
    },
    /// List a directory inside the instance.
    List {
        #[arg(long)]
        id: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Terminate the instance.
    Kill {
        #[arg(long)]
        id: String,
    },
    /// Reclaim state orphaned by earlier runs.
    Gc,
    /// Print transport and backend readiness as one JSON line.
    Probe,
}

impl MicrovmAction {
    /// Backend arguments, subcommand first.
    fn to_args(&self) -> Vec<String> {
        let with_id = |sub: &str, id: &str| vec![sub.to_string(), "--id".into(), id.to_string()];
        match self {
            Self::Create { id, ttl_ms } => {
                let mut args = with_id("create", id);
                if let Some(ttl) = ttl_ms {
                    args.extend(["--ttl-ms".into(), ttl.to_string()]);
                }
                args
            },
            Self::Exec {
                id,
                timeout_ms,
                command,
            } => {
                let mut args = with_id("exec", id);
                if let Some(timeout) = timeout_ms {
                    args.extend(["--timeout-ms".into(), timeout.to_string()]);
                }
                args.push("--".into());
                args.extend(command.iter().cloned());
                args
            },
            Self::Write { id, path } => {
                let mut args = with_id("write", id);
                args.extend(["--path".into(), path.clone()]);
                args
            },
            Self::Read { id, path, base64 } => {
                let mut args = with_id("read", id);
                args.extend(["--path".into(), path.clone()]);
                if *base64 {
                    args.push("--base64".into());
                }
                args
            },
            Self::List { id, path, json } => {
                let mut args = with_id("list", id);
                args.extend(["--path".into(), path.clone()]);
                if *json {
                    args.push("--json".into());
                }
                args
            },
            Self::Kill { id } => with_id("kill", id),
            Self::Gc => vec!["gc".into()],
            Self::Probe => vec!["probe".into()],
        }
    }
}

/// Returns the process exit status to use.
pub async fn handle_microvmctl(action: MicrovmAction, config: &CrucibleConfig) -> Result<i32> {
    let controller = MicrovmController::from_config(&config.microvm)?;

    if action == MicrovmAction::Probe {
        let outcome = controller.probe().await;
        println!("{}", serde_json::to_string(&outcome.report)?);
        return Ok(match outcome.failure {
            Some(reason) => {
                eprintln!("{reason}");
                1
            },
            None => 0,
        });
    }

    controller
        .passthrough(&action.to_args())
        .await
        .with_context(|| format!("microvmctl {} failed", controller.display()))
}

pub async fn handle_probe(
    config: &CrucibleConfig,
    fresh: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let prober = ReadinessProber::from_config(&config.sandbox)?;
    let result = prober
        .probe(fresh, timeout_ms.map(Duration::from_millis))
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
