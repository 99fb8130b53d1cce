//! `crucible run`: one request through the workflow, events streamed to
//! stdout as JSON lines.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    clap::Args,
    crucible_agents::{
        ChannelSink, EventSink, ExecutionSettings, InMemoryCollaborators, Workflow,
        WorkflowInput, anthropic_pair,
    },
    crucible_config::CrucibleConfig,
    crucible_mcp::{McpManager, RegistryClient, StdioConnector},
    crucible_runs::{InMemoryRunStore, RunLedger, RunStatus},
    crucible_sandbox::{DefaultSandboxFactory, IdleAutoStop, ProviderPreference, SessionManager},
    tracing::{info, warn},
};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// The request, as the user would type it.
    #[arg(long, short)]
    pub message: String,

    #[arg(long, default_value = "cli")]
    pub user: String,

    #[arg(long, default_value = "cli")]
    pub conversation: String,

    /// Skip the approval checkpoint for risky code.
    #[arg(long)]
    pub allow_dangerous: bool,

    /// `auto`, `local_microvm` or `remote_e2b`. Defaults to
    /// `sandbox.default_provider`.
    #[arg(long)]
    pub provider: Option<String>,

    /// Fail instead of falling back to another provider.
    #[arg(long)]
    pub strict: bool,

    /// Use the tool-calling agent loop instead of the linear pipeline.
    #[arg(long)]
    pub agent_loop: bool,

    /// Print the run ledger export once the run ends.
    #[arg(long)]
    pub export: bool,
}

impl RunArgs {
    fn settings(&self, config: &CrucibleConfig) -> ExecutionSettings {
        let provider = self
            .provider
            .as_deref()
            .unwrap_or(&config.sandbox.default_provider);
        ExecutionSettings {
            preferred_provider: ProviderPreference::parse(provider),
            strict_no_fallback: self.strict,
            budget: None,
        }
    }

    fn input(&self) -> WorkflowInput {
        WorkflowInput {
            allow_dangerous: self.allow_dangerous,
            ..WorkflowInput::new(&self.user, &self.conversation, &self.message)
        }
    }
}

pub async fn handle_run(args: RunArgs, config: &CrucibleConfig) -> Result<()> {
    let providers = anthropic_pair(&config.llm)?;
    let factory =
        DefaultSandboxFactory::from_config(config).context("failed to set up sandbox providers")?;
    let sessions = Arc::new(
        SessionManager::new(Arc::new(factory), config)
            .with_idle_auto_stop(Arc::new(IdleAutoStop::from_config(&config.microvm))),
    );
    let ledger = RunLedger::new(Arc::new(InMemoryRunStore::new()));

    let collaborators = InMemoryCollaborators::new();
    collaborators.profiles.set(&args.user, args.settings(config));

    let mcp = McpManager::new(
        &config.mcp,
        Arc::new(StdioConnector),
        Some(RegistryClient::from_config(&config.mcp)),
    );
    let mut workflow = Workflow::new(
        config,
        providers,
        Arc::clone(&sessions),
        ledger.clone(),
        collaborators.ports(),
    )?
    .with_mcp(Arc::new(mcp));
    if args.agent_loop {
        workflow = workflow.with_agent_loop(true);
    }

    let (sink, mut rx) = ChannelSink::new();
    let sink = Arc::new(sink);
    let printer = {
        // Weak, so the channel closes once the workflow drops its sink.
        let sink = Arc::downgrade(&sink);
        async move {
            let mut interrupted = false;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => warn!(error = %e, "failed to serialize event"),
                        }
                    },
                    _ = tokio::signal::ctrl_c(), if !interrupted => {
                        warn!("interrupted, stopping the run");
                        interrupted = true;
                        if let Some(sink) = sink.upgrade() {
                            sink.abort();
                        }
                    },
                }
            }
        }
    };
    let events: Arc<dyn EventSink> = sink;
    let (outcome, ()) = tokio::join!(workflow.run(args.input(), events), printer);

    info!(
        run_id = outcome.run_id.as_deref().unwrap_or("-"),
        status = outcome.status.as_str(),
        total_time_ms = outcome.total_time_ms,
        "run finished"
    );

    if args.export
        && let Some(run_id) = outcome.run_id.as_deref()
    {
        let export = ledger.export_run(run_id).await?;
        println!("{}", serde_json::to_string_pretty(&export)?);
    }

    sessions.shutdown().await;

    if outcome.status == RunStatus::Failed {
        anyhow::bail!("run failed");
    }
    Ok(())
}
