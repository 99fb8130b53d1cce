//! One user request end to end.
//!
//! A run loads conversation and memory context, classifies the request, then
//! takes one of three paths:
//!
//! - chat: stream a completion straight back, no sandbox.
//! - linear: discover packages, provision a sandbox, generate code once,
//!   gate it on risk and egress policy, execute, publish files, summarize.
//! - agent loop: let the orchestrator model drive sandbox and MCP tools for
//!   up to `maxAgentIterations` turns.
//!
//! Every phase is a ledger step. Whatever happens, the run ends with a
//! signed manifest and exactly one `done` event.

mod agent_loop;
mod chat;
mod linear;
mod publish;

use std::{sync::Arc, time::Instant};

use {
    crucible_config::{BudgetConfig, CrucibleConfig},
    crucible_mcp::McpManager,
    crucible_runs::{
        EgressPolicy, ManifestInput, NewRun, NewToolCall, RiskPolicy, RunBudget, RunCompletion,
        RunLedger, RunStatus, RunUsage, ToolCallStatus, build_signed_manifest, model_label,
        resolve_budget,
    },
    crucible_sandbox::{
        Language, ProviderKind, SandboxRuntime, SessionHandle, SessionManager, SessionOptions,
        SessionStage, executor::WORK_DIR,
    },
    secrecy::Secret,
    serde_json::json,
    tracing::{Instrument, error, info, info_span, warn},
};

use crate::{
    collaborators::{
        AssistantTurn, Collaborators, ExecutionSettings, HistoryTurn, MemoryContext, MemoryTurn,
        UsageEvent, UsageKind,
    },
    error::{Error, Result},
    events::{EventSink, StatusUpdate, WorkflowEvent},
    model::{ChatMessage, LlmProvider},
    providers::ProviderPair,
    router::{IntentType, RouterResult, classify_intent},
    tools::SafetyGate,
};

/// Turns of conversation history loaded before routing.
const RECENT_HISTORY_LIMIT: usize = 10;

pub const BUDGET_EXCEEDED_MESSAGE: &str =
    "Run budget was exceeded. Narrow the task scope or try again with smaller input.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowInput {
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    /// Uploads to copy into the sandbox before anything runs.
    pub file_ids: Vec<String>,
    /// Set when the user re-submits after an approval checkpoint.
    pub allow_dangerous: bool,
}

impl WorkflowInput {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    fn has_attachment(&self) -> bool {
        !self.file_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutcome {
    /// `None` when the ledger could not record the run.
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub total_time_ms: u64,
}

/// Mutable state of a single run.
struct RunContext {
    input: WorkflowInput,
    events: Arc<dyn EventSink>,
    run_id: Option<String>,
    budget: RunBudget,
    usage: RunUsage,
    settings: ExecutionSettings,
    history: Vec<ChatMessage>,
    intent_type: Option<IntentType>,
    sandbox_provider: Option<ProviderKind>,
}

impl RunContext {
    fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    fn emit(&self, event: WorkflowEvent) {
        self.events.send(event);
    }

    fn status(&self, stage: &str) {
        self.emit(WorkflowEvent::status(stage));
    }

    fn update(&self, update: StatusUpdate) {
        self.emit(WorkflowEvent::Status(update));
    }

    fn max_output_tokens(&self) -> u32 {
        u32::try_from(self.budget.max_output_tokens).unwrap_or(u32::MAX)
    }

    /// Assistant turn pre-filled with the run's identity and token totals.
    fn assistant_turn(&self, content: &str, model_used: &str) -> AssistantTurn {
        AssistantTurn {
            conversation_id: self.input.conversation_id.clone(),
            content: content.to_string(),
            intent: self
                .intent_type
                .map(|i| i.as_str().to_string())
                .unwrap_or_default(),
            model_used: model_used.to_string(),
            tokens_in: self.usage.input_tokens,
            tokens_out: self.usage.output_tokens,
            run_id: self.run_id.clone(),
            metadata: json!({}),
            ..Default::default()
        }
    }
}

pub struct Workflow {
    router: Arc<dyn LlmProvider>,
    orchestrator: Arc<dyn LlmProvider>,
    sessions: Arc<SessionManager>,
    mcp: Option<Arc<McpManager>>,
    ledger: RunLedger,
    gate: SafetyGate,
    budget: BudgetConfig,
    signing_key: Option<Secret<String>>,
    agent_loop: bool,
    ports: Collaborators,
}

impl Workflow {
    pub fn new(
        config: &CrucibleConfig,
        providers: ProviderPair,
        sessions: Arc<SessionManager>,
        ledger: RunLedger,
        ports: Collaborators,
    ) -> Result<Self> {
        let gate = SafetyGate::new(
            RiskPolicy::from_config(&config.risk)?,
            EgressPolicy::from_config(&config.egress),
        );
        Ok(Self {
            router: providers.router,
            orchestrator: providers.orchestrator,
            sessions,
            mcp: None,
            ledger,
            gate,
            budget: config.budget.clone(),
            signing_key: config.manifest.signing_key.clone(),
            agent_loop: config.workflow.agent_loop,
            ports,
        })
    }

    #[must_use]
    pub fn with_mcp(mut self, mcp: Arc<McpManager>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    #[must_use]
    pub fn with_agent_loop(mut self, enabled: bool) -> Self {
        self.agent_loop = enabled;
        self
    }

    /// Run one request. Never fails: errors end the run as `failed` and are
    /// reported through `events`.
    pub async fn run(&self, input: WorkflowInput, events: Arc<dyn EventSink>) -> WorkflowOutcome {
        let started = Instant::now();
        let settings = self.execution_settings(&input.user_id).await;
        let budget = resolve_budget(settings.budget.as_ref(), &self.budget);
        let run_id = self
            .ledger
            .create_run(NewRun {
                user_id: input.user_id.clone(),
                conversation_id: input.conversation_id.clone(),
                model_used: model_label(self.router.id()).to_string(),
                budget,
            })
            .await;

        let span = info_span!(
            "workflow",
            run_id = run_id.as_deref().unwrap_or("unrecorded"),
            user_id = %input.user_id,
        );
        let mut ctx = RunContext {
            input,
            events,
            run_id,
            budget,
            usage: RunUsage::default(),
            settings,
            history: Vec::new(),
            intent_type: None,
            sandbox_provider: None,
        };
        let status = self.drive_and_finish(&mut ctx).instrument(span).await;

        let total_time_ms = elapsed_ms(started);
        ctx.emit(WorkflowEvent::Done {
            total_time_ms,
            run_id: ctx.run_id.clone(),
            status,
        });
        WorkflowOutcome {
            run_id: ctx.run_id,
            status,
            total_time_ms,
        }
    }

    async fn drive_and_finish(&self, ctx: &mut RunContext) -> RunStatus {
        match self.drive(ctx).await {
            Ok(status) => {
                if ctx.budget.is_exceeded(&ctx.usage) {
                    warn!(usage = ?ctx.usage, "run budget exceeded");
                    ctx.emit(WorkflowEvent::error(BUDGET_EXCEEDED_MESSAGE));
                }
                self.finish(ctx, status, None).await;
                info!(status = %status, cost_usd = ctx.usage.estimated_cost_usd, "workflow finished");
                status
            },
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "workflow failed");
                ctx.emit(WorkflowEvent::error(message.clone()));
                self.finish(ctx, RunStatus::Failed, Some(message)).await;
                RunStatus::Failed
            },
        }
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<RunStatus> {
        ctx.status("memory_loading");
        ctx.history = self.load_history(ctx).await;

        let intent = self.route(ctx).await?;
        ctx.intent_type = Some(intent.intent);
        ctx.update(StatusUpdate {
            intent: Some(intent.intent.as_str().to_string()),
            ..StatusUpdate::new("classified")
        });

        match intent.intent {
            IntentType::Chat => self.run_chat(ctx).await,
            _ if self.agent_loop => self.run_agent_loop(ctx, &intent).await,
            _ => self.run_linear(ctx, &intent).await,
        }
    }

    async fn finish(&self, ctx: &RunContext, status: RunStatus, error_message: Option<String>) {
        self.ledger
            .complete_run(ctx.run_id(), RunCompletion {
                status,
                intent_type: ctx.intent_type.map(|i| i.as_str().to_string()),
                usage: ctx.usage,
                error_message: error_message.clone(),
            })
            .await;
        self.record_manifest(ctx, status, error_message).await;
    }

    async fn record_manifest(
        &self,
        ctx: &RunContext,
        status: RunStatus,
        error_message: Option<String>,
    ) {
        let Some(run_id) = ctx.run_id.clone() else {
            return;
        };
        let input = ManifestInput {
            run_id,
            user_id: ctx.input.user_id.clone(),
            conversation_id: ctx.input.conversation_id.clone(),
            status,
            intent_type: ctx.intent_type.map(|i| i.as_str().to_string()),
            model_used: model_label(self.router.id()).to_string(),
            usage: ctx.usage,
            sandbox_provider: ctx.sandbox_provider.map(|p| p.as_str().to_string()),
            error_message,
        };
        match build_signed_manifest(input, self.signing_key.as_ref()) {
            Ok(signed) => self.ledger.record_manifest(ctx.run_id(), None, &signed).await,
            Err(e) => warn!(error = %e, "failed to build run manifest"),
        }
    }

    // ── Phases shared by the paths ─────────────────────────────────────────

    async fn execution_settings(&self, user_id: &str) -> ExecutionSettings {
        self.ports
            .profiles
            .execution_settings(user_id)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, user_id, "failed to load execution settings, using defaults");
                ExecutionSettings::default()
            })
    }

    /// Memory context first, then the recent turns.
    async fn load_history(&self, ctx: &RunContext) -> Vec<ChatMessage> {
        let input = &ctx.input;
        let turns = self
            .ports
            .conversations
            .recent_history(&input.user_id, &input.conversation_id, RECENT_HISTORY_LIMIT)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load conversation history");
                Vec::new()
            });
        let memory = self
            .ports
            .memory
            .context(&input.user_id, &input.conversation_id, &input.message)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load memory context");
                MemoryContext::default()
            });
        memory
            .to_message()
            .into_iter()
            .chain(turns.iter().map(HistoryTurn::to_chat))
            .collect()
    }

    async fn route(&self, ctx: &mut RunContext) -> Result<RouterResult> {
        ctx.status("routing");
        let has_attachment = ctx.input.has_attachment();
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "route_intent",
                json!({"hasAttachment": has_attachment, "historyMessages": ctx.history.len()}),
            )
            .await;
        let started = Instant::now();
        let classified =
            classify_intent(self.router.as_ref(), &ctx.input.message, has_attachment).await;
        let (intent, usage) = self.or_fail_step(step.as_deref(), classified).await?;

        let cost =
            ctx.usage
                .add_llm_call(self.router.id(), usage.input_tokens, usage.output_tokens);
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(self.router.name().to_string()),
                input: json!({"hasAttachment": has_attachment}),
                output: json!({
                    "intent": intent.intent,
                    "language": intent.language,
                    "suggestedPackages": intent.suggested_packages,
                }),
                duration_ms: Some(elapsed_ms(started)),
                cost_estimate_usd: cost,
                ..NewToolCall::new(ctx.run_id(), "intent_router", ToolCallStatus::Completed)
            })
            .await;
        self.ledger
            .complete_step(
                step.as_deref(),
                json!({"intent": intent.intent, "language": intent.language}),
            )
            .await;
        Ok(intent)
    }

    async fn require_sandbox_access(&self, ctx: &RunContext) -> Result<()> {
        let user_id = &ctx.input.user_id;
        if self.ports.entitlements.sandbox_allowed(user_id).await? {
            Ok(())
        } else {
            Err(Error::SandboxNotEntitled {
                user_id: user_id.clone(),
            })
        }
    }

    async fn start_sandbox(&self, ctx: &mut RunContext) -> Result<SessionHandle> {
        ctx.status("sandbox_starting");
        let step = self
            .ledger
            .start_step(ctx.run_id(), "sandbox_start", json!({}))
            .await;

        let events = Arc::clone(&ctx.events);
        let options = SessionOptions {
            preferred: ctx.settings.preferred_provider,
            strict_no_fallback: ctx.settings.strict_no_fallback,
            on_stage: Some(Arc::new(move |stage: SessionStage| {
                events.send(WorkflowEvent::status(stage.as_str()));
            })),
        };
        let created = self
            .sessions
            .get_or_create(&ctx.input.user_id, &options)
            .await;
        let session = self.or_fail_step(step.as_deref(), created).await?;

        ctx.sandbox_provider = Some(session.provider);
        self.ledger
            .complete_step(
                step.as_deref(),
                json!({
                    "success": true,
                    "provider": session.provider,
                    "fallbackActive": session.fallback_active,
                }),
            )
            .await;
        ctx.update(StatusUpdate {
            provider: Some(session.provider.as_str().to_string()),
            ..StatusUpdate::new("sandbox_ready")
        });
        Ok(session)
    }

    /// Copy the request's uploads into the sandbox work dir. Missing uploads
    /// are skipped; a failed write fails the run.
    async fn upload_files(&self, ctx: &RunContext, sandbox: &dyn SandboxRuntime) -> Result<()> {
        let input = &ctx.input;
        if input.file_ids.is_empty() {
            return Ok(());
        }
        ctx.status("uploading_files");
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "upload_files",
                json!({"fileCount": input.file_ids.len()}),
            )
            .await;

        let mut uploaded = 0usize;
        for file_id in &input.file_ids {
            let file = match self.ports.blobs.fetch_upload(&input.user_id, file_id).await {
                Ok(Some(file)) => file,
                Ok(None) => {
                    warn!(%file_id, "uploaded file not found, skipping");
                    continue;
                },
                Err(e) => {
                    warn!(%file_id, error = %e, "failed to fetch uploaded file, skipping");
                    continue;
                },
            };
            let name = file.filename.rsplit('/').next().unwrap_or(&file.filename);
            let path = format!("{WORK_DIR}{name}");
            let written = sandbox.write_file(&path, &file.content).await;
            self.or_fail_step(step.as_deref(), written).await?;
            uploaded += 1;
        }

        self.ledger
            .complete_step(step.as_deref(), json!({"uploaded": uploaded}))
            .await;
        Ok(())
    }

    async fn save_turn(&self, ctx: &RunContext, turn: AssistantTurn) {
        if let Err(e) = self
            .ports
            .conversations
            .save_assistant_turn(&ctx.input.user_id, turn)
            .await
        {
            warn!(error = %e, "failed to persist assistant turn");
        }
    }

    /// Update long-term memory in the background.
    fn queue_memory_update(&self, ctx: &RunContext, assistant_message: &str) {
        let memory = Arc::clone(&self.ports.memory);
        let turn = MemoryTurn {
            user_id: ctx.input.user_id.clone(),
            conversation_id: ctx.input.conversation_id.clone(),
            user_message: ctx.input.message.clone(),
            assistant_message: assistant_message.to_string(),
        };
        tokio::spawn(
            async move {
                if let Err(e) = memory.remember_turn(turn).await {
                    warn!(error = %e, "memory update failed");
                }
            }
            .in_current_span(),
        );
    }

    async fn track_usage(&self, ctx: &RunContext, kind: UsageKind, sandbox_ms: u64, model: &str) {
        let event = UsageEvent {
            user_id: ctx.input.user_id.clone(),
            kind,
            tokens_in: ctx.usage.input_tokens,
            tokens_out: ctx.usage.output_tokens,
            sandbox_duration_ms: sandbox_ms,
            model: model.to_string(),
        };
        if let Err(e) = self.ports.usage.record(event).await {
            warn!(error = %e, "failed to track usage");
        }
    }

    /// Fail the ledger step before handing the error back.
    async fn or_fail_step<T, E>(
        &self,
        step: Option<&str>,
        result: std::result::Result<T, E>,
    ) -> Result<T>
    where
        E: Into<Error>,
    {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let e = e.into();
                self.ledger.fail_step(step, &e.to_string()).await;
                Err(e)
            },
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Generated code is Python unless the router asked for JavaScript.
fn execution_language(intent_language: &str) -> Language {
    match intent_language {
        "javascript" => Language::Javascript,
        _ => Language::Python,
    }
}
