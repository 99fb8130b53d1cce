//! Generate code once, check it, run it, summarize.

use std::time::Instant;

use {
    crucible_common::text::take_chars,
    crucible_runs::{ArtifactType, NewArtifact, NewToolCall, RunStatus, ToolCallStatus, model_label},
    crucible_sandbox::{Language, SandboxRuntime, execute_code, install_packages},
    serde_json::json,
    tracing::{info, warn},
};

use {
    super::{RunContext, Workflow, elapsed_ms, execution_language},
    crate::{
        codegen::{generate_code, summarize_results},
        collaborators::UsageKind,
        discovery::{discover_tools, packages_to_install},
        error::{Error, Result},
        events::{CheckpointKind, StatusUpdate, WorkflowEvent},
        router::RouterResult,
    },
};

pub const RISK_CHECKPOINT_REASON: &str = "Potentially destructive operations detected.";
pub const RISK_CHECKPOINT_MESSAGE: &str = "Execution paused for safety. Enable \"Allow risky actions\" and resend to continue with this generated code.";
pub const EGRESS_CHECKPOINT_REASON: &str = "Egress allowlist violation";
pub const EGRESS_BLOCKED_MESSAGE: &str = "Execution blocked by egress policy. The generated code attempted outbound hosts outside your allowlist.";

/// Installer output kept on the ledger.
const INSTALL_LOG_CHARS: usize = 4_000;

impl Workflow {
    pub(super) async fn run_linear(
        &self,
        ctx: &mut RunContext,
        intent: &RouterResult,
    ) -> Result<RunStatus> {
        self.require_sandbox_access(ctx).await?;
        let language = execution_language(&intent.language);

        // Discovery
        ctx.status("discovering");
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "discover_tools",
                json!({"language": intent.language}),
            )
            .await;
        let tools = discover_tools(&ctx.input.message, &intent.suggested_packages, &intent.language);
        let packages = packages_to_install(&tools, &intent.language);
        let tool_names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        self.ledger
            .complete_step(
                step.as_deref(),
                json!({"tools": tool_names, "packages": packages}),
            )
            .await;
        ctx.update(StatusUpdate {
            tools: Some(tool_names),
            packages: Some(packages.clone()),
            ..StatusUpdate::new("tools_found")
        });

        let session = self.start_sandbox(ctx).await?;
        let sandbox = session.sandbox.as_ref();
        let provider = session.provider.as_str();

        if !packages.is_empty() {
            self.install(ctx, sandbox, provider, &packages, intent).await;
        }
        self.upload_files(ctx, sandbox).await?;

        // Code generation
        ctx.status("generating_code");
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "generate_code",
                json!({"language": language.as_str()}),
            )
            .await;
        let started = Instant::now();
        let generated =
            generate_code(self.router.as_ref(), &ctx.input.message, &packages, &ctx.history).await;
        let (code, usage) = self.or_fail_step(step.as_deref(), generated).await?;
        let cost = ctx
            .usage
            .add_llm_call(self.router.id(), usage.input_tokens, usage.output_tokens);
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(self.router.name().to_string()),
                input: json!({"packages": packages, "language": language.as_str()}),
                output: json!({"codeLength": code.len()}),
                duration_ms: Some(elapsed_ms(started)),
                cost_estimate_usd: cost,
                ..NewToolCall::new(ctx.run_id(), "generate_code", ToolCallStatus::Completed)
            })
            .await;
        self.ledger
            .record_artifact(NewArtifact {
                run_step_id: step.clone(),
                metadata: json!({"code": code}),
                size_bytes: code.len() as u64,
                mime_type: Some("text/plain".into()),
                ..NewArtifact::new(
                    ctx.run_id(),
                    ArtifactType::Code,
                    format!("generated.{}", match language {
                        Language::Javascript => "js",
                        _ => "py",
                    }),
                )
            })
            .await;
        self.ledger
            .complete_step(step.as_deref(), json!({"codeLength": code.len()}))
            .await;
        ctx.emit(WorkflowEvent::Code {
            code: code.clone(),
            language: language.as_str().to_string(),
        });

        // Policy gates
        let router_model = model_label(self.router.id());
        let risk = self.gate.risk().inspect(&code);
        if risk.requires_approval && !ctx.input.allow_dangerous {
            info!(reasons = ?risk.reasons, "generated code needs approval");
            ctx.emit(WorkflowEvent::Checkpoint {
                kind: CheckpointKind::ApprovalRequired,
                reason: RISK_CHECKPOINT_REASON.into(),
                details: risk.reasons.clone(),
            });
            ctx.emit(WorkflowEvent::text(RISK_CHECKPOINT_MESSAGE));

            let mut turn = ctx.assistant_turn(RISK_CHECKPOINT_MESSAGE, router_model);
            turn.metadata = json!({
                "code": code,
                "language": language.as_str(),
                "checkpoint": {
                    "type": CheckpointKind::ApprovalRequired,
                    "reason": RISK_CHECKPOINT_REASON,
                    "details": risk.reasons,
                },
            });
            self.save_turn(ctx, turn).await;
            self.queue_memory_update(ctx, RISK_CHECKPOINT_MESSAGE);
            return Ok(RunStatus::AwaitingApproval);
        }

        let egress = self.gate.egress().evaluate(&code);
        if egress.enabled && egress.is_blocked() {
            info!(blocked = ?egress.blocked_hosts, "generated code violates egress allowlist");
            ctx.emit(WorkflowEvent::Checkpoint {
                kind: CheckpointKind::PolicyViolation,
                reason: EGRESS_CHECKPOINT_REASON.into(),
                details: egress.blocked_hosts.clone(),
            });
            ctx.emit(WorkflowEvent::error(format!(
                "{EGRESS_BLOCKED_MESSAGE} Blocked hosts: {}",
                egress.blocked_hosts.join(", ")
            )));

            let mut turn = ctx.assistant_turn(EGRESS_BLOCKED_MESSAGE, router_model);
            turn.metadata = json!({
                "checkpoint": {
                    "type": CheckpointKind::PolicyViolation,
                    "reason": EGRESS_CHECKPOINT_REASON,
                    "details": egress.blocked_hosts,
                },
                "egress_allowlist": egress.allowlist,
            });
            self.save_turn(ctx, turn).await;
            return Ok(RunStatus::AwaitingApproval);
        }

        // Execution
        ctx.status("executing");
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "execute_code",
                json!({"language": language.as_str()}),
            )
            .await;
        let started = Instant::now();
        let result = execute_code(sandbox, &code, language, ctx.budget.max_sandbox_ms).await;
        ctx.usage.add_sandbox_ms(result.execution_time_ms);
        let file_names: Vec<String> = result.files.iter().map(|f| f.name.clone()).collect();
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(provider.to_string()),
                input: json!({"language": language.as_str()}),
                output: json!({
                    "success": result.success,
                    "stdoutLength": result.stdout.len(),
                    "stderrLength": result.stderr.len(),
                    "files": file_names,
                }),
                duration_ms: Some(elapsed_ms(started)),
                ..NewToolCall::new(
                    ctx.run_id(),
                    "sandbox_execute",
                    ToolCallStatus::from_success(result.success),
                )
            })
            .await;
        self.ledger
            .complete_step(
                step.as_deref(),
                json!({
                    "success": result.success,
                    "executionTimeMs": result.execution_time_ms,
                    "filesCreated": result.files.len(),
                }),
            )
            .await;
        ctx.emit(WorkflowEvent::Output {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            success: result.success,
            execution_time_ms: Some(result.execution_time_ms),
        });

        let published = self.publish_files(ctx, sandbox, &result.files).await;

        // Summary
        ctx.status("summarizing");
        let step = self
            .ledger
            .start_step(ctx.run_id(), "summarize_results", json!({}))
            .await;
        let started = Instant::now();
        let summarized = summarize_results(
            self.router.as_ref(),
            &ctx.input.message,
            &result.output,
            result.error.as_deref(),
            &file_names,
        )
        .await;
        let (summary, usage) = self.or_fail_step(step.as_deref(), summarized).await?;
        let cost = ctx
            .usage
            .add_llm_call(self.router.id(), usage.input_tokens, usage.output_tokens);
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(self.router.name().to_string()),
                input: json!({
                    "outputLength": result.output.len(),
                    "hasError": result.error.is_some(),
                }),
                output: json!({"summaryLength": summary.len()}),
                duration_ms: Some(elapsed_ms(started)),
                cost_estimate_usd: cost,
                ..NewToolCall::new(ctx.run_id(), "summarize_results", ToolCallStatus::Completed)
            })
            .await;
        self.ledger
            .complete_step(step.as_deref(), json!({"summaryLength": summary.len()}))
            .await;
        ctx.emit(WorkflowEvent::text(summary.clone()));

        let mut turn = ctx.assistant_turn(&summary, router_model);
        turn.sandbox_used = true;
        turn.sandbox_duration_ms = Some(result.execution_time_ms);
        turn.metadata = json!({
            "sandbox_provider": provider,
            "code": code,
            "language": language.as_str(),
            "packages_installed": packages,
            "files_created": file_names,
            "storage_paths": published.iter().map(|f| f.storage_path.as_str()).collect::<Vec<_>>(),
            "stdout": result.stdout,
            "stderr": result.stderr,
        });
        self.save_turn(ctx, turn).await;
        self.queue_memory_update(ctx, &summary);
        self.track_usage(ctx, UsageKind::Sandbox, result.execution_time_ms, router_model)
            .await;

        // Output files are already stored, so the session can go now.
        self.sessions.destroy_sandbox(&ctx.input.user_id).await;
        Ok(RunStatus::Completed)
    }

    /// Install failures are reported but do not stop the run; the generated
    /// code may not need every package.
    async fn install(
        &self,
        ctx: &RunContext,
        sandbox: &dyn SandboxRuntime,
        provider: &str,
        packages: &[String],
        intent: &RouterResult,
    ) {
        ctx.update(StatusUpdate {
            packages: Some(packages.to_vec()),
            ..StatusUpdate::new("installing")
        });
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "install_packages",
                json!({"packages": packages}),
            )
            .await;
        let started = Instant::now();
        let result =
            install_packages(sandbox, packages, execution_language(&intent.language)).await;
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(provider.to_string()),
                input: json!({"packages": packages, "language": intent.language}),
                output: json!({"output": take_chars(&result.output, INSTALL_LOG_CHARS)}),
                duration_ms: Some(elapsed_ms(started)),
                ..NewToolCall::new(
                    ctx.run_id(),
                    "sandbox_install",
                    ToolCallStatus::from_success(result.success),
                )
            })
            .await;
        if !result.success {
            warn!(output = %result.output, "package install failed");
            ctx.emit(WorkflowEvent::error(
                Error::PackageInstall {
                    output: result.output.clone(),
                }
                .to_string(),
            ));
        }
        self.ledger
            .complete_step(step.as_deref(), json!({"success": result.success}))
            .await;
    }
}
