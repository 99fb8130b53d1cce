//! Let the orchestrator model drive sandbox and MCP tools until it is done.

use std::time::Instant;

use {
    crucible_common::text::take_chars,
    crucible_runs::{NewToolCall, RunStatus, ToolCallStatus, model_label},
    crucible_sandbox::OutputFile,
    serde_json::json,
    tracing::{debug, info},
};

use {
    super::{RunContext, Workflow, elapsed_ms, publish::dedupe_by_name},
    crate::{
        collaborators::UsageKind,
        error::Result,
        events::{CheckpointKind, StatusUpdate, ToolSource, WorkflowEvent},
        model::{ChatMessage, CompletionRequest, StopReason},
        prompts::{AGENT_SYSTEM_PROMPT, orchestrator_messages},
        router::RouterResult,
        tools::{EXECUTE_CODE, ToolExecutor, all_tools},
    },
};

pub const AGENT_BUDGET_EXCEEDED_MESSAGE: &str =
    "Budget exceeded during agent execution. Results shown are from completed iterations.";

/// Tool output shown to the caller.
const TOOL_RESULT_EVENT_CHARS: usize = 2_000;
/// Tool output fed back to the model.
const TOOL_RESULT_MODEL_CHARS: usize = 8_000;

impl Workflow {
    pub(super) async fn run_agent_loop(
        &self,
        ctx: &mut RunContext,
        intent: &RouterResult,
    ) -> Result<RunStatus> {
        self.require_sandbox_access(ctx).await?;
        let session = self.start_sandbox(ctx).await?;
        let sandbox = session.sandbox.as_ref();
        let provider = session.provider.as_str();
        self.upload_files(ctx, sandbox).await?;

        let mut messages = orchestrator_messages(
            &ctx.history,
            &ctx.input.message,
            ctx.input.has_attachment(),
        );

        let mcp = self.mcp.as_deref().filter(|m| m.is_enabled());
        if let Some(mcp) = mcp {
            ctx.status("discovering_tools");
            mcp.discover_for_query(&ctx.input.message).await;
        }
        let tools = all_tools(mcp).await;
        let executor = ToolExecutor {
            sandbox,
            gate: &self.gate,
            mcp,
            timeout_ms: ctx.budget.max_sandbox_ms,
            allow_dangerous: ctx.input.allow_dangerous,
        };

        let max_iterations = ctx.budget.max_agent_iterations;
        let orchestrator_model = model_label(self.orchestrator.id());
        let mut files: Vec<OutputFile> = Vec::new();
        let mut code_generated: Vec<String> = Vec::new();
        let mut final_text = String::new();
        let mut sandbox_ms = 0u64;
        let mut iterations = 0u32;

        for iteration in 1..=max_iterations {
            if ctx.events.is_aborted() {
                info!(iteration, "client went away, stopping agent loop");
                break;
            }
            if ctx.budget.is_exceeded(&ctx.usage) {
                ctx.emit(WorkflowEvent::error(AGENT_BUDGET_EXCEEDED_MESSAGE));
                break;
            }
            iterations = iteration;
            ctx.update(StatusUpdate {
                iteration: Some(iteration),
                max_iterations: Some(max_iterations),
                ..StatusUpdate::new("agent_thinking")
            });

            let step = self
                .ledger
                .start_step(
                    ctx.run_id(),
                    &format!("agent_iteration_{iteration}"),
                    json!({"iteration": iteration}),
                )
                .await;
            let started = Instant::now();
            let request = CompletionRequest::new(messages.clone(), ctx.max_output_tokens())
                .with_system(AGENT_SYSTEM_PROMPT)
                .with_tools(tools.clone());
            let completed = self.orchestrator.complete(&request).await;
            let response = self.or_fail_step(step.as_deref(), completed).await?;

            let usage = response.usage;
            let cost = ctx.usage.add_llm_call(
                self.orchestrator.id(),
                usage.input_tokens,
                usage.output_tokens,
            );
            self.ledger
                .record_tool_call(NewToolCall {
                    run_step_id: step.clone(),
                    provider: Some(self.orchestrator.name().to_string()),
                    input: json!({"iteration": iteration, "model": self.orchestrator.id()}),
                    output: json!({
                        "tokensIn": usage.input_tokens,
                        "tokensOut": usage.output_tokens,
                        "stopReason": response.stop_reason.as_str(),
                        "toolCalls": response.tool_calls.len(),
                    }),
                    duration_ms: Some(elapsed_ms(started)),
                    cost_estimate_usd: cost,
                    ..NewToolCall::new(ctx.run_id(), "orchestrator_llm", ToolCallStatus::Completed)
                })
                .await;

            if let Some(text) = response.text.as_deref() {
                if response.stop_reason == StopReason::ToolUse {
                    if !text.trim().is_empty() {
                        ctx.emit(WorkflowEvent::Thinking {
                            text: text.to_string(),
                        });
                    }
                } else {
                    final_text.push_str(text);
                    ctx.emit(WorkflowEvent::text(text));
                }
            }

            let mut tool_messages = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let is_mcp = match mcp {
                    Some(mcp) => mcp.is_mcp_tool(&call.name).await,
                    None => false,
                };
                let source = if is_mcp {
                    ToolSource::Mcp
                } else {
                    ToolSource::Sandbox
                };
                ctx.emit(WorkflowEvent::ToolCall {
                    tool_name: call.name.clone(),
                    tool_input: call.arguments.clone(),
                    iteration,
                    source,
                });
                if call.name == EXECUTE_CODE {
                    let code = call.arguments["code"].as_str().unwrap_or_default();
                    let language = call.arguments["language"].as_str().unwrap_or("python");
                    ctx.emit(WorkflowEvent::Code {
                        code: code.to_string(),
                        language: language.to_string(),
                    });
                    code_generated.push(code.to_string());
                }

                ctx.status("executing");
                let tool_started = Instant::now();
                let result = executor.execute(&call.name, &call.arguments).await;

                if result.blocked {
                    ctx.emit(WorkflowEvent::Checkpoint {
                        kind: CheckpointKind::ApprovalRequired,
                        reason: result.block_reason.clone().unwrap_or_default(),
                        details: result
                            .risk_check
                            .as_ref()
                            .map(|r| r.reasons.clone())
                            .unwrap_or_default(),
                    });
                }
                if let Some(ms) = result.execution_time_ms {
                    sandbox_ms += ms;
                    ctx.usage.add_sandbox_ms(ms);
                }
                let created: Vec<String> = result.files.iter().map(|f| f.name.clone()).collect();
                files.extend(result.files.iter().cloned());

                ctx.emit(WorkflowEvent::ToolResult {
                    tool_name: call.name.clone(),
                    success: result.success,
                    output: take_chars(&result.output, TOOL_RESULT_EVENT_CHARS).to_string(),
                    execution_time_ms: result.execution_time_ms,
                    source,
                    files_created: created.clone(),
                });
                if call.name == EXECUTE_CODE {
                    let (stdout, stderr) = if result.success {
                        (result.output.clone(), String::new())
                    } else {
                        (String::new(), result.output.clone())
                    };
                    ctx.emit(WorkflowEvent::Output {
                        stdout,
                        stderr,
                        success: result.success,
                        execution_time_ms: result.execution_time_ms,
                    });
                }

                self.ledger
                    .record_tool_call(NewToolCall {
                        run_step_id: step.clone(),
                        provider: Some(if is_mcp { "mcp" } else { provider }.to_string()),
                        input: call.arguments.clone(),
                        output: json!({
                            "success": result.success,
                            "outputLength": result.output.len(),
                            "files": created,
                        }),
                        duration_ms: Some(elapsed_ms(tool_started)),
                        ..NewToolCall::new(
                            ctx.run_id(),
                            format!("tool:{}", call.name),
                            ToolCallStatus::from_success(result.success),
                        )
                    })
                    .await;

                tool_messages.push(ChatMessage::tool(
                    call.id.clone(),
                    take_chars(&result.output, TOOL_RESULT_MODEL_CHARS),
                    !result.success,
                ));
            }

            self.ledger
                .complete_step(
                    step.as_deref(),
                    json!({
                        "iteration": iteration,
                        "stopReason": response.stop_reason.as_str(),
                        "toolCallCount": tool_messages.len(),
                        "tokensIn": usage.input_tokens,
                        "tokensOut": usage.output_tokens,
                    }),
                )
                .await;

            if response.stop_reason == StopReason::EndTurn || tool_messages.is_empty() {
                debug!(iteration, stop_reason = response.stop_reason.as_str(), "agent finished");
                break;
            }
            messages.push(ChatMessage::assistant_with_tools(
                response.text.clone(),
                response.tool_calls.clone(),
            ));
            messages.extend(tool_messages);
        }

        let unique = dedupe_by_name(files);
        self.publish_files(ctx, sandbox, &unique).await;

        let mut turn = ctx.assistant_turn(&final_text, orchestrator_model);
        turn.sandbox_used = true;
        turn.sandbox_duration_ms = Some(sandbox_ms);
        turn.metadata = json!({
            "sandbox_provider": provider,
            "code": code_generated.join("\n---\n"),
            "language": intent.language,
            "files_created": unique.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "agent_iterations": iterations,
        });
        self.save_turn(ctx, turn).await;
        self.queue_memory_update(ctx, &final_text);
        self.track_usage(ctx, UsageKind::Sandbox, sandbox_ms, orchestrator_model)
            .await;

        // The session stays up for follow-up requests; the sweeper reaps it.
        Ok(RunStatus::Completed)
    }
}
