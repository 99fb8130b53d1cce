use std::time::Instant;

use {
    crucible_runs::{NewToolCall, RunStatus, ToolCallStatus, model_label},
    futures::StreamExt,
    serde_json::json,
    tracing::debug,
};

use {
    super::{RunContext, Workflow, elapsed_ms},
    crate::{
        collaborators::UsageKind,
        error::{Error, Result},
        events::WorkflowEvent,
        model::{ChatMessage, CompletionRequest, StreamEvent, Usage},
    },
};

impl Workflow {
    /// Stream a plain answer. No sandbox is involved.
    pub(super) async fn run_chat(&self, ctx: &mut RunContext) -> Result<RunStatus> {
        ctx.status("generating");
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "chat_response",
                json!({"historyMessages": ctx.history.len()}),
            )
            .await;
        let started = Instant::now();
        let max_tokens = ctx.max_output_tokens();

        let mut messages = ctx.history.clone();
        messages.push(ChatMessage::user(ctx.input.message.clone()));
        let mut stream = self
            .router
            .stream(CompletionRequest::new(messages, max_tokens));

        let mut content = String::new();
        let mut usage = Usage::default();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(chunk) => {
                    content.push_str(&chunk);
                    ctx.emit(WorkflowEvent::text(chunk));
                },
                StreamEvent::Done(final_usage) => {
                    usage = final_usage;
                    break;
                },
                StreamEvent::Error(message) => {
                    self.ledger.fail_step(step.as_deref(), &message).await;
                    return Err(Error::message(message));
                },
            }
            if ctx.events.is_aborted() {
                debug!("client went away mid-stream");
                break;
            }
        }
        drop(stream);

        let cost = ctx
            .usage
            .add_llm_call(self.router.id(), usage.input_tokens, usage.output_tokens);
        self.ledger
            .record_tool_call(NewToolCall {
                run_step_id: step.clone(),
                provider: Some(self.router.name().to_string()),
                input: json!({"maxTokens": max_tokens}),
                output: json!({
                    "tokensIn": usage.input_tokens,
                    "tokensOut": usage.output_tokens,
                    "contentLength": content.len(),
                }),
                duration_ms: Some(elapsed_ms(started)),
                cost_estimate_usd: cost,
                ..NewToolCall::new(ctx.run_id(), "chat_stream", ToolCallStatus::Completed)
            })
            .await;
        self.ledger
            .complete_step(
                step.as_deref(),
                json!({"tokensIn": usage.input_tokens, "tokensOut": usage.output_tokens}),
            )
            .await;

        let model = model_label(self.router.id());
        let mut turn = ctx.assistant_turn(&content, model);
        turn.tokens_in = usage.input_tokens;
        turn.tokens_out = usage.output_tokens;
        self.save_turn(ctx, turn).await;
        self.queue_memory_update(ctx, &content);
        self.track_usage(ctx, UsageKind::Chat, 0, model).await;
        Ok(RunStatus::Completed)
    }
}
