//! Anthropic Messages API.

use {
    async_trait::async_trait,
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tracing::{debug, trace, warn},
};

use crate::model::{
    ChatMessage, CompletionRequest, CompletionResponse, EventStream, LlmProvider, StopReason,
    StreamEvent, ToolCall, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: Secret<String>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Secret<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": to_anthropic_messages(&request.messages),
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

/// Parse tool_use blocks from a response's content array.
fn parse_tool_calls(content: &[Value]) -> Vec<ToolCall> {
    content
        .iter()
        .filter(|block| block["type"].as_str() == Some("tool_use"))
        .map(|block| ToolCall {
            id: block["id"].as_str().unwrap_or("").to_string(),
            name: block["name"].as_str().unwrap_or("").to_string(),
            arguments: block["input"].clone(),
        })
        .collect()
}

/// Convert messages to the Messages API shape.
///
/// Consecutive tool results are merged into a single user turn, one
/// `tool_result` block each, since the API expects all results of an
/// assistant turn together.
fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if let ChatMessage::Tool {
            tool_call_id,
            content,
            is_error,
        } = msg
        {
            let mut block = serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
            });
            if *is_error {
                block["is_error"] = Value::Bool(true);
            }
            pending_results.push(block);
            continue;
        }
        if !pending_results.is_empty() {
            out.push(serde_json::json!({
                "role": "user",
                "content": std::mem::take(&mut pending_results),
            }));
        }
        match msg {
            ChatMessage::User { content } => {
                out.push(serde_json::json!({"role": "user", "content": content}));
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    out.push(serde_json::json!({
                        "role": "assistant",
                        "content": content.as_deref().unwrap_or(""),
                    }));
                } else {
                    let mut blocks = Vec::new();
                    if let Some(text) = content
                        && !text.is_empty()
                    {
                        blocks.push(serde_json::json!({"type": "text", "text": text}));
                    }
                    for tc in tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    out.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
            },
            ChatMessage::Tool { .. } => {},
        }
    }
    if !pending_results.is_empty() {
        out.push(serde_json::json!({"role": "user", "content": pending_results}));
    }
    out
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let body = self.request_body(request, false);
        debug!(
            model = %self.model,
            messages_count = request.messages.len(),
            tools_count = request.tools.len(),
            has_system = request.system.is_some(),
            "anthropic complete request"
        );
        trace!(body = %body, "anthropic request body");

        let http_resp = self.post(&body).send().await?;
        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body_text, "anthropic API error");
            anyhow::bail!("Anthropic API error HTTP {status}: {body_text}");
        }

        let resp = http_resp.json::<Value>().await?;
        trace!(response = %resp, "anthropic raw response");

        let content = resp["content"].as_array().cloned().unwrap_or_default();
        let text = content
            .iter()
            .filter(|b| b["type"].as_str() == Some("text"))
            .filter_map(|b| b["text"].as_str().map(str::to_string))
            .reduce(|a, b| a + &b);

        Ok(CompletionResponse {
            text,
            tool_calls: parse_tool_calls(&content),
            usage: Usage {
                input_tokens: resp["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: resp["usage"]["output_tokens"].as_u64().unwrap_or(0),
            },
            stop_reason: StopReason::parse(resp["stop_reason"].as_str().unwrap_or("end_turn")),
        })
    }

    fn stream(&self, request: CompletionRequest) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            let body = self.request_body(&request, true);
            debug!(
                model = %self.model,
                messages_count = request.messages.len(),
                has_system = request.system.is_some(),
                "anthropic stream request"
            );

            let resp = match self.post(&body).send().await {
                Ok(r) => {
                    if let Err(e) = r.error_for_status_ref() {
                        let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                        let body_text = r.text().await.unwrap_or_default();
                        yield StreamEvent::Error(format!("HTTP {status}: {body_text}"));
                        return;
                    }
                    r
                },
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
            };

            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut usage = Usage::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    },
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let block = buf[..pos].to_string();
                    buf = buf[pos + 2..].to_string();
                    for line in block.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(evt) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };
                        match apply_sse_event(&evt, &mut usage) {
                            SseStep::Continue => {},
                            SseStep::Emit(event) => yield event,
                            SseStep::Finish(event) => {
                                yield event;
                                return;
                            },
                        }
                    }
                }
            }
            yield StreamEvent::Done(usage);
        })
    }
}

enum SseStep {
    Continue,
    Emit(StreamEvent),
    Finish(StreamEvent),
}

/// Fold one decoded SSE event into the running usage.
fn apply_sse_event(evt: &Value, usage: &mut Usage) -> SseStep {
    match evt["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(v) = evt["message"]["usage"]["input_tokens"].as_u64() {
                usage.input_tokens = v;
            }
            SseStep::Continue
        },
        "content_block_delta" => {
            let delta = &evt["delta"];
            match delta["text"].as_str() {
                Some(text) if delta["type"].as_str() == Some("text_delta") && !text.is_empty() => {
                    SseStep::Emit(StreamEvent::Delta(text.to_string()))
                },
                _ => SseStep::Continue,
            }
        },
        "message_delta" => {
            if let Some(v) = evt["usage"]["output_tokens"].as_u64() {
                usage.output_tokens = v;
            }
            SseStep::Continue
        },
        "message_stop" => SseStep::Finish(StreamEvent::Done(*usage)),
        "error" => {
            let msg = evt["error"]["message"].as_str().unwrap_or("unknown error");
            SseStep::Finish(StreamEvent::Error(msg.to_string()))
        },
        _ => SseStep::Continue,
    }
}
