//! Code generation and result summaries for the linear execution path.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    model::{ChatMessage, CompletionRequest, LlmProvider, Usage},
    prompts::{CODE_GEN_SYSTEM_PROMPT, SUMMARIZE_SYSTEM_PROMPT, code_gen_message, summarize_message},
};

const CODE_GEN_MAX_TOKENS: u32 = 2_000;
const SUMMARY_MAX_TOKENS: u32 = 500;
/// History turns carried into code generation.
const CODE_GEN_HISTORY: usize = 6;

pub const DEFAULT_SUMMARY: &str = "Execution completed.";

static PYTHON_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"```python\n([\s\S]*?)```").ok());
static FENCE_OPEN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"```\w*\n?").ok());

/// Pull the code out of a model answer: the first python block, otherwise
/// the whole answer with fences stripped.
#[must_use]
pub fn extract_code(text: &str) -> String {
    if let Some(re) = PYTHON_BLOCK.as_ref()
        && let Some(caps) = re.captures(text)
        && let Some(code) = caps.get(1)
    {
        return code.as_str().trim().to_string();
    }
    let stripped = match FENCE_OPEN.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    stripped.replace("```", "").trim().to_string()
}

pub async fn generate_code(
    provider: &dyn LlmProvider,
    query: &str,
    packages: &[String],
    history: &[ChatMessage],
) -> anyhow::Result<(String, Usage)> {
    let recent = &history[history.len().saturating_sub(CODE_GEN_HISTORY)..];
    let mut messages = recent.to_vec();
    messages.push(ChatMessage::user(code_gen_message(query, packages)));

    let request =
        CompletionRequest::new(messages, CODE_GEN_MAX_TOKENS).with_system(CODE_GEN_SYSTEM_PROMPT);
    let response = provider.complete(&request).await?;
    Ok((extract_code(response.text_or_empty()), response.usage))
}

/// What the summarizer is told about an execution.
#[must_use]
pub fn result_context(output: &str, error: Option<&str>, files: &[String]) -> String {
    match error {
        Some(error) => format!(
            "The code execution failed with error:\n{error}\n\nStdout before error:\n{output}"
        ),
        None if files.is_empty() => format!("The code executed successfully.\n\nOutput:\n{output}"),
        None => format!(
            "The code executed successfully.\n\nOutput:\n{output}\n\nFiles created: {}",
            files.join(", ")
        ),
    }
}

pub async fn summarize_results(
    provider: &dyn LlmProvider,
    query: &str,
    output: &str,
    error: Option<&str>,
    files: &[String],
) -> anyhow::Result<(String, Usage)> {
    let context = result_context(output, error, files);
    let request = CompletionRequest::new(
        vec![ChatMessage::user(summarize_message(query, &context))],
        SUMMARY_MAX_TOKENS,
    )
    .with_system(SUMMARIZE_SYSTEM_PROMPT);
    let response = provider.complete(&request).await?;
    let summary = response
        .text
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
    Ok((summary, response.usage))
}
