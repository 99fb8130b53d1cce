//! Intent classification with the fast model.

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{
    model::{ChatMessage, CompletionRequest, LlmProvider, Usage},
    prompts::{ATTACHMENT_HINT, ROUTER_SYSTEM_PROMPT},
};

const ROUTER_MAX_TOKENS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Chat,
    CodeExec,
    FileAnalysis,
}

impl IntentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::CodeExec => "code_exec",
            Self::FileAnalysis => "file_analysis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterResult {
    pub intent: IntentType,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_packages: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "none".into()
}

impl RouterResult {
    fn fallback(has_attachment: bool) -> Self {
        Self {
            intent: if has_attachment {
                IntentType::FileAnalysis
            } else {
                IntentType::Chat
            },
            reasoning: "Failed to parse router response, defaulting".into(),
            suggested_packages: Vec::new(),
            language: default_language(),
        }
    }
}

/// Parse the router's JSON answer, taking the text between the first `{`
/// and the last `}`. Unparseable answers fall back by attachment.
#[must_use]
pub fn parse_router_response(text: &str, has_attachment: bool) -> RouterResult {
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    };
    match serde_json::from_str::<RouterResult>(json) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, response = %text, "failed to parse router response");
            RouterResult::fallback(has_attachment)
        },
    }
}

/// Classify `query`. LLM errors propagate; malformed answers do not.
pub async fn classify_intent(
    provider: &dyn LlmProvider,
    query: &str,
    has_attachment: bool,
) -> anyhow::Result<(RouterResult, Usage)> {
    let content = if has_attachment {
        format!("{ATTACHMENT_HINT}{query}")
    } else {
        query.to_string()
    };
    let request = CompletionRequest::new(vec![ChatMessage::user(content)], ROUTER_MAX_TOKENS)
        .with_system(ROUTER_SYSTEM_PROMPT);
    let response = provider.complete(&request).await?;
    let result = parse_router_response(response.text_or_empty(), has_attachment);
    debug!(intent = result.intent.as_str(), reasoning = %result.reasoning, "intent classified");
    Ok((result, response.usage))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose() {
        let text = r#"Sure! {"intent":"code_exec","reasoning":"needs data","suggestedPackages":["yfinance","matplotlib"],"language":"python"} done"#;
        let result = parse_router_response(text, false);
        assert_eq!(result.intent, IntentType::CodeExec);
        assert_eq!(result.suggested_packages, vec!["yfinance", "matplotlib"]);
        assert_eq!(result.language, "python");
    }

    #[test]
    fn missing_optional_fields_get_defaults() {
        let result = parse_router_response(r#"{"intent":"chat"}"#, false);
        assert_eq!(result.intent, IntentType::Chat);
        assert!(result.suggested_packages.is_empty());
        assert_eq!(result.language, "none");
    }

    #[test]
    fn garbage_falls_back_by_attachment() {
        let chat = parse_router_response("I think this is chat", false);
        assert_eq!(chat.intent, IntentType::Chat);
        assert_eq!(chat.reasoning, "Failed to parse router response, defaulting");
        assert_eq!(chat.language, "none");

        let file = parse_router_response(r#"{"intent":"unknown_kind"}"#, true);
        assert_eq!(file.intent, IntentType::FileAnalysis);
    }
}
