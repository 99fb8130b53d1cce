//! Ports for the services a workflow run talks to: conversation history,
//! long-term memory, blob storage, usage metering, plan entitlements and
//! user profiles.
//!
//! Implementations are thin adapters over whatever backs them, so every
//! method returns [`anyhow::Result`]. The workflow decides which failures are
//! fatal.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    crucible_runs::BudgetOverrides,
    crucible_sandbox::ProviderPreference,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::model::ChatMessage;

// ── Conversation history ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

impl HistoryTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn to_chat(&self) -> ChatMessage {
        match self.role {
            TurnRole::User => ChatMessage::user(self.content.clone()),
            TurnRole::Assistant => ChatMessage::assistant(self.content.clone()),
        }
    }
}

/// An assistant reply plus what it took to produce it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantTurn {
    pub conversation_id: String,
    pub content: String,
    pub intent: String,
    pub model_used: String,
    pub sandbox_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_duration_ms: Option<u64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Code, provider, files and checkpoint details, depending on the path.
    pub metadata: Value,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Most recent turns, oldest first.
    async fn recent_history(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryTurn>>;

    async fn save_assistant_turn(&self, user_id: &str, turn: AssistantTurn) -> anyhow::Result<()>;
}

// ── Memory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub summary: Option<String>,
    pub facts: Vec<String>,
}

impl MemoryContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.as_deref().is_none_or(str::is_empty) && self.facts.is_empty()
    }

    /// Assistant message placed ahead of the recent history, or `None` when
    /// there is nothing to say.
    #[must_use]
    pub fn to_message(&self) -> Option<ChatMessage> {
        if self.is_empty() {
            return None;
        }
        let mut lines = vec!["Memory context (use only when relevant):".to_string()];
        if let Some(summary) = self.summary.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Conversation summary: {summary}"));
        }
        if !self.facts.is_empty() {
            lines.push("Durable facts:".to_string());
            lines.extend(self.facts.iter().map(|fact| format!("- {fact}")));
        }
        Some(ChatMessage::assistant(lines.join("\n")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTurn {
    pub user_id: String,
    pub conversation_id: String,
    pub user_message: String,
    pub assistant_message: String,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn context(
        &self,
        user_id: &str,
        conversation_id: &str,
        query: &str,
    ) -> anyhow::Result<MemoryContext>;

    /// Fold a finished exchange into long-term memory.
    async fn remember_turn(&self, turn: MemoryTurn) -> anyhow::Result<()>;
}

// ── Blob storage ────────────────────────────────────────────────────────────

/// A file the user uploaded before sending the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub filename: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `content` at `path`, replacing anything already there.
    async fn upload(&self, path: &str, content: Vec<u8>, content_type: &str)
    -> anyhow::Result<()>;

    async fn signed_url(&self, path: &str, ttl: Duration) -> anyhow::Result<String>;

    fn public_url(&self, path: &str) -> String;

    /// `None` when the upload does not exist or belongs to someone else.
    async fn fetch_upload(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> anyhow::Result<Option<UploadedFile>>;
}

// ── Usage, entitlements, profiles ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Chat,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub user_id: String,
    pub kind: UsageKind,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub sandbox_duration_ms: u64,
    pub model: String,
}

#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn sandbox_allowed(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// Per-user execution preferences stored on the profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionSettings {
    pub preferred_provider: ProviderPreference,
    pub strict_no_fallback: bool,
    pub budget: Option<BudgetOverrides>,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn execution_settings(&self, user_id: &str) -> anyhow::Result<ExecutionSettings>;
}

/// Every port a workflow needs, bundled.
#[derive(Clone)]
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub usage: Arc<dyn UsageTracker>,
    pub entitlements: Arc<dyn EntitlementChecker>,
    pub profiles: Arc<dyn ProfileStore>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_memory_has_no_message() {
        assert!(MemoryContext::default().to_message().is_none());
        let blank = MemoryContext {
            summary: Some(String::new()),
            facts: vec![],
        };
        assert!(blank.to_message().is_none());
    }

    #[test]
    fn memory_message_lists_summary_then_facts() {
        let context = MemoryContext {
            summary: Some("Discussed AAPL charts".into()),
            facts: vec!["Prefers dark themes".into(), "Works in EUR".into()],
        };
        assert_eq!(
            context.to_message(),
            Some(ChatMessage::assistant(
                "Memory context (use only when relevant):\n\
                 Conversation summary: Discussed AAPL charts\n\
                 Durable facts:\n\
                 - Prefers dark themes\n\
                 - Works in EUR"
            ))
        );
    }

    #[test]
    fn facts_without_summary() {
        let context = MemoryContext {
            summary: None,
            facts: vec!["Uses pandas".into()],
        };
        assert_eq!(
            context.to_message(),
            Some(ChatMessage::assistant(
                "Memory context (use only when relevant):\nDurable facts:\n- Uses pandas"
            ))
        );
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: ExecutionSettings =
            serde_json::from_str(r#"{"strictNoFallback":true}"#).unwrap();
        assert!(settings.strict_no_fallback);
        assert_eq!(settings.preferred_provider, ProviderPreference::Auto);
        assert!(settings.budget.is_none());
    }
}
