//! Ledger records: runs, steps, tool calls and artifacts.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::budget::{RunBudget, RunUsage};

/// Lifecycle of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }

    /// Only `running` may move, and only to a terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self == Self::Running && next.is_terminal()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Completed,
    Failed,
}

impl ToolCallStatus {
    #[must_use]
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Completed
        } else {
            Self::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    File,
    Text,
    Code,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub status: RunStatus,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_type: Option<String>,
    pub budget_limits: RunBudget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_consumed: Option<RunUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub step_key: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_step_id: Option<String>,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: ToolCallStatus,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub cost_estimate_usd: f64,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_step_id: Option<String>,
    pub artifact_type: ArtifactType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub metadata: Value,
    pub created_at_ms: u64,
}

// ── Write inputs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewRun {
    pub user_id: String,
    pub conversation_id: String,
    pub model_used: String,
    pub budget: RunBudget,
}

/// Terminal update for a run.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub intent_type: Option<String>,
    pub usage: RunUsage,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewToolCall {
    /// Absent when the run itself could not be recorded.
    pub run_id: Option<String>,
    pub run_step_id: Option<String>,
    pub tool_name: String,
    pub provider: Option<String>,
    pub status: ToolCallStatus,
    pub input: Value,
    pub output: Value,
    pub duration_ms: Option<u64>,
    pub cost_estimate_usd: f64,
}

impl NewToolCall {
    #[must_use]
    pub fn new(run_id: Option<&str>, tool_name: impl Into<String>, status: ToolCallStatus) -> Self {
        Self {
            run_id: run_id.map(str::to_string),
            run_step_id: None,
            tool_name: tool_name.into(),
            provider: None,
            status,
            input: Value::Object(Default::default()),
            output: Value::Object(Default::default()),
            duration_ms: None,
            cost_estimate_usd: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: Option<String>,
    pub run_step_id: Option<String>,
    pub artifact_type: ArtifactType,
    pub name: String,
    pub storage_path: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub metadata: Value,
}

impl NewArtifact {
    #[must_use]
    pub fn new(run_id: Option<&str>, artifact_type: ArtifactType, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.map(str::to_string),
            run_step_id: None,
            artifact_type,
            name: name.into(),
            storage_path: None,
            mime_type: None,
            size_bytes: 0,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// A run with everything recorded against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunExport {
    pub run: Run,
    pub steps: Vec<RunStep>,
    pub tool_calls: Vec<ToolCall>,
    pub artifacts: Vec<Artifact>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn only_running_can_transition() {
        use RunStatus::*;
        for next in [Completed, Failed, AwaitingApproval] {
            assert!(Running.can_transition_to(next));
            for terminal in [Completed, Failed, AwaitingApproval] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
        assert_eq!(
            serde_json::to_string(&ArtifactType::Log).unwrap(),
            "\"log\""
        );
    }
}
