//! Progress events streamed to the caller while a workflow runs.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use {
    crucible_runs::RunStatus,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::mpsc,
};

/// A `status` update. Only `stage` is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl StatusUpdate {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ApprovalRequired,
    PolicyViolation,
}

/// Where a tool call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Sandbox,
    Mcp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Status(StatusUpdate),
    Text {
        chunk: String,
    },
    Code {
        code: String,
        language: String,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        stdout: String,
        stderr: String,
        success: bool,
        execution_time_ms: Option<u64>,
    },
    File {
        name: String,
        url: String,
        size: u64,
    },
    Checkpoint {
        #[serde(rename = "type")]
        kind: CheckpointKind,
        reason: String,
        details: Vec<String>,
    },
    Error {
        message: String,
    },
    Thinking {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_name: String,
        tool_input: Value,
        iteration: u32,
        source: ToolSource,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_name: String,
        success: bool,
        output: String,
        execution_time_ms: Option<u64>,
        source: ToolSource,
        files_created: Vec<String>,
    },
    /// Always the last event of a run.
    #[serde(rename_all = "camelCase")]
    Done {
        total_time_ms: u64,
        run_id: Option<String>,
        status: RunStatus,
    },
}

impl WorkflowEvent {
    pub fn status(stage: impl Into<String>) -> Self {
        Self::Status(StatusUpdate::new(stage))
    }

    pub fn text(chunk: impl Into<String>) -> Self {
        Self::Text {
            chunk: chunk.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Text { .. } => "text",
            Self::Code { .. } => "code",
            Self::Output { .. } => "output",
            Self::File { .. } => "file",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Error { .. } => "error",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
        }
    }
}

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Receives events as they happen. The workflow polls `is_aborted` between
/// agent iterations and stream chunks.
pub trait EventSink: Send + Sync {
    fn send(&self, event: WorkflowEvent);

    fn is_aborted(&self) -> bool {
        false
    }
}

/// Forwards events over an unbounded channel. Dropping the receiver counts
/// as an abort; once aborted, `send` drops events.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
    aborted: AtomicBool,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                aborted: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: WorkflowEvent) {
        if self.aborted.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.send(event).is_err() {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

/// Buffers every event. Can simulate a client that disconnects after a
/// number of events.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<WorkflowEvent>>,
    abort_after: Option<usize>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn aborting_after(count: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            abort_after: Some(count),
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for CollectingSink {
    fn send(&self, event: WorkflowEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    fn is_aborted(&self) -> bool {
        self.abort_after.is_some_and(|limit| {
            self.events.lock().unwrap_or_else(|e| e.into_inner()).len() >= limit
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn status_omits_unset_fields() {
        let event = WorkflowEvent::Status(StatusUpdate {
            iteration: Some(2),
            max_iterations: Some(16),
            ..StatusUpdate::new("agent_thinking")
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "status", "data": {"stage": "agent_thinking", "iteration": 2, "maxIterations": 16}})
        );
    }

    #[test]
    fn wire_names_are_camel_case() {
        let done = WorkflowEvent::Done {
            total_time_ms: 1200,
            run_id: Some("r1".into()),
            status: RunStatus::AwaitingApproval,
        };
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"event": "done", "data": {"totalTimeMs": 1200, "runId": "r1", "status": "awaiting_approval"}})
        );

        let checkpoint = WorkflowEvent::Checkpoint {
            kind: CheckpointKind::PolicyViolation,
            reason: "Egress allowlist violation".into(),
            details: vec!["evil.com".into()],
        };
        assert_eq!(
            serde_json::to_value(&checkpoint).unwrap()["data"]["type"],
            "policy_violation"
        );

        let result = WorkflowEvent::ToolResult {
            tool_name: "execute_code".into(),
            success: true,
            output: "ok".into(),
            execution_time_ms: Some(40),
            source: ToolSource::Sandbox,
            files_created: vec![],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["event"], "tool_result");
        assert_eq!(value["data"]["toolName"], "execute_code");
        assert_eq!(value["data"]["filesCreated"], json!([]));
    }

    #[tokio::test]
    async fn channel_sink_aborts_when_receiver_drops() {
        let (sink, mut rx) = ChannelSink::new();
        sink.send(WorkflowEvent::text("hi"));
        assert_eq!(rx.recv().await, Some(WorkflowEvent::text("hi")));
        assert!(!sink.is_aborted());

        drop(rx);
        assert!(sink.is_aborted());
        sink.send(WorkflowEvent::text("lost"));
    }

    #[tokio::test]
    async fn channel_sink_drops_events_after_abort() {
        let (sink, mut rx) = ChannelSink::new();
        sink.send(WorkflowEvent::status("routing"));
        sink.abort();
        assert!(sink.is_aborted());

        sink.send(WorkflowEvent::text("late"));
        assert_eq!(rx.recv().await, Some(WorkflowEvent::status("routing")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn collecting_sink_aborts_after_limit() {
        let sink = CollectingSink::aborting_after(2);
        sink.send(WorkflowEvent::status("routing"));
        assert!(!sink.is_aborted());
        sink.send(WorkflowEvent::status("classified"));
        assert!(sink.is_aborted());
        assert_eq!(sink.events().len(), 2);
    }
}
