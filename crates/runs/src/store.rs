//! Persistence port for the run ledger.

use {async_trait::async_trait, serde_json::Value};

use crate::{
    Result,
    types::{NewArtifact, NewRun, NewToolCall, RunCompletion, RunExport, StepStatus},
};

/// Backend the ledger writes to. Implementations validate run status
/// transitions and reject writes against unknown runs or steps.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a `running` run and return its id.
    async fn insert_run(&self, run: NewRun) -> Result<String>;
    /// Insert a `running` step and return its id.
    async fn insert_step(&self, run_id: &str, step_key: &str, input: Value) -> Result<String>;
    async fn finish_step(
        &self,
        step_id: &str,
        status: StepStatus,
        output: Value,
        error_message: Option<String>,
    ) -> Result<()>;
    async fn insert_tool_call(&self, run_id: &str, call: NewToolCall) -> Result<()>;
    async fn insert_artifact(&self, run_id: &str, artifact: NewArtifact) -> Result<()>;
    async fn complete_run(&self, run_id: &str, completion: RunCompletion) -> Result<()>;
    async fn export_run(&self, run_id: &str) -> Result<RunExport>;
}
