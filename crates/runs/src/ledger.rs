//! Fire-and-forget audit trail over a [`RunStore`].
//!
//! Every write logs and swallows its error so recording never aborts the
//! workflow it observes. Operations given no run or step id are no-ops.

use std::sync::Arc;

use {
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    Result,
    manifest::{MANIFEST_ARTIFACT_NAME, SignedManifest},
    store::RunStore,
    types::{ArtifactType, NewArtifact, NewRun, NewToolCall, RunCompletion, RunExport, StepStatus},
};

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn RunStore>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Returns `None` when the run could not be recorded.
    pub async fn create_run(&self, run: NewRun) -> Option<String> {
        let user_id = run.user_id.clone();
        match self.store.insert_run(run).await {
            Ok(id) => {
                debug!(run_id = %id, %user_id, "run created");
                Some(id)
            },
            Err(e) => {
                warn!(error = %e, %user_id, "failed to create run ledger entry");
                None
            },
        }
    }

    pub async fn start_step(
        &self,
        run_id: Option<&str>,
        step_key: &str,
        input: Value,
    ) -> Option<String> {
        let run_id = run_id?;
        match self.store.insert_step(run_id, step_key, input).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, run_id, step_key, "failed to create run step");
                None
            },
        }
    }

    pub async fn complete_step(&self, step_id: Option<&str>, output: Value) {
        let Some(step_id) = step_id else {
            return;
        };
        if let Err(e) = self
            .store
            .finish_step(step_id, StepStatus::Completed, output, None)
            .await
        {
            warn!(error = %e, step_id, "failed to complete run step");
        }
    }

    pub async fn fail_step(&self, step_id: Option<&str>, message: &str) {
        let Some(step_id) = step_id else {
            return;
        };
        if let Err(e) = self
            .store
            .finish_step(
                step_id,
                StepStatus::Failed,
                Value::Object(Default::default()),
                Some(message.to_string()),
            )
            .await
        {
            warn!(error = %e, step_id, "failed to fail run step");
        }
    }

    pub async fn record_tool_call(&self, call: NewToolCall) {
        let Some(run_id) = call.run_id.clone() else {
            return;
        };
        let tool_name = call.tool_name.clone();
        if let Err(e) = self.store.insert_tool_call(&run_id, call).await {
            warn!(error = %e, %run_id, %tool_name, "failed to record tool call");
        }
    }

    pub async fn record_artifact(&self, artifact: NewArtifact) {
        let Some(run_id) = artifact.run_id.clone() else {
            return;
        };
        let name = artifact.name.clone();
        if let Err(e) = self.store.insert_artifact(&run_id, artifact).await {
            warn!(error = %e, %run_id, %name, "failed to record artifact");
        }
    }

    /// Record a signed manifest as the run's `log` artifact.
    pub async fn record_manifest(
        &self,
        run_id: Option<&str>,
        step_id: Option<&str>,
        signed: &SignedManifest,
    ) {
        let metadata = match serde_json::to_value(signed) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to encode run manifest");
                return;
            },
        };
        let size_bytes = metadata.to_string().len() as u64;
        self.record_artifact(NewArtifact {
            run_step_id: step_id.map(str::to_string),
            mime_type: Some("application/json".into()),
            size_bytes,
            metadata,
            ..NewArtifact::new(run_id, ArtifactType::Log, MANIFEST_ARTIFACT_NAME)
        })
        .await;
    }

    pub async fn complete_run(&self, run_id: Option<&str>, completion: RunCompletion) {
        let Some(run_id) = run_id else {
            return;
        };
        let status = completion.status;
        if let Err(e) = self.store.complete_run(run_id, completion).await {
            warn!(error = %e, run_id, %status, "failed to complete run");
        }
    }

    /// Full record of one run. Unlike the writes, read errors propagate.
    pub async fn export_run(&self, run_id: &str) -> Result<RunExport> {
        self.store.export_run(run_id).await
    }
}
