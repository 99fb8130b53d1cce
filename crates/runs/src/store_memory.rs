//! In-memory run store.

use std::{collections::HashMap, sync::Mutex};

use {async_trait::async_trait, crucible_common::time::now_ms, serde_json::Value};

use crate::{
    Error, Result,
    store::RunStore,
    types::{
        Artifact, NewArtifact, NewRun, NewToolCall, Run, RunCompletion, RunExport, RunStatus,
        RunStep, StepStatus, ToolCall,
    },
};

#[derive(Default)]
struct Tables {
    runs: HashMap<String, Run>,
    steps: Vec<RunStep>,
    tool_calls: Vec<ToolCall>,
    artifacts: Vec<Artifact>,
}

/// Store backed by in-process tables. Nothing is persisted.
#[derive(Default)]
pub struct InMemoryRunStore {
    tables: Mutex<Tables>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every recorded run.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.runs.keys().cloned().collect()
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: NewRun) -> Result<String> {
        let id = new_id();
        let now = now_ms();
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.runs.insert(id.clone(), Run {
            id: id.clone(),
            user_id: run.user_id,
            conversation_id: run.conversation_id,
            status: RunStatus::Running,
            model_used: run.model_used,
            intent_type: None,
            budget_limits: run.budget,
            budget_consumed: None,
            error_message: None,
            created_at_ms: now,
            updated_at_ms: now,
            completed_at_ms: None,
        });
        Ok(id)
    }

    async fn insert_step(&self, run_id: &str, step_key: &str, input: Value) -> Result<String> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if !tables.runs.contains_key(run_id) {
            return Err(Error::run_not_found(run_id));
        }
        let id = new_id();
        tables.steps.push(RunStep {
            id: id.clone(),
            run_id: run_id.to_string(),
            step_key: step_key.to_string(),
            status: StepStatus::Running,
            input,
            output: Value::Object(Default::default()),
            error_message: None,
            started_at_ms: now_ms(),
            completed_at_ms: None,
        });
        Ok(id)
    }

    async fn finish_step(
        &self,
        step_id: &str,
        status: StepStatus,
        output: Value,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let step = tables
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| Error::step_not_found(step_id))?;
        step.status = status;
        step.output = output;
        step.error_message = error_message;
        step.completed_at_ms = Some(now_ms());
        Ok(())
    }

    async fn insert_tool_call(&self, run_id: &str, call: NewToolCall) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if !tables.runs.contains_key(run_id) {
            return Err(Error::run_not_found(run_id));
        }
        tables.tool_calls.push(ToolCall {
            id: new_id(),
            run_id: run_id.to_string(),
            run_step_id: call.run_step_id,
            tool_name: call.tool_name,
            provider: call.provider,
            status: call.status,
            input: call.input,
            output: call.output,
            duration_ms: call.duration_ms,
            cost_estimate_usd: call.cost_estimate_usd,
            created_at_ms: now_ms(),
        });
        Ok(())
    }

    async fn insert_artifact(&self, run_id: &str, artifact: NewArtifact) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if !tables.runs.contains_key(run_id) {
            return Err(Error::run_not_found(run_id));
        }
        tables.artifacts.push(Artifact {
            id: new_id(),
            run_id: run_id.to_string(),
            run_step_id: artifact.run_step_id,
            artifact_type: artifact.artifact_type,
            name: artifact.name,
            storage_path: artifact.storage_path,
            mime_type: artifact.mime_type,
            size_bytes: artifact.size_bytes,
            metadata: artifact.metadata,
            created_at_ms: now_ms(),
        });
        Ok(())
    }

    async fn complete_run(&self, run_id: &str, completion: RunCompletion) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let run = tables
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::run_not_found(run_id))?;
        if !run.status.can_transition_to(completion.status) {
            return Err(Error::InvalidTransition {
                from: run.status,
                to: completion.status,
            });
        }
        let now = now_ms();
        run.status = completion.status;
        run.intent_type = completion.intent_type;
        run.budget_consumed = Some(completion.usage);
        run.error_message = completion.error_message;
        run.updated_at_ms = now;
        run.completed_at_ms = Some(now);
        Ok(())
    }

    async fn export_run(&self, run_id: &str) -> Result<RunExport> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let run = tables
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::run_not_found(run_id))?;
        Ok(RunExport {
            run,
            steps: tables
                .steps
                .iter()
                .filter(|s| s.run_id == run_id)
                .cloned()
                .collect(),
            tool_calls: tables
                .tool_calls
                .iter()
                .filter(|c| c.run_id == run_id)
                .cloned()
                .collect(),
            artifacts: tables
                .artifacts
                .iter()
                .filter(|a| a.run_id == run_id)
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            budget::{RunBudget, RunUsage},
            types::{ArtifactType, ToolCallStatus},
        },
        serde_json::json,
    };

    fn new_run() -> NewRun {
        NewRun {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            model_used: "haiku-4.5".into(),
            budget: RunBudget::default(),
        }
    }

    fn completion(status: RunStatus) -> RunCompletion {
        RunCompletion {
            status,
            intent_type: Some("code_exec".into()),
            usage: RunUsage::default(),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn records_and_exports_a_run() {
        let store = InMemoryRunStore::new();
        let run_id = store.insert_run(new_run()).await.unwrap();
        let step = store
            .insert_step(&run_id, "route_intent", json!({"message": "hi"}))
            .await
            .unwrap();
        store
            .insert_tool_call(
                &run_id,
                NewToolCall {
                    run_step_id: Some(step.clone()),
                    ..NewToolCall::new(Some(&run_id), "intent_router", ToolCallStatus::Completed)
                },
            )
            .await
            .unwrap();
        store
            .finish_step(&step, StepStatus::Completed, json!({"intent": "chat"}), None)
            .await
            .unwrap();
        store
            .insert_artifact(
                &run_id,
                NewArtifact::new(Some(&run_id), ArtifactType::Log, "run-manifest.json"),
            )
            .await
            .unwrap();
        store
            .complete_run(&run_id, completion(RunStatus::Completed))
            .await
            .unwrap();

        let export = store.export_run(&run_id).await.unwrap();
        assert_eq!(export.run.status, RunStatus::Completed);
        assert_eq!(export.run.intent_type.as_deref(), Some("code_exec"));
        assert!(export.run.completed_at_ms.is_some());
        assert_eq!(export.steps.len(), 1);
        assert_eq!(export.steps[0].output["intent"], "chat");
        assert_eq!(export.tool_calls[0].run_step_id.as_deref(), Some(step.as_str()));
        assert_eq!(export.artifacts[0].name, "run-manifest.json");
    }

    #[tokio::test]
    async fn terminal_runs_reject_second_transition() {
        let store = InMemoryRunStore::new();
        let run_id = store.insert_run(new_run()).await.unwrap();
        store
            .complete_run(&run_id, completion(RunStatus::AwaitingApproval))
            .await
            .unwrap();
        let err = store
            .complete_run(&run_id, completion(RunStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition {
            from: RunStatus::AwaitingApproval,
            to: RunStatus::Completed
        }));
        assert!(
            store
                .complete_run(&run_id, completion(RunStatus::Running))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_errors() {
        let store = InMemoryRunStore::new();
        assert!(store.insert_step("nope", "x", json!({})).await.is_err());
        assert!(
            store
                .finish_step("nope", StepStatus::Failed, json!({}), None)
                .await
                .is_err()
        );
        assert!(matches!(
            store.export_run("nope").await.unwrap_err(),
            Error::RunNotFound { .. }
        ));
    }
}
