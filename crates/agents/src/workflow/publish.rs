//! Copy files produced in the sandbox to blob storage.

use std::time::Duration;

use {
    crucible_common::time::now_ms,
    crucible_runs::{ArtifactType, NewArtifact},
    crucible_sandbox::{OutputFile, SandboxRuntime},
    serde_json::json,
    tracing::{debug, warn},
};

use {
    super::{RunContext, Workflow},
    crate::{content_type::infer_content_type, events::WorkflowEvent},
};

const SIGNED_URL_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct PublishedFile {
    pub name: String,
    pub storage_path: String,
    pub url: String,
    pub size: u64,
}

/// One file per name, first-seen order, last occurrence wins.
pub(super) fn dedupe_by_name(files: Vec<OutputFile>) -> Vec<OutputFile> {
    let mut unique: Vec<OutputFile> = Vec::with_capacity(files.len());
    for file in files {
        match unique.iter_mut().find(|f| f.name == file.name) {
            Some(existing) => *existing = file,
            None => unique.push(file),
        }
    }
    unique
}

impl Workflow {
    /// Upload every file and emit a `file` event per success. Per-file
    /// failures become `error` events and do not stop the others.
    pub(super) async fn publish_files(
        &self,
        ctx: &RunContext,
        sandbox: &dyn SandboxRuntime,
        files: &[OutputFile],
    ) -> Vec<PublishedFile> {
        if files.is_empty() {
            return Vec::new();
        }
        let step = self
            .ledger
            .start_step(
                ctx.run_id(),
                "publish_files",
                json!({"fileCount": files.len()}),
            )
            .await;

        let mut published = Vec::with_capacity(files.len());
        for file in files {
            match self.publish_one(ctx, sandbox, file, step.as_deref()).await {
                Ok(done) => {
                    ctx.emit(WorkflowEvent::File {
                        name: done.name.clone(),
                        url: done.url.clone(),
                        size: done.size,
                    });
                    published.push(done);
                },
                Err(message) => {
                    warn!(file = %file.name, %message, "failed to publish output file");
                    ctx.emit(WorkflowEvent::error(message));
                },
            }
        }

        self.ledger
            .complete_step(
                step.as_deref(),
                json!({"success": true, "published": published.len()}),
            )
            .await;
        published
    }

    async fn publish_one(
        &self,
        ctx: &RunContext,
        sandbox: &dyn SandboxRuntime,
        file: &OutputFile,
        step: Option<&str>,
    ) -> Result<PublishedFile, String> {
        let content = sandbox
            .read_file(&file.path)
            .await
            .map_err(|e| format!("Failed to publish file {}: {e}", file.name))?;
        let size = content.len() as u64;
        let content_type = infer_content_type(&file.name);
        let storage_path = format!("{}/{}_{}", ctx.input.user_id, now_ms(), file.name);

        self.ports
            .blobs
            .upload(&storage_path, content, content_type)
            .await
            .map_err(|e| format!("File upload failed: {e}"))?;

        let url = match self
            .ports
            .blobs
            .signed_url(&storage_path, SIGNED_URL_TTL)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                debug!(error = %e, path = %storage_path, "signed URL unavailable, using public URL");
                self.ports.blobs.public_url(&storage_path)
            },
        };

        self.ledger
            .record_artifact(NewArtifact {
                run_step_id: step.map(str::to_string),
                storage_path: Some(storage_path.clone()),
                mime_type: Some(content_type.to_string()),
                size_bytes: size,
                ..NewArtifact::new(ctx.run_id(), ArtifactType::File, file.name.clone())
            })
            .await;

        Ok(PublishedFile {
            name: file.name.clone(),
            storage_path,
            url,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> OutputFile {
        OutputFile {
            name: name.into(),
            path: format!("/home/user/{name}"),
            size,
        }
    }

    #[test]
    fn dedupe_keeps_last_version_in_first_position() {
        let files = vec![file("chart.png", 1), file("data.csv", 2), file("chart.png", 3)];
        assert_eq!(dedupe_by_name(files), vec![file("chart.png", 3), file("data.csv", 2)]);
    }
}
