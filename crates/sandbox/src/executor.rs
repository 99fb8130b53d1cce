//! Run generated code in a sandbox and collect the files it produced.

use std::{collections::HashSet, time::Instant};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    crucible_common::time::now_ms,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{
    error::{Context, Result},
    provider::{FileKind, SandboxRuntime},
};

/// Working directory inside every sandbox.
pub const WORK_DIR: &str = "/home/user/";

/// Extensions of files reported as execution output.
pub const OUTPUT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "pdf", "csv", "json", "html", "txt", "md", "xlsx",
    "xml", "zip",
];

pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Javascript,
    Bash,
}

impl Language {
    /// Parse a language name; anything unrecognised runs as bash.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Self::Python,
            "javascript" | "js" | "node" => Self::Javascript,
            _ => Self::Bash,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Bash => "bash",
        }
    }

    fn script_extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Javascript => "js",
            Self::Bash => "sh",
        }
    }

    fn interpreter(self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Javascript => "node",
            Self::Bash => "bash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub files: Vec<OutputFile>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Execute `code` and report output plus newly created output files.
///
/// Never fails: sandbox errors are folded into an unsuccessful result.
pub async fn execute_code(
    sandbox: &dyn SandboxRuntime,
    code: &str,
    language: Language,
    timeout_ms: u64,
) -> ExecutionResult {
    let started = Instant::now();
    match run(sandbox, code, language, timeout_ms).await {
        Ok(mut result) => {
            result.execution_time_ms = elapsed_ms(started);
            result
        },
        Err(e) => {
            warn!(error = %e, language = language.as_str(), "code execution failed");
            ExecutionResult {
                success: false,
                stderr: e.to_string(),
                error: Some(e.to_string()),
                execution_time_ms: elapsed_ms(started),
                ..Default::default()
            }
        },
    }
}

async fn run(
    sandbox: &dyn SandboxRuntime,
    code: &str,
    language: Language,
    timeout_ms: u64,
) -> Result<ExecutionResult> {
    let before = snapshot(sandbox).await;

    if language == Language::Python && sandbox.supports_code() {
        let execution = sandbox.run_code(code, timeout_ms).await?;
        let stdout = execution.logs.stdout.join("\n");
        let stderr = execution.logs.stderr.join("\n");

        let mut files = detect_new_files(sandbox, &before, &[]).await;
        if files.is_empty() {
            let stamp = now_ms();
            for (index, result) in execution.results.iter().enumerate() {
                let Some(png) = &result.png else {
                    continue;
                };
                let bytes = STANDARD.decode(png.trim()).context("invalid inline image")?;
                let name = format!("output_{stamp}_{index}.png");
                let path = format!("{WORK_DIR}{name}");
                sandbox.write_file(&path, &bytes).await?;
                files.push(OutputFile {
                    name,
                    path,
                    size: bytes.len() as u64,
                });
            }
        }

        let output = if execution.text.is_empty() {
            stdout.clone()
        } else {
            execution.text.clone()
        };
        return Ok(ExecutionResult {
            success: execution.error.is_none(),
            stdout,
            stderr,
            output,
            files,
            execution_time_ms: 0,
            error: execution
                .error
                .map(|e| e.traceback.unwrap_or_else(|| "Execution failed".into())),
        });
    }

    let script = format!("script_{}.{}", now_ms(), language.script_extension());
    let script_path = format!("{WORK_DIR}{script}");
    sandbox.write_file(&script_path, code.as_bytes()).await?;

    let command = format!("{} {script_path}", language.interpreter());
    let result = sandbox.run_command(&command, timeout_ms).await?;
    let files = detect_new_files(sandbox, &before, &[script.as_str()]).await;
    debug!(
        exit_code = result.exit_code,
        files = files.len(),
        "script finished"
    );

    let success = result.exit_code == 0;
    Ok(ExecutionResult {
        success,
        output: result.stdout.clone(),
        error: (!success).then(|| result.stderr.clone()),
        stdout: result.stdout,
        stderr: result.stderr,
        files,
        execution_time_ms: 0,
    })
}

async fn snapshot(sandbox: &dyn SandboxRuntime) -> HashSet<String> {
    match sandbox.list_files(WORK_DIR).await {
        Ok(entries) => entries.into_iter().map(|e| e.name).collect(),
        Err(e) => {
            debug!(error = %e, "work dir snapshot failed");
            HashSet::new()
        },
    }
}

async fn detect_new_files(
    sandbox: &dyn SandboxRuntime,
    before: &HashSet<String>,
    exclude: &[&str],
) -> Vec<OutputFile> {
    let entries = match sandbox.list_files(WORK_DIR).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "output file detection failed");
            return Vec::new();
        },
    };
    entries
        .into_iter()
        .filter(|e| e.kind != FileKind::Dir)
        .filter(|e| !before.contains(&e.name) && !exclude.contains(&e.name.as_str()))
        .filter(|e| is_output_file(&e.name))
        .map(|e| OutputFile {
            path: format!("{WORK_DIR}{}", e.name),
            size: e.size.unwrap_or(0),
            name: e.name,
        })
        .collect()
}

/// Whether `name` carries one of the [`OUTPUT_EXTENSIONS`].
#[must_use]
pub fn is_output_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| OUTPUT_EXTENSIONS.contains(&ext.as_str()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
