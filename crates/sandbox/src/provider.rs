//! Provider-neutral sandbox capability contract.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::error::{Error, Result};

/// Concrete sandbox backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LocalMicrovm,
    RemoteE2b,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalMicrovm => "local_microvm",
            Self::RemoteE2b => "remote_e2b",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asked for. `Auto` lets the readiness probe decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPreference {
    #[default]
    Auto,
    LocalMicrovm,
    RemoteE2b,
}

impl ProviderPreference {
    /// Parse a preference string; unknown values mean `Auto`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "local_microvm" => Self::LocalMicrovm,
            "remote_e2b" => Self::RemoteE2b,
            _ => Self::Auto,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::LocalMicrovm => "local_microvm",
            Self::RemoteE2b => "remote_e2b",
        }
    }

    /// The provider this preference pins, if any.
    #[must_use]
    pub fn explicit(self) -> Option<ProviderKind> {
        match self {
            Self::Auto => None,
            Self::LocalMicrovm => Some(ProviderKind::LocalMicrovm),
            Self::RemoteE2b => Some(ProviderKind::RemoteE2b),
        }
    }
}

impl std::fmt::Display for ProviderPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLogs {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeError {
    #[serde(default)]
    pub traceback: Option<String>,
}

/// One rich result of an interactive execution. Only inline PNGs are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOutput {
    /// Base64-encoded PNG.
    #[serde(default)]
    pub png: Option<String>,
}

/// Result of the interactive code primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeResult {
    #[serde(default)]
    pub logs: CodeLogs,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub error: Option<CodeError>,
    #[serde(default)]
    pub results: Vec<CodeOutput>,
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxCreateInput {
    pub user_id: String,
    pub timeout_ms: u64,
}

/// A live sandbox.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Whether [`SandboxRuntime::run_code`] is available.
    fn supports_code(&self) -> bool {
        false
    }

    async fn run_code(&self, _code: &str, _timeout_ms: u64) -> Result<CodeResult> {
        Err(Error::message(format!(
            "{} does not support interactive code execution",
            self.provider()
        )))
    }

    async fn run_command(&self, command: &str, timeout_ms: u64) -> Result<CommandOutput>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read_file(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Tear the sandbox down. Callers treat failures as best-effort.
    async fn kill(&self) -> Result<()>;
}

/// `{base without trailing /}/{name}`.
#[must_use]
pub fn join_sandbox_path(base: &str, name: &str) -> String {
    format!("{}/{name}", base.strip_suffix('/').unwrap_or(base))
}

/// Parse a JSON directory listing: a bare array or an `{entries: [...]}` envelope.
pub fn parse_file_listing(raw: &str, base_path: &str) -> Result<Vec<FileEntry>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: Value = serde_json::from_str(trimmed)?;
    let rows: &[Value] = match &parsed {
        Value::Array(rows) => rows.as_slice(),
        Value::Object(map) => match map.get("entries") {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    Ok(rows
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|row| {
            let name = ["name", "filename"]
                .iter()
                .filter_map(|key| row.get(*key).and_then(Value::as_str))
                .find(|s| !s.is_empty())?
                .to_string();
            let path = row
                .get("path")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map_or_else(|| join_sandbox_path(base_path, &name), str::to_string);
            let kind = match row.get("type").and_then(Value::as_str) {
                Some("dir" | "directory") => FileKind::Dir,
                _ => FileKind::File,
            };
            let size = row.get("size").and_then(Value::as_u64);
            Some(FileEntry {
                name,
                path,
                kind,
                size,
            })
        })
        .collect())
}
