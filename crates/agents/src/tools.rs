//! Sandbox tools offered to the agent loop, the pre-execution safety gate,
//! and the executor that routes tool calls.

use {
    crucible_common::text::truncate_with_marker,
    crucible_mcp::McpManager,
    crucible_runs::{CodeRiskCheck, EgressPolicy, RiskPolicy},
    crucible_sandbox::{Language, OutputFile, SandboxRuntime, execute_code, install_packages},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::{Value, json},
    tracing::{debug, warn},
};

pub const EXECUTE_CODE: &str = "execute_code";
pub const INSTALL_PACKAGES: &str = "install_packages";
pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";

const READ_FILE_MAX_CHARS: usize = 8_000;
const READ_FILE_MARKER: &str = "\n...[truncated, file is larger than 8KB]";

/// Definitions of the four sandbox tools.
#[must_use]
pub fn sandbox_tools() -> Vec<Value> {
    vec![
        json!({
            "name": EXECUTE_CODE,
            "description": "Write and execute Python or JavaScript code in the sandbox. \
                The sandbox has network access and a working directory at /home/user/. \
                Use it for data analysis, scraping, file generation, calculations and anything \
                else that needs a runtime. Save charts with plt.savefig() (never plt.show()); \
                for plotly use fig.write_html() with include_plotlyjs=True. \
                Save output files to /home/user/.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Complete, runnable code."},
                    "language": {
                        "type": "string",
                        "enum": ["python", "javascript"],
                        "description": "Programming language. Defaults to python."
                    }
                },
                "required": ["code"]
            }
        }),
        json!({
            "name": INSTALL_PACKAGES,
            "description": "Install pip or npm packages in the sandbox. Call it before \
                execute_code when the code needs anything beyond the standard library, \
                including requests, numpy, pandas or matplotlib.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "packages": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Package names."
                    },
                    "language": {
                        "type": "string",
                        "enum": ["python", "javascript"],
                        "description": "Package manager to use. Defaults to python (pip)."
                    }
                },
                "required": ["packages"]
            }
        }),
        json!({
            "name": READ_FILE,
            "description": "Read a text file from the sandbox, e.g. to inspect generated \
                output or an uploaded file. Binary files are not supported.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path, e.g. /home/user/data.csv"}
                },
                "required": ["path"]
            }
        }),
        json!({
            "name": WRITE_FILE,
            "description": "Write text content to a file in the sandbox. Parent directories \
                must already exist.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path, e.g. /home/user/input.json"},
                    "content": {"type": "string", "description": "Text to write."}
                },
                "required": ["path", "content"]
            }
        }),
    ]
}

/// Sandbox tools followed by every connected MCP tool.
pub async fn all_tools(mcp: Option<&McpManager>) -> Vec<Value> {
    let mut tools = sandbox_tools();
    if let Some(mcp) = mcp {
        for tool in mcp.anthropic_tools().await {
            match serde_json::to_value(tool) {
                Ok(value) => tools.push(value),
                Err(e) => warn!(error = %e, "failed to encode MCP tool definition"),
            }
        }
    }
    tools
}

// ── Safety gate ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyCheck {
    pub allowed: bool,
    pub risk: CodeRiskCheck,
    pub egress_blocked: Vec<String>,
}

impl SafetyCheck {
    /// Risk reasons followed by one entry per blocked host.
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.risk
            .reasons
            .iter()
            .cloned()
            .chain(self.egress_blocked.iter().map(|h| format!("Egress blocked: {h}")))
            .collect()
    }
}

/// Risk and egress policy applied before any generated code runs.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    risk: RiskPolicy,
    egress: EgressPolicy,
}

impl SafetyGate {
    #[must_use]
    pub fn new(risk: RiskPolicy, egress: EgressPolicy) -> Self {
        Self { risk, egress }
    }

    #[must_use]
    pub fn risk(&self) -> &RiskPolicy {
        &self.risk
    }

    #[must_use]
    pub fn egress(&self) -> &EgressPolicy {
        &self.egress
    }

    /// Risky code passes only when dangerous actions are allowed; blocked
    /// egress never passes.
    #[must_use]
    pub fn check(&self, code: &str, allow_dangerous: bool) -> SafetyCheck {
        let risk = self.risk.inspect(code);
        let egress = self.egress.evaluate(code);
        let egress_blocked = if egress.enabled {
            egress.blocked_hosts
        } else {
            Vec::new()
        };
        SafetyCheck {
            allowed: (!risk.requires_approval || allow_dangerous) && egress_blocked.is_empty(),
            risk,
            egress_blocked,
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_check: Option<CodeRiskCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<OutputFile>,
}

impl ToolExecutionResult {
    fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Default::default()
        }
    }

    fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct ExecuteCodeInput {
    code: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct InstallPackagesInput {
    packages: Vec<String>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct ReadFileInput {
    path: String,
}

#[derive(Deserialize)]
struct WriteFileInput {
    path: String,
    content: String,
}

fn language_or_python(language: Option<&str>) -> Language {
    language.map_or(Language::Python, Language::parse)
}

/// Routes one tool call to the sandbox or, for unknown names, to MCP.
pub struct ToolExecutor<'a> {
    pub sandbox: &'a dyn SandboxRuntime,
    pub gate: &'a SafetyGate,
    pub mcp: Option<&'a McpManager>,
    pub timeout_ms: u64,
    pub allow_dangerous: bool,
}

impl ToolExecutor<'_> {
    pub async fn execute(&self, name: &str, input: &Value) -> ToolExecutionResult {
        debug!(tool = name, "executing tool call");
        match name {
            EXECUTE_CODE => match parse_input::<ExecuteCodeInput>(name, input) {
                Ok(input) => self.execute_code(input).await,
                Err(failure) => failure,
            },
            INSTALL_PACKAGES => match parse_input::<InstallPackagesInput>(name, input) {
                Ok(input) => self.install(input).await,
                Err(failure) => failure,
            },
            READ_FILE => match parse_input::<ReadFileInput>(name, input) {
                Ok(input) => self.read_file(&input.path).await,
                Err(failure) => failure,
            },
            WRITE_FILE => match parse_input::<WriteFileInput>(name, input) {
                Ok(input) => self.write_file(&input.path, &input.content).await,
                Err(failure) => failure,
            },
            _ => {
                if let Some(mcp) = self.mcp
                    && mcp.is_mcp_tool(name).await
                {
                    let result = mcp.call_tool(name, input.clone()).await;
                    return ToolExecutionResult {
                        success: result.success,
                        output: result.output,
                        execution_time_ms: Some(result.execution_time_ms),
                        ..Default::default()
                    };
                }
                ToolExecutionResult::failure(format!("Unknown tool: {name}"))
            },
        }
    }

    async fn execute_code(&self, input: ExecuteCodeInput) -> ToolExecutionResult {
        let safety = self.gate.check(&input.code, self.allow_dangerous);
        if !safety.allowed {
            let reasons = safety.reasons().join("; ");
            warn!(reasons = %reasons, "tool execution blocked by safety policy");
            return ToolExecutionResult {
                success: false,
                output: format!("Execution blocked by safety policy: {reasons}"),
                blocked: true,
                block_reason: Some(reasons),
                risk_check: Some(safety.risk),
                ..Default::default()
            };
        }

        let language = language_or_python(input.language.as_deref());
        let result = execute_code(self.sandbox, &input.code, language, self.timeout_ms).await;
        let output = if result.success {
            [&result.output, &result.stdout]
                .into_iter()
                .find(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "(no output)".into())
        } else {
            let detail = result
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| result.stderr.clone());
            format!("Error:\n{detail}")
        };
        ToolExecutionResult {
            success: result.success,
            output,
            execution_time_ms: Some(result.execution_time_ms),
            files: result.files,
            risk_check: Some(safety.risk),
            ..Default::default()
        }
    }

    async fn install(&self, input: InstallPackagesInput) -> ToolExecutionResult {
        let language = language_or_python(input.language.as_deref());
        let result = install_packages(self.sandbox, &input.packages, language).await;
        if result.success {
            ToolExecutionResult::ok(format!(
                "Successfully installed: {}",
                input.packages.join(", ")
            ))
        } else {
            ToolExecutionResult::failure(format!("Package installation failed: {}", result.output))
        }
    }

    async fn read_file(&self, path: &str) -> ToolExecutionResult {
        match self.sandbox.read_text(path).await {
            Ok(text) => ToolExecutionResult::ok(truncate_with_marker(
                &text,
                READ_FILE_MAX_CHARS,
                READ_FILE_MARKER,
            )),
            Err(e) => ToolExecutionResult::failure(format!("Failed to read file: {e}")),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> ToolExecutionResult {
        match self.sandbox.write_file(path, content.as_bytes()).await {
            Ok(()) => ToolExecutionResult::ok(format!(
                "File written successfully: {path} ({} bytes)",
                content.len()
            )),
            Err(e) => ToolExecutionResult::failure(format!("Failed to write file: {e}")),
        }
    }
}

fn parse_input<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T, ToolExecutionResult> {
    serde_json::from_value(input.clone())
        .map_err(|e| ToolExecutionResult::failure(format!("Invalid input for {tool}: {e}")))
}
