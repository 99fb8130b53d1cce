//! Config schema types (microVM transport, sandbox sessions, run policy, MCP, LLM).
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub microvm: MicrovmConfig,
    pub sandbox: SandboxConfig,
    pub budget: BudgetConfig,
    pub risk: RiskConfig,
    pub egress: EgressConfig,
    pub manifest: ManifestConfig,
    pub mcp: McpConfig,
    pub llm: LlmConfig,
    pub workflow: WorkflowConfig,
}

// ── MicroVM controller ──────────────────────────────────────────────────────

/// How the microVM controller reaches its backend.
///
/// Command specs are shell-like strings (`limactl shell crucible-worker -- microvmctl`)
/// that are tokenized by the sandbox crate. `None` means "use the platform default".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrovmConfig {
    /// Explicit transport: `local`, `ssh` or `hyperv`. Anything else is ignored.
    pub transport: Option<String>,
    pub backend_cli: Option<String>,
    pub hyperv_cli: Option<String>,
    pub remote_cli: Option<String>,
    pub ssh_cli: Option<String>,
    pub ssh: SshConfig,
    /// Stop the Lima worker after a period without heartbeats.
    pub auto_stop_on_idle: bool,
    pub auto_stop_idle_secs: u64,
    pub lima_instance: String,
}

impl Default for MicrovmConfig {
    fn default() -> Self {
        Self {
            transport: None,
            backend_cli: None,
            hyperv_cli: None,
            remote_cli: None,
            ssh_cli: None,
            ssh: SshConfig::default(),
            auto_stop_on_idle: false,
            auto_stop_idle_secs: 90,
            lima_instance: "crucible-worker".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<String>,
    pub key_path: Option<String>,
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: None,
            key_path: None,
            strict_host_key_checking: true,
        }
    }
}

impl SshConfig {
    /// Host with surrounding whitespace removed; `None` when blank.
    #[must_use]
    pub fn configured_host(&self) -> Option<&str> {
        self.host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
    }
}

// ── Sandbox sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Lifetime of a cached per-user session.
    pub session_ttl_ms: u64,
    /// Interval of the idle-session sweep.
    pub sweep_interval_ms: u64,
    /// Fall back to the remote provider when the local microVM cannot start.
    pub allow_remote_fallback: bool,
    /// `auto`, `local_microvm` or `remote_e2b`.
    pub default_provider: String,
    /// Command spec of the controller wrapper used by the readiness prober.
    pub controller_cli: Option<String>,
    pub probe_timeout_ms: u64,
    pub remote_api_url: Option<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_api_key: Option<Secret<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 10 * 60 * 1000,
            sweep_interval_ms: 2 * 60 * 1000,
            allow_remote_fallback: true,
            default_provider: "auto".into(),
            controller_cli: None,
            probe_timeout_ms: 120_000,
            remote_api_url: None,
            remote_api_key: None,
        }
    }
}

// ── Run policy ──────────────────────────────────────────────────────────────

/// Operator-level budget overrides. Only positive values take effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_total_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_sandbox_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub max_agent_iterations: Option<u32>,
}

/// Extra risk patterns appended to the built-in table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub extra_patterns: Vec<RiskPatternConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPatternConfig {
    /// Case-insensitive regular expression.
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Hostnames generated code may contact. `*.example.com` matches subdomains.
    /// Empty disables the check.
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub signing_key: Option<Secret<String>>,
}

// ── MCP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub enabled: bool,
    /// Search the public registry when no verified server matches.
    pub dynamic_discovery: bool,
    pub registry_url: String,
    pub max_connected_servers: usize,
    pub discovery_timeout_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dynamic_discovery: false,
            registry_url: "https://registry.modelcontextprotocol.io/v0.1".into(),
            max_connected_servers: 5,
            discovery_timeout_ms: 20_000,
        }
    }
}

// ── LLM ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    pub base_url: String,
    /// Fast model used for routing, code generation and summaries.
    pub router_model: String,
    /// Tool-calling model used by the agent loop.
    pub orchestrator_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".into(),
            router_model: "claude-haiku-4-5-20251001".into(),
            orchestrator_model: "claude-sonnet-4-20250514".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Drive execution through the tool-calling agent loop instead of the
    /// linear generate-then-execute pipeline.
    pub agent_loop: bool,
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
