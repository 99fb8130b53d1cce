use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::schema::CrucibleConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["crucible.toml", "crucible.json"];

/// Load config from the given path (TOML or JSON).
pub fn load_config(path: &Path) -> anyhow::Result<CrucibleConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply
/// environment overrides.
///
/// Search order:
/// 1. `./crucible.{toml,json}` (project-local)
/// 2. `~/.config/crucible/crucible.{toml,json}` (user-global)
///
/// Falls back to `CrucibleConfig::default()` if no file is found or the
/// file cannot be parsed.
pub fn discover_and_load() -> CrucibleConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    CrucibleConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            CrucibleConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/crucible/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "crucible").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CrucibleConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Apply environment-variable overrides from the process environment.
pub fn apply_env_overrides(config: &mut CrucibleConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

/// Apply environment-variable overrides using a custom lookup.
///
/// Blank values are treated as unset.
pub fn apply_env_overrides_with(
    config: &mut CrucibleConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let get = |name: &str| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    // ── microVM transport ──
    let mv = &mut config.microvm;
    if let Some(v) = get("LOCAL_MICROVM_TRANSPORT").or_else(|| get("MICROVMCTL_TRANSPORT")) {
        mv.transport = Some(v);
    }
    set_opt(&mut mv.backend_cli, get("LOCAL_MICROVM_BACKEND_CLI"));
    set_opt(&mut mv.hyperv_cli, get("LOCAL_MICROVM_HYPERV_CLI"));
    set_opt(&mut mv.remote_cli, get("LOCAL_MICROVM_REMOTE_CLI"));
    set_opt(&mut mv.ssh_cli, get("LOCAL_MICROVM_SSH_CLI"));
    set_opt(&mut mv.ssh.host, get("LOCAL_MICROVM_SSH_HOST"));
    set_opt(&mut mv.ssh.user, get("LOCAL_MICROVM_SSH_USER"));
    set_opt(&mut mv.ssh.port, get("LOCAL_MICROVM_SSH_PORT"));
    set_opt(&mut mv.ssh.key_path, get("LOCAL_MICROVM_SSH_KEY_PATH"));
    if let Some(v) = get("LOCAL_MICROVM_SSH_STRICT_HOST_KEY_CHECKING") {
        mv.ssh.strict_host_key_checking = !v.eq_ignore_ascii_case("false");
    }
    if let Some(v) = get("LOCAL_MICROVM_AUTO_STOP_ON_IDLE") {
        mv.auto_stop_on_idle = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Some(secs) = get("LOCAL_MICROVM_AUTO_STOP_IDLE_SECONDS").and_then(|v| v.parse().ok()) {
        mv.auto_stop_idle_secs = secs;
    }
    if let Some(v) = get("LOCAL_MICROVM_LIMA_INSTANCE") {
        mv.lima_instance = v;
    }

    // ── sandbox sessions ──
    let sb = &mut config.sandbox;
    set_opt(&mut sb.controller_cli, get("LOCAL_MICROVM_CLI"));
    if let Some(ttl) = get("SANDBOX_SESSION_TTL_MS").and_then(|v| v.parse::<u64>().ok())
        && ttl > 0
    {
        sb.session_ttl_ms = ttl;
    }
    if let Some(v) = get("SANDBOX_ALLOW_REMOTE_FALLBACK") {
        sb.allow_remote_fallback = !v.eq_ignore_ascii_case("false");
    }
    set_opt(&mut sb.remote_api_url, get("REMOTE_SANDBOX_API_URL"));
    if let Some(key) = get("REMOTE_SANDBOX_API_KEY") {
        sb.remote_api_key = Some(Secret::new(key));
    }

    // ── run policy ──
    let budget = &mut config.budget;
    set_positive(&mut budget.max_total_tokens, get("RUN_BUDGET_MAX_TOTAL_TOKENS"));
    set_positive(&mut budget.max_output_tokens, get("RUN_BUDGET_MAX_OUTPUT_TOKENS"));
    set_positive(&mut budget.max_sandbox_ms, get("RUN_BUDGET_MAX_SANDBOX_MS"));
    if let Some(cost) = get("RUN_BUDGET_MAX_COST_USD").and_then(|v| v.parse::<f64>().ok())
        && cost.is_finite()
        && cost > 0.0
    {
        budget.max_cost_usd = Some(cost);
    }
    set_positive(
        &mut budget.max_agent_iterations,
        get("RUN_BUDGET_MAX_AGENT_ITERATIONS"),
    );

    if let Some(list) = lookup("SANDBOX_EGRESS_ALLOWLIST") {
        config.egress.allowlist = list
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(key) = get("RUN_MANIFEST_SIGNING_KEY") {
        config.manifest.signing_key = Some(Secret::new(key));
    }

    // ── MCP ──
    if let Some(v) = get("MCP_ENABLED") {
        config.mcp.enabled = !v.eq_ignore_ascii_case("false");
    }
    if let Some(v) = get("MCP_DYNAMIC_DISCOVERY") {
        config.mcp.dynamic_discovery = v.eq_ignore_ascii_case("true");
    }
    if let Some(v) = get("MCP_REGISTRY_URL") {
        config.mcp.registry_url = v;
    }

    // ── LLM / workflow ──
    if let Some(key) = get("ANTHROPIC_API_KEY") {
        config.llm.api_key = Some(Secret::new(key));
    }
    if let Some(v) = get("ANTHROPIC_BASE_URL") {
        config.llm.base_url = v;
    }
    if let Some(v) = get("AGENT_LOOP_ENABLED") {
        config.workflow.agent_loop = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

fn set_opt(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

fn set_positive<T>(slot: &mut Option<T>, value: Option<String>)
where
    T: std::str::FromStr + PartialOrd + Default,
{
    if let Some(parsed) = value.and_then(|v| v.parse::<T>().ok())
        && parsed > T::default()
    {
        *slot = Some(parsed);
    }
}
