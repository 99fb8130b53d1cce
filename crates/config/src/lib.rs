//! Configuration loading, environment overrides and validation.
//!
//! Config files: `crucible.toml` or `crucible.json`
//! Searched in `./` then `~/.config/crucible/`. Environment variables
//! (`LOCAL_MICROVM_*`, `SANDBOX_*`, `RUN_BUDGET_*`, `MCP_*`, ...) override
//! file values.

pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{apply_env_overrides, apply_env_overrides_with, config_dir, discover_and_load, load_config},
    schema::{
        BudgetConfig, CrucibleConfig, EgressConfig, LlmConfig, ManifestConfig, McpConfig,
        MicrovmConfig, RiskConfig, RiskPatternConfig, SandboxConfig, SshConfig, WorkflowConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
