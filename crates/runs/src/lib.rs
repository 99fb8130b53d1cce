//! Run ledger, signed manifests and the per-run budget, risk and egress policy.

pub mod budget;
pub mod egress;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod risk;
pub mod store;
pub mod store_memory;
pub mod types;

pub use {
    budget::{
        BudgetOverrides, RunBudget, RunUsage, estimate_cost_usd, model_label, resolve_budget,
    },
    egress::{EgressPolicy, EgressPolicyResult},
    error::{Error, Result},
    ledger::RunLedger,
    manifest::{ManifestInput, RunManifest, SignedManifest, build_signed_manifest},
    risk::{CodeRiskCheck, RiskPolicy},
    store::RunStore,
    store_memory::InMemoryRunStore,
    types::{
        Artifact, ArtifactType, NewArtifact, NewRun, NewToolCall, Run, RunCompletion, RunExport,
        RunStatus, RunStep, StepStatus, ToolCall, ToolCallStatus,
    },
};
