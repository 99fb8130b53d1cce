//! Sandbox provisioning and execution.
//!
//! Command specs and transport selection feed the microVM controller facade,
//! which backs the local provider. The session manager picks between the
//! local and remote providers per user and falls back when allowed.

pub mod command_spec;
pub mod controller;
pub mod error;
pub mod executor;
pub mod local;
pub mod packages;
pub mod probe;
pub mod process;
pub mod provider;
pub mod remote;
pub mod session;
pub mod transport;

pub use {
    controller::{IdleAutoStop, MicrovmController, ProbeOutcome, ProbeReport},
    error::{Error, Result},
    executor::{ExecutionResult, Language, OutputFile, execute_code},
    packages::{PackageInstallResult, install_packages},
    probe::{ProbeResult, ReadinessProber},
    provider::{FileEntry, FileKind, ProviderKind, ProviderPreference, SandboxRuntime},
    session::{
        DefaultSandboxFactory, SandboxFactory, SessionHandle, SessionManager, SessionOptions,
        SessionStage, SessionStatus,
    },
    transport::Transport,
};
