//! `crucible doctor`: config validation and an audit of the sandbox, LLM
//! and MCP setup.
//!
//! Prints a report with `[ok]`, `[warn]`, `[fail]`, `[skip]` or `[info]`
//! per item and exits non-zero when anything failed.

use std::path::Path;

use {
    anyhow::Result,
    crucible_config::{CrucibleConfig, Severity, validate},
    crucible_mcp::verified_servers,
    crucible_sandbox::{MicrovmController, ReadinessProber, Transport},
};

// ── ANSI helpers ────────────────────────────────────────────────────────────

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Skip,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Skip => DIM,
            Self::Info => CYAN,
        }
    }
}

impl From<Severity> for Status {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn count(&self, status: Status) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

// ── Printing ────────────────────────────────────────────────────────────────

fn print_report(sections: &[Section]) -> (usize, usize) {
    let mut errors = 0usize;
    let mut warnings = 0usize;

    for section in sections {
        eprintln!("{BOLD}{}{RESET}", section.title);
        for item in &section.items {
            let color = item.status.color();
            let label = item.status.label();
            eprintln!("  [{color}{label}{RESET}]  {}", item.message);
        }
        errors += section.count(Status::Fail);
        warnings += section.count(Status::Warn);
        eprintln!();
    }

    (errors, warnings)
}

// ── Entry point ─────────────────────────────────────────────────────────────

pub async fn handle_doctor(config: &CrucibleConfig, config_path: Option<&Path>) -> Result<()> {
    eprintln!("{BOLD}crucible doctor{RESET}");
    eprintln!("{BOLD}==============={RESET}\n");

    let sections = vec![
        check_config(config, config_path),
        check_microvm(config),
        check_probe(config).await,
        check_remote(config),
        check_llm(config),
        check_mcp(config),
    ];

    let (errors, warnings) = print_report(&sections);
    eprintln!("{BOLD}Summary:{RESET} {errors} error(s), {warnings} warning(s)");

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

// ── Checks ──────────────────────────────────────────────────────────────────

fn check_config(config: &CrucibleConfig, config_path: Option<&Path>) -> Section {
    let label = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "discovered config".into());
    let mut section = Section::new(format!("Config ({label})"));

    let result = validate(config);
    for d in &result.diagnostics {
        section.push(d.severity.into(), format!("{}: {}", d.path, d.message));
    }
    if result.diagnostics.is_empty() {
        section.push(Status::Ok, "no issues found");
    }
    section
}

fn check_microvm(config: &CrucibleConfig) -> Section {
    let mut section = Section::new("Local microVM");

    let controller = match MicrovmController::from_config(&config.microvm) {
        Ok(controller) => controller,
        Err(e) => {
            section.push(Status::Fail, format!("controller unavailable: {e}"));
            return section;
        },
    };
    section.push(
        Status::Info,
        format!(
            "transport {} via {}",
            controller.transport(),
            controller.display()
        ),
    );

    match controller.transport() {
        Transport::Local | Transport::Hyperv => {
            let binary = &controller.backend().binary;
            match which::which(binary) {
                Ok(path) => section.push(Status::Ok, format!("backend found at {}", path.display())),
                Err(_) => section.push(
                    Status::Warn,
                    format!("backend command \"{binary}\" not found in PATH"),
                ),
            }
        },
        Transport::Ssh => {
            if config.microvm.ssh.configured_host().is_some() {
                section.push(Status::Ok, "ssh host configured");
            } else {
                section.push(Status::Fail, "ssh transport selected but no host configured");
            }
        },
    }
    section
}

async fn check_probe(config: &CrucibleConfig) -> Section {
    let mut section = Section::new("Readiness probe");
    match ReadinessProber::from_config(&config.sandbox) {
        Ok(prober) => {
            let result = prober.probe(true, None).await;
            if result.ok {
                section.push(Status::Ok, "probe succeeded");
            } else {
                section.push(
                    Status::Warn,
                    format!(
                        "probe failed: {}",
                        result.stderr.as_deref().unwrap_or("no details")
                    ),
                );
            }
        },
        Err(e) => section.push(Status::Fail, format!("probe wrapper invalid: {e}")),
    }
    section
}

fn check_remote(config: &CrucibleConfig) -> Section {
    let mut section = Section::new("Remote sandbox");
    let sandbox = &config.sandbox;
    match (&sandbox.remote_api_url, &sandbox.remote_api_key) {
        (Some(url), Some(_)) => section.push(Status::Ok, format!("API at {url}")),
        (Some(url), None) => section.push(Status::Warn, format!("API at {url} has no API key")),
        (None, _) if sandbox.allow_remote_fallback => {
            section.push(Status::Skip, "not configured; fallback will fail")
        },
        (None, _) => section.push(Status::Skip, "not configured"),
    }
    section
}

fn check_llm(config: &CrucibleConfig) -> Section {
    let mut section = Section::new("LLM");
    if config.llm.api_key.is_some() {
        section.push(Status::Ok, "Anthropic API key set");
    } else {
        section.push(Status::Fail, "ANTHROPIC_API_KEY is not set; `crucible run` will not work");
    }
    section.push(
        Status::Info,
        format!(
            "router {}, orchestrator {}",
            config.llm.router_model, config.llm.orchestrator_model
        ),
    );
    section
}

fn check_mcp(config: &CrucibleConfig) -> Section {
    let mut section = Section::new("MCP servers");
    if !config.mcp.enabled {
        section.push(Status::Skip, "MCP disabled");
        return section;
    }
    for server in verified_servers() {
        let name = &server.config.display_name;
        let command = &server.config.command;
        match which::which(command) {
            Ok(_) => section.push(Status::Ok, format!("{name}: {command} available")),
            Err(_) => section.push(
                Status::Warn,
                format!("{name}: command \"{command}\" not found in PATH"),
            ),
        }
    }
    if config.mcp.dynamic_discovery {
        section.push(
            Status::Info,
            format!("registry discovery via {}", config.mcp.registry_url),
        );
    }
    section
}
