//! Semantic validation of a loaded configuration.
//!
//! Parsing already guarantees the shape; these checks catch combinations that
//! load fine but cannot work at runtime.

use crate::schema::CrucibleConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "microvm.ssh.host"
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

const TRANSPORTS: &[&str] = &["local", "ssh", "hyperv"];
const PROVIDERS: &[&str] = &["auto", "local_microvm", "remote_e2b"];

/// Check a configuration for values that will not work at runtime.
#[must_use]
pub fn validate(config: &CrucibleConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if let Some(transport) = config.microvm.transport.as_deref() {
        let normalized = transport.trim().to_ascii_lowercase();
        if !TRANSPORTS.contains(&normalized.as_str()) {
            result.push(
                Severity::Warning,
                "microvm.transport",
                format!("unknown transport \"{transport}\" is ignored; expected local, ssh or hyperv"),
            );
        } else if normalized == "ssh" && config.microvm.ssh.configured_host().is_none() {
            result.push(
                Severity::Error,
                "microvm.ssh.host",
                "ssh transport selected but no ssh host is configured",
            );
        }
    }

    if let Some(port) = config.microvm.ssh.port.as_deref()
        && port.trim().parse::<u16>().is_err()
    {
        result.push(
            Severity::Error,
            "microvm.ssh.port",
            format!("\"{port}\" is not a valid port"),
        );
    }

    if !config.microvm.ssh.strict_host_key_checking {
        result.push(
            Severity::Warning,
            "microvm.ssh.strict_host_key_checking",
            "host key checking is disabled; the worker's identity is not verified",
        );
    }

    if !PROVIDERS.contains(&config.sandbox.default_provider.as_str()) {
        result.push(
            Severity::Warning,
            "sandbox.default_provider",
            format!(
                "unknown provider \"{}\" falls back to auto",
                config.sandbox.default_provider
            ),
        );
    }

    if config.sandbox.session_ttl_ms == 0 {
        result.push(
            Severity::Error,
            "sandbox.session_ttl_ms",
            "session TTL must be greater than zero",
        );
    }

    if config.sandbox.remote_api_url.is_none() && config.sandbox.allow_remote_fallback {
        result.push(
            Severity::Info,
            "sandbox.remote_api_url",
            "remote fallback is enabled but no remote sandbox API is configured",
        );
    }

    for (idx, pattern) in config.risk.extra_patterns.iter().enumerate() {
        if let Err(e) = regex::Regex::new(&pattern.pattern) {
            result.push(
                Severity::Error,
                &format!("risk.extra_patterns[{idx}].pattern"),
                format!("invalid regular expression: {e}"),
            );
        }
    }

    if config.llm.api_key.is_none() {
        result.push(
            Severity::Warning,
            "llm.api_key",
            "no LLM API key configured; workflows cannot classify or generate code",
        );
    }

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::schema::RiskPatternConfig};

    fn has(result: &ValidationResult, path: &str, severity: Severity) -> bool {
        result
            .diagnostics
            .iter()
            .any(|d| d.path == path && d.severity == severity)
    }

    #[test]
    fn ssh_transport_without_host_is_an_error() {
        let mut cfg = CrucibleConfig::default();
        cfg.microvm.transport = Some("SSH".into());
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert!(has(&result, "microvm.ssh.host", Severity::Error));
    }

    #[test]
    fn unknown_transport_is_a_warning() {
        let mut cfg = CrucibleConfig::default();
        cfg.microvm.transport = Some("docker".into());
        let result = validate(&cfg);
        assert!(has(&result, "microvm.transport", Severity::Warning));
    }

    #[test]
    fn bad_port_and_regex_are_errors() {
        let mut cfg = CrucibleConfig::default();
        cfg.microvm.ssh.port = Some("22x".into());
        cfg.risk.extra_patterns.push(RiskPatternConfig {
            pattern: "(unclosed".into(),
            reason: "x".into(),
        });
        let result = validate(&cfg);
        assert!(has(&result, "microvm.ssh.port", Severity::Error));
        assert!(has(&result, "risk.extra_patterns[0].pattern", Severity::Error));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut cfg = CrucibleConfig::default();
        cfg.sandbox.session_ttl_ms = 0;
        assert!(validate(&cfg).has_errors());
    }
}
