//! Cached readiness probe of the local microVM controller.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    crucible_config::SandboxConfig,
    serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned},
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use crate::{
    command_spec::{CommandSpec, command_exists},
    error::Result,
    process::{ProcessRequest, ProcessRunner, TokioProcessRunner},
};

const PROBE_CACHE_TTL: Duration = Duration::from_secs(15);

/// Outcome of one readiness probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ProbeDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Decoded probe report. Fields with an unexpected type decode as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDetails {
    #[serde(default, deserialize_with = "lenient")]
    pub transport: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub platform: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub arch: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub backend: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub backend_found: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub backend_ready: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub backend_probe_error: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub lima_auto_start_attempted: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub hyperv_backend_found: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub ssh_host_configured: Option<bool>,
    #[serde(rename = "remoteCLI", default, deserialize_with = "lenient")]
    pub remote_cli: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Decode the first JSON-object line of probe stdout.
#[must_use]
pub fn parse_probe_details(stdout: &str) -> Option<ProbeDetails> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{') && line.ends_with('}'))?;
    serde_json::from_str(line).ok()
}

/// Runs `microvmctl probe` through the controller wrapper and caches the
/// result for a short time.
pub struct ReadinessProber {
    wrapper: Option<CommandSpec>,
    runner: Arc<dyn ProcessRunner>,
    default_timeout: Duration,
    cache: Mutex<Option<(Instant, ProbeResult)>>,
}

impl ReadinessProber {
    /// The wrapper is `sandbox.controller_cli` when set, otherwise the running
    /// executable with the `microvmctl` subcommand.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let wrapper = match config.controller_cli.as_deref() {
            Some(spec) if !spec.trim().is_empty() => {
                Some(CommandSpec::resolve("LOCAL_MICROVM_CLI", Some(spec), "")?)
            },
            _ => match std::env::current_exe() {
                Ok(exe) => Some(CommandSpec::from_parts(
                    exe.to_string_lossy(),
                    vec!["microvmctl".into()],
                )),
                Err(e) => {
                    warn!(error = %e, "cannot locate current executable for probe wrapper");
                    None
                },
            },
        };
        Ok(Self::new(
            wrapper,
            Duration::from_millis(config.probe_timeout_ms),
        ))
    }

    #[must_use]
    pub fn new(wrapper: Option<CommandSpec>, default_timeout: Duration) -> Self {
        Self {
            wrapper,
            runner: Arc::new(TokioProcessRunner),
            default_timeout,
            cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Probe, serving a cached result younger than 15 s unless `fresh`.
    pub async fn probe(&self, fresh: bool, timeout: Option<Duration>) -> ProbeResult {
        let mut cache = self.cache.lock().await;
        if !fresh
            && let Some((at, cached)) = cache.as_ref()
            && at.elapsed() < PROBE_CACHE_TTL
        {
            return cached.clone();
        }

        let result = self
            .run_probe(timeout.unwrap_or(self.default_timeout))
            .await;
        debug!(ok = result.ok, "local microvm probe finished");
        *cache = Some((Instant::now(), result.clone()));
        result
    }

    async fn run_probe(&self, timeout: Duration) -> ProbeResult {
        let Some(wrapper) = self
            .wrapper
            .as_ref()
            .filter(|w| command_exists(&w.binary))
        else {
            return ProbeResult {
                ok: false,
                details: None,
                stderr: Some("Missing microvmctl controller wrapper.".into()),
            };
        };

        let mut args = wrapper.args.clone();
        args.push("probe".into());
        let request = ProcessRequest::new(wrapper.binary.clone(), args, timeout);

        match self.runner.run(request).await {
            Ok(out) => {
                let stderr = if out.timed_out {
                    Some("Probe timed out.".to_string())
                } else {
                    Some(out.stderr.trim().to_string()).filter(|s| !s.is_empty())
                };
                ProbeResult {
                    ok: out.success(),
                    details: parse_probe_details(&out.stdout),
                    stderr,
                }
            },
            Err(e) => ProbeResult {
                ok: false,
                details: None,
                stderr: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::process::ProcessOutput,
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct CountingRunner {
        output: ProcessOutput,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessRunner for CountingRunner {
        async fn run(&self, _request: ProcessRequest) -> Result<ProcessOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    fn runner(output: ProcessOutput) -> Arc<CountingRunner> {
        Arc::new(CountingRunner {
            output,
            calls: AtomicUsize::new(0),
        })
    }

    fn existing_wrapper() -> Option<CommandSpec> {
        let exe = std::env::current_exe().unwrap();
        Some(CommandSpec::from_parts(exe.to_string_lossy(), vec![]))
    }

    #[test]
    fn parses_first_json_line() {
        let stdout = "warming up\n {\"transport\":\"local\",\"backendFound\":true,\"backendReady\":null,\"remoteCLI\":\"microvmctl\"} \n{\"transport\":\"ssh\"}";
        let details = parse_probe_details(stdout).unwrap();
        assert_eq!(details.transport.as_deref(), Some("local"));
        assert_eq!(details.backend_found, Some(true));
        assert_eq!(details.backend_ready, None);
        assert_eq!(details.remote_cli.as_deref(), Some("microvmctl"));
    }

    #[test]
    fn mistyped_fields_become_unknown() {
        let details = parse_probe_details(
            r#"{"transport":7,"backendFound":"yes","backendReady":true,"arch":"arm64"}"#,
        )
        .unwrap();
        assert_eq!(details.transport, None);
        assert_eq!(details.backend_found, None);
        assert_eq!(details.backend_ready, Some(true));
        assert_eq!(details.arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn malformed_output_has_no_details() {
        assert!(parse_probe_details("no json here").is_none());
        assert!(parse_probe_details("{not json}").is_none());
    }

    #[tokio::test]
    async fn missing_wrapper_is_cached_failure() {
        let fake = runner(ProcessOutput::default());
        let prober = ReadinessProber::new(
            Some(CommandSpec::from_parts("/nonexistent/crucible", vec![])),
            Duration::from_secs(1),
        )
        .with_runner(fake.clone());

        let result = prober.probe(false, None).await;
        assert!(!result.ok);
        assert_eq!(
            result.stderr.as_deref(),
            Some("Missing microvmctl controller wrapper.")
        );
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn caches_until_fresh_requested() {
        let fake = runner(ProcessOutput {
            stdout: r#"{"transport":"local","backendReady":true}"#.into(),
            ..Default::default()
        });
        let prober =
            ReadinessProber::new(existing_wrapper(), Duration::from_secs(1)).with_runner(fake.clone());

        let first = prober.probe(false, None).await;
        assert!(first.ok);
        assert_eq!(first.stderr, None);
        let second = prober.probe(false, None).await;
        assert_eq!(first, second);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        prober.probe(true, None).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_reports_probe_timed_out() {
        let fake = runner(ProcessOutput {
            exit_code: 1,
            stderr: "\nProcess timed out".into(),
            timed_out: true,
            ..Default::default()
        });
        let prober =
            ReadinessProber::new(existing_wrapper(), Duration::from_secs(1)).with_runner(fake);
        let result = prober.probe(true, Some(Duration::from_millis(10))).await;
        assert!(!result.ok);
        assert_eq!(result.stderr.as_deref(), Some("Probe timed out."));
    }

    #[tokio::test]
    async fn failed_probe_keeps_details_and_stderr() {
        let fake = runner(ProcessOutput {
            exit_code: 1,
            stdout: r#"{"transport":"ssh","sshHostConfigured":false}"#.into(),
            stderr: "Probe failed: ssh transport selected but LOCAL_MICROVM_SSH_HOST is not set.\n"
                .into(),
            timed_out: false,
        });
        let prober =
            ReadinessProber::new(existing_wrapper(), Duration::from_secs(1)).with_runner(fake);
        let result = prober.probe(false, None).await;
        assert!(!result.ok);
        assert_eq!(
            result.details.unwrap().ssh_host_configured,
            Some(false)
        );
        assert!(result.stderr.unwrap().starts_with("Probe failed: ssh"));
    }
}
