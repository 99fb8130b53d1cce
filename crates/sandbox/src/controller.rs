//! MicroVM controller facade.
//!
//! Forwards controller subcommands (`create`, `exec`, `write`, `read`, `list`,
//! `kill`, `gc`) to the backend reached through the selected [`Transport`],
//! and answers `probe` itself with a one-line JSON readiness report.

use std::{process::Stdio, sync::Arc, time::Duration};

use {
    crucible_config::{MicrovmConfig, SshConfig},
    regex::Regex,
    serde::Serialize,
    tokio::{process::Command, sync::Mutex, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    command_spec::{CommandSpec, command_exists, expand_home},
    error::{Error, Result},
    process::{ProcessOutput, ProcessRequest, ProcessRunner, TokioProcessRunner},
    transport::{Platform, Transport, TransportInputs, select_transport},
};

const BACKEND_PROBE_TIMEOUT: Duration = Duration::from_secs(12);
const LIMA_START_TIMEOUT: Duration = Duration::from_secs(90);
const LIMA_WARMUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Waits used while a freshly started Lima instance brings up sshd.
#[derive(Debug, Clone)]
pub struct ProbeTiming {
    pub initial_wait: Duration,
    pub settle: Duration,
    pub retry_delays: Vec<Duration>,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(12),
            settle: Duration::from_secs(2),
            retry_delays: [5, 8, 10, 12].map(Duration::from_secs).to_vec(),
        }
    }
}

/// Program and arguments for one backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Readiness report printed by `microvmctl probe`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub transport: Transport,
    pub platform: String,
    pub arch: String,
    pub backend: String,
    pub backend_found: bool,
    pub backend_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_probe_error: Option<String>,
    pub lima_auto_start_attempted: bool,
    pub hyperv_backend_found: bool,
    pub ssh_host_configured: bool,
    #[serde(rename = "remoteCLI")]
    pub remote_cli: String,
}

/// Report plus the reason the selected transport cannot serve requests.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub report: ProbeReport,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LimaStart {
    attempted: bool,
    ok: bool,
    error: Option<String>,
}

pub struct MicrovmController {
    backend: CommandSpec,
    hyperv: CommandSpec,
    remote: CommandSpec,
    ssh_cli: CommandSpec,
    ssh: SshConfig,
    transport: Transport,
    platform: Platform,
    runner: Arc<dyn ProcessRunner>,
    timing: ProbeTiming,
}

impl MicrovmController {
    /// Resolve command specs and select a transport from configuration.
    pub fn from_config(config: &MicrovmConfig) -> Result<Self> {
        let platform = Platform::current();
        let backend = CommandSpec::resolve(
            "LOCAL_MICROVM_BACKEND_CLI",
            config.backend_cli.as_deref(),
            platform.default_backend_spec(),
        )?;
        let hyperv = CommandSpec::resolve(
            "LOCAL_MICROVM_HYPERV_CLI",
            config.hyperv_cli.as_deref(),
            "hyperv-microvmctl",
        )?;
        let remote = CommandSpec::resolve(
            "LOCAL_MICROVM_REMOTE_CLI",
            config.remote_cli.as_deref(),
            "microvmctl",
        )?;
        let ssh_cli =
            CommandSpec::resolve("LOCAL_MICROVM_SSH_CLI", config.ssh_cli.as_deref(), "ssh")?;

        let transport = select_transport(TransportInputs {
            explicit: config.transport.as_deref(),
            platform,
            ssh_host_configured: config.ssh.configured_host().is_some(),
            backend_exists: command_exists(&backend.binary),
            hyperv_exists: command_exists(&hyperv.binary),
        });
        debug!(%transport, backend = %backend.display, "microvm controller configured");

        Ok(Self {
            backend,
            hyperv,
            remote,
            ssh_cli,
            ssh: config.ssh.clone(),
            transport,
            platform,
            runner: Arc::new(TokioProcessRunner),
            timing: ProbeTiming::default(),
        })
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_probe_timing(mut self, timing: ProbeTiming) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    #[must_use]
    pub fn backend(&self) -> &CommandSpec {
        &self.backend
    }

    /// Display string of the command driving the selected transport.
    #[must_use]
    pub fn display(&self) -> &str {
        match self.transport {
            Transport::Local => &self.backend.display,
            Transport::Hyperv => &self.hyperv.display,
            Transport::Ssh => &self.ssh_cli.display,
        }
    }

    /// Build the process invocation for `args` on the selected transport.
    pub fn invocation(&self, args: &[String]) -> Result<Invocation> {
        match self.transport {
            Transport::Local => Ok(spec_invocation(&self.backend, args)),
            Transport::Hyperv => Ok(spec_invocation(&self.hyperv, args)),
            Transport::Ssh => self.ssh_invocation(args),
        }
    }

    fn ssh_invocation(&self, args: &[String]) -> Result<Invocation> {
        let host = self.ssh.configured_host().ok_or(Error::MissingSshHost)?;
        let trimmed = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mut ssh_args = self.ssh_cli.args.clone();
        if let Some(port) = trimmed(&self.ssh.port) {
            ssh_args.extend(["-p".into(), port]);
        }
        if let Some(key) = trimmed(&self.ssh.key_path) {
            ssh_args.extend(["-i".into(), expand_home(&key)]);
        }
        if !self.ssh.strict_host_key_checking {
            ssh_args.extend(
                [
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                ]
                .map(String::from),
            );
        }
        ssh_args.extend(["-o".into(), "BatchMode=yes".into()]);
        ssh_args.push(match trimmed(&self.ssh.user) {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        });

        let remote_command = self
            .remote
            .args
            .iter()
            .chain(args)
            .map(|value| sh_quote(value))
            .collect::<Vec<_>>()
            .join(" ");
        ssh_args.push(format!("{} {remote_command}", sh_quote(&self.remote.binary)));

        Ok(Invocation {
            program: self.ssh_cli.binary.clone(),
            args: ssh_args,
        })
    }

    /// Run a subcommand with captured output, bounded by `timeout`.
    pub async fn run(
        &self,
        args: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ProcessOutput> {
        let invocation = self.invocation(args)?;
        self.ensure_lima_started().await;

        let mut request = ProcessRequest::new(invocation.program, invocation.args, timeout);
        request.stdin = stdin;
        self.runner.run(request).await
    }

    /// Run a subcommand with inherited stdio. Returns the child's exit status,
    /// 1 when it was terminated by a signal.
    pub async fn passthrough(&self, args: &[String]) -> Result<i32> {
        let invocation = self.invocation(args)?;
        self.ensure_lima_started().await;

        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code().unwrap_or(1))
    }

    async fn ensure_lima_started(&self) {
        if self.transport != Transport::Local {
            return;
        }
        let start = self.try_start_lima().await;
        if start.attempted && !start.ok {
            warn!(
                error = start.error.as_deref().unwrap_or_default(),
                "failed to auto-start Lima instance, continuing"
            );
        }
    }

    async fn try_start_lima(&self) -> LimaStart {
        let Some(instance) = lima_instance(&self.backend) else {
            return LimaStart::default();
        };
        let request = ProcessRequest::new(
            self.backend.binary.clone(),
            vec!["start".into(), instance.to_string()],
            LIMA_START_TIMEOUT,
        );
        match self.runner.run(request).await {
            Ok(out) if out.success() => LimaStart {
                attempted: true,
                ok: true,
                error: None,
            },
            Ok(out) => {
                let text = format!("{}\n{}", out.stderr, out.stdout).trim().to_string();
                LimaStart {
                    attempted: true,
                    ok: false,
                    error: Some(if text.is_empty() {
                        format!("limactl start {instance} failed")
                    } else {
                        text
                    }),
                }
            },
            Err(e) => LimaStart {
                attempted: true,
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    async fn probe_backend(&self) -> ProcessOutput {
        let mut args = self.backend.args.clone();
        args.push("probe".into());
        let request = ProcessRequest::new(self.backend.binary.clone(), args, BACKEND_PROBE_TIMEOUT);
        self.runner
            .run(request)
            .await
            .unwrap_or_else(|e| ProcessOutput {
                exit_code: 1,
                stderr: e.to_string(),
                ..Default::default()
            })
    }

    /// Check whether the selected transport can serve requests.
    pub async fn probe(&self) -> ProbeOutcome {
        let backend_found = command_exists(&self.backend.binary);
        let mut backend_ready = None;
        let mut backend_probe_error = None;
        let mut lima_auto_start_attempted = false;

        if self.transport == Transport::Local && backend_found {
            let mut attempt = self.probe_backend().await;
            let mut ready = attempt.success();

            if !ready && is_lima_handshake_error(&probe_error_text(&attempt)) {
                let start = self.try_start_lima().await;
                lima_auto_start_attempted = start.attempted;

                if start.ok {
                    info!(
                        wait_secs = self.timing.initial_wait.as_secs(),
                        "Lima instance started, waiting for ssh"
                    );
                    tokio::time::sleep(self.timing.initial_wait).await;
                    self.warm_up_lima().await;

                    attempt = self.probe_backend().await;
                    ready = attempt.success();

                    for delay in &self.timing.retry_delays {
                        if ready {
                            break;
                        }
                        info!(delay_secs = delay.as_secs(), "retrying backend probe");
                        tokio::time::sleep(*delay).await;
                        attempt = self.probe_backend().await;
                        ready = attempt.success();
                        let retry_error = attempt.stderr.trim();
                        if !ready && !retry_error.is_empty() && !is_lima_handshake_error(retry_error)
                        {
                            break;
                        }
                    }
                }
            }

            backend_ready = Some(ready);
            if !ready {
                backend_probe_error = Some(probe_error_text(&attempt));
            }
        }

        let report = ProbeReport {
            transport: self.transport,
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            backend: self.backend.display.clone(),
            backend_found,
            backend_ready,
            backend_probe_error,
            lima_auto_start_attempted,
            hyperv_backend_found: command_exists(&self.hyperv.binary),
            ssh_host_configured: self.ssh.configured_host().is_some(),
            remote_cli: self.remote.display.clone(),
        };
        let failure = self.probe_failure(&report);
        if let Some(reason) = &failure {
            debug!(reason, "probe failed");
        }
        ProbeOutcome { report, failure }
    }

    fn probe_failure(&self, report: &ProbeReport) -> Option<String> {
        match self.transport {
            Transport::Ssh if !report.ssh_host_configured => Some(
                "Probe failed: ssh transport selected but LOCAL_MICROVM_SSH_HOST is not set."
                    .into(),
            ),
            Transport::Local if !report.backend_found => Some(format!(
                "Probe failed: local backend command \"{}\" not found in PATH.",
                self.backend.binary
            )),
            Transport::Local if report.backend_ready == Some(false) => Some(format!(
                "Probe failed: local backend command is installed but not ready ({}).",
                report.backend_probe_error.as_deref().unwrap_or_default()
            )),
            Transport::Hyperv if !report.hyperv_backend_found => Some(format!(
                "Probe failed: hyperv backend command \"{}\" not found in PATH.",
                self.hyperv.binary
            )),
            _ => None,
        }
    }

    /// The first connection to a cold VM often fails; run a no-op first.
    async fn warm_up_lima(&self) {
        if lima_instance(&self.backend).is_none() {
            return;
        }
        let mut args: Vec<String> = self.backend.args.iter().take(3).cloned().collect();
        args.push("true".into());
        let request = ProcessRequest::new(self.backend.binary.clone(), args, LIMA_WARMUP_TIMEOUT);
        if let Err(e) = self.runner.run(request).await {
            debug!(error = %e, "lima warm-up failed");
        }
        tokio::time::sleep(self.timing.settle).await;
    }
}

fn spec_invocation(spec: &CommandSpec, args: &[String]) -> Invocation {
    Invocation {
        program: spec.binary.clone(),
        args: spec.args.iter().chain(args).cloned().collect(),
    }
}

fn probe_error_text(output: &ProcessOutput) -> String {
    let text = output.diagnostic();
    if text.is_empty() {
        "backend probe command failed".into()
    } else {
        text.to_string()
    }
}

/// Lima instance name when the spec is `limactl shell <instance> ...`.
fn lima_instance(spec: &CommandSpec) -> Option<&str> {
    if spec.binary_name() != "limactl" {
        return None;
    }
    match spec.args.as_slice() {
        [shell, instance, ..] if shell == "shell" && !instance.starts_with('-') => {
            Some(instance.as_str())
        },
        _ => None,
    }
}

fn is_lima_handshake_error(text: &str) -> bool {
    static PATTERN: std::sync::LazyLock<Option<Regex>> = std::sync::LazyLock::new(|| {
        Regex::new(
            r"(?i)kex_exchange_identification|connection reset by peer|broken pipe|bad port '0'|failed to connect|is stopped|no such file or directory",
        )
        .ok()
    });
    !text.is_empty() && PATTERN.as_ref().is_some_and(|re| re.is_match(text))
}

/// Quote a value for a POSIX shell.
#[must_use]
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

// ── Idle auto-stop ──────────────────────────────────────────────────────────

/// Stops the Lima worker after a period without heartbeats.
pub struct IdleAutoStop {
    enabled: bool,
    idle: Duration,
    stop_program: String,
    instance: String,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl IdleAutoStop {
    #[must_use]
    pub fn from_config(config: &MicrovmConfig) -> Self {
        Self {
            enabled: config.auto_stop_on_idle,
            idle: Duration::from_secs(config.auto_stop_idle_secs),
            stop_program: "limactl".into(),
            instance: config.lima_instance.clone(),
            timer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_stop_program(mut self, program: impl Into<String>) -> Self {
        self.stop_program = program.into();
        self
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Re-arm the idle timer. Returns whether auto-stop is active.
    pub async fn heartbeat(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let idle = self.idle;
        let program = self.stop_program.clone();
        let instance = self.instance.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            info!(instance, "idle timeout reached, stopping Lima instance");
            let spawned = Command::new(&program)
                .args(["stop", &instance])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            if let Err(e) = spawned {
                warn!(error = %e, program, "failed to stop idle instance");
            }
        }));
        true
    }

    /// Whether a stop is currently scheduled.
    pub async fn pending(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for IdleAutoStop {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}
