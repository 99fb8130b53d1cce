//! Local microVM provider driven through the controller facade.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD},
    tracing::{debug, info},
};

use crate::{
    controller::MicrovmController,
    error::{Context, Error, Result},
    process::ProcessOutput,
    provider::{
        CommandOutput, FileEntry, ProviderKind, SandboxCreateInput, SandboxRuntime,
        parse_file_listing,
    },
};

const CREATE_TIMEOUT: Duration = Duration::from_secs(20);
const FILE_IO_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(15);
const KILL_TIMEOUT: Duration = Duration::from_secs(10);
/// Headroom over the in-VM timeout so the backend can report it first.
const EXEC_GRACE_MS: u64 = 2_000;

pub struct LocalMicrovmSandbox {
    controller: Arc<MicrovmController>,
    vm_id: String,
}

impl LocalMicrovmSandbox {
    /// Provision a new microVM for `input.user_id`.
    pub async fn create(
        controller: Arc<MicrovmController>,
        input: &SandboxCreateInput,
    ) -> Result<Self> {
        let vm_id = new_vm_id(&input.user_id);
        let args = to_args(&[
            "create",
            "--id",
            &vm_id,
            "--ttl-ms",
            &input.timeout_ms.to_string(),
        ]);

        let out = match controller.run(&args, None, CREATE_TIMEOUT).await {
            Ok(out) => out,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::message(format!(
                    "local_microvm provider unavailable: command \"{}\" not found. Install/configure LOCAL_MICROVM_BACKEND_CLI (macOS: limactl shell crucible-worker -- microvmctl) or use SSH transport.",
                    controller.display()
                )));
            },
            Err(e) => return Err(e),
        };

        if !out.success() {
            let detail = out.diagnostic();
            let suffix = if detail.is_empty() {
                String::new()
            } else {
                format!(" ({detail})")
            };
            return Err(Error::message(format!(
                "local_microvm provider unavailable via \"{}\". Configure a local backend controller (for macOS use LOCAL_MICROVM_BACKEND_CLI=\"limactl shell crucible-worker -- microvmctl\") or use SSH transport{suffix}",
                controller.display()
            )));
        }

        info!(vm_id = vm_id.as_str(), transport = %controller.transport(), "local microvm created");
        Ok(Self { controller, vm_id })
    }

    #[must_use]
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    async fn checked(
        &self,
        op: &'static str,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ProcessOutput> {
        let out = self.controller.run(&args, stdin, timeout).await?;
        if out.exit_code != 0 {
            let detail = if out.stderr.is_empty() {
                out.stdout.clone()
            } else {
                out.stderr.clone()
            };
            return Err(Error::Provider {
                provider: "local_microvm",
                op,
                code: out.exit_code,
                detail,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SandboxRuntime for LocalMicrovmSandbox {
    fn provider(&self) -> ProviderKind {
        ProviderKind::LocalMicrovm
    }

    async fn run_command(&self, command: &str, timeout_ms: u64) -> Result<CommandOutput> {
        let args = to_args(&[
            "exec",
            "--id",
            &self.vm_id,
            "--timeout-ms",
            &timeout_ms.to_string(),
            "--",
            "sh",
            "-lc",
            command,
        ]);
        let out = self
            .controller
            .run(
                &args,
                None,
                Duration::from_millis(timeout_ms.saturating_add(EXEC_GRACE_MS)),
            )
            .await?;
        Ok(CommandOutput {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let args = to_args(&["write", "--id", &self.vm_id, "--path", path]);
        self.checked("write", args, Some(content.to_vec()), FILE_IO_TIMEOUT)
            .await?;
        debug!(vm_id = %self.vm_id, path, bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let args = to_args(&["read", "--id", &self.vm_id, "--path", path, "--base64"]);
        let out = self.checked("read", args, None, FILE_IO_TIMEOUT).await?;
        let encoded = out.stdout.trim();
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD
            .decode(encoded)
            .context("local_microvm read returned invalid base64")
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        let args = to_args(&["list", "--id", &self.vm_id, "--path", path, "--json"]);
        let out = self.checked("list", args, None, LIST_TIMEOUT).await?;
        parse_file_listing(&out.stdout, path)
    }

    async fn kill(&self) -> Result<()> {
        let args = to_args(&["kill", "--id", &self.vm_id]);
        self.controller.run(&args, None, KILL_TIMEOUT).await?;
        info!(vm_id = %self.vm_id, "local microvm killed");
        Ok(())
    }
}

/// Reclaim orphaned microVM state left by earlier processes.
pub async fn collect_garbage(controller: &MicrovmController) -> Result<()> {
    let out = controller
        .run(&to_args(&["gc"]), None, Duration::from_secs(30))
        .await?;
    if !out.success() {
        debug!(detail = out.diagnostic(), "microvm gc reported failure");
    }
    Ok(())
}

/// `crucible-{user prefix}-{random}`, both parts eight characters at most.
fn new_vm_id(user_id: &str) -> String {
    let user: String = user_id.chars().take(8).collect();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("crucible-{user}-{}", &random[..8])
}

fn to_args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            process::{ProcessRequest, ProcessRunner},
            transport::Transport,
        },
        crucible_config::MicrovmConfig,
        std::sync::Mutex,
    };

    struct FakeRunner {
        outputs: Mutex<Vec<ProcessOutput>>,
        requests: Mutex<Vec<ProcessRequest>>,
    }

    #[async_trait]
    impl ProcessRunner for FakeRunner {
        async fn run(&self, request: ProcessRequest) -> Result<ProcessOutput> {
            self.requests.lock().unwrap().push(request);
            let mut outputs = self.outputs.lock().unwrap();
            Ok(if outputs.is_empty() {
                ProcessOutput::default()
            } else {
                outputs.remove(0)
            })
        }
    }

    fn controller(outputs: Vec<ProcessOutput>) -> (Arc<MicrovmController>, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner {
            outputs: Mutex::new(outputs),
            requests: Mutex::new(Vec::new()),
        });
        let cfg = MicrovmConfig {
            backend_cli: Some("microvmctl".into()),
            ..Default::default()
        };
        let controller = MicrovmController::from_config(&cfg)
            .unwrap()
            .with_transport(Transport::Local)
            .with_runner(runner.clone());
        (Arc::new(controller), runner)
    }

    fn input() -> SandboxCreateInput {
        SandboxCreateInput {
            user_id: "0123456789abcdef".into(),
            timeout_ms: 600_000,
        }
    }

    fn stdout(s: &str) -> ProcessOutput {
        ProcessOutput {
            stdout: s.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_issues_create_command() {
        let (ctl, runner) = controller(vec![ProcessOutput::default()]);
        let sandbox = LocalMicrovmSandbox::create(ctl, &input()).await.unwrap();

        assert!(sandbox.vm_id().starts_with("crucible-01234567-"));
        assert_eq!(sandbox.vm_id().len(), "crucible-01234567-".len() + 8);

        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests[0].program, "microvmctl");
        assert_eq!(
            requests[0].args,
            to_args(&["create", "--id", sandbox.vm_id(), "--ttl-ms", "600000"])
        );
        assert_eq!(requests[0].timeout, CREATE_TIMEOUT);
    }

    #[tokio::test]
    async fn create_failure_mentions_controller() {
        let (ctl, _) = controller(vec![ProcessOutput {
            exit_code: 2,
            stderr: "no kvm".into(),
            ..Default::default()
        }]);
        let err = LocalMicrovmSandbox::create(ctl, &input())
            .await
            .err()
            .unwrap()
            .to_string();
        assert!(err.starts_with("local_microvm provider unavailable via \"microvmctl\""));
        assert!(err.ends_with("or use SSH transport (no kvm)"));
    }

    #[tokio::test]
    async fn exec_wraps_in_login_shell_with_grace() {
        let (ctl, runner) = controller(vec![
            ProcessOutput::default(),
            ProcessOutput {
                exit_code: 3,
                stdout: "out".into(),
                stderr: "err".into(),
                timed_out: false,
            },
        ]);
        let sandbox = LocalMicrovmSandbox::create(ctl, &input()).await.unwrap();
        let out = sandbox.run_command("echo hi && exit 3", 5_000).await.unwrap();
        assert_eq!(
            out,
            CommandOutput {
                exit_code: 3,
                stdout: "out".into(),
                stderr: "err".into(),
            }
        );

        let requests = runner.requests.lock().unwrap();
        assert_eq!(
            requests[1].args,
            to_args(&[
                "exec",
                "--id",
                sandbox.vm_id(),
                "--timeout-ms",
                "5000",
                "--",
                "sh",
                "-lc",
                "echo hi && exit 3"
            ])
        );
        assert_eq!(requests[1].timeout, Duration::from_millis(7_000));
    }

    #[tokio::test]
    async fn write_sends_bytes_on_stdin() {
        let (ctl, runner) = controller(vec![ProcessOutput::default(), ProcessOutput::default()]);
        let sandbox = LocalMicrovmSandbox::create(ctl, &input()).await.unwrap();
        sandbox.write_file("/home/user/a.csv", b"x,y\n1,2\n").await.unwrap();
        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests[1].stdin.as_deref(), Some(&b"x,y\n1,2\n"[..]));
    }

    #[tokio::test]
    async fn read_decodes_base64() {
        let (ctl, _) = controller(vec![ProcessOutput::default(), stdout("aGVsbG8=\n")]);
        let sandbox = LocalMicrovmSandbox::create(ctl, &input()).await.unwrap();
        assert_eq!(sandbox.read_text("/home/user/x").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn read_failure_uses_provider_error() {
        let (ctl, _) = controller(vec![
            ProcessOutput::default(),
            ProcessOutput {
                exit_code: 1,
                stdout: "missing file".into(),
                ..Default::default()
            },
        ]);
        let sandbox = LocalMicrovmSandbox::create(ctl, &input()).await.unwrap();
        let err = sandbox.read_file("/nope").await.unwrap_err();
        assert_eq!(err.to_string(), "local_microvm read failed (1): missing file");
    }
}
