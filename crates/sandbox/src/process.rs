//! Bounded subprocess execution shared by the controller, prober and providers.

use std::{process::Stdio, time::Duration};

use {
    async_trait::async_trait,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        process::Command,
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::error::Result;

/// Grace period for draining pipes after a timed-out child was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(1);

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ProcessRequest {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: None,
            timeout,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Captured result of a finished (or killed) subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stderr when non-empty, otherwise stdout. Used for failure messages.
    #[must_use]
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Runs a program to completion within a time bound.
///
/// Spawn failures are errors. A timeout is not: the child is killed and the
/// output is returned with `timed_out` set, exit code 1 and
/// `"\nProcess timed out"` appended to stderr.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: ProcessRequest) -> Result<ProcessOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, request: ProcessRequest) -> Result<ProcessOutput> {
        debug!(
            program = %request.program,
            args = ?request.args,
            timeout_ms = request.timeout.as_millis() as u64,
            "spawning process"
        );

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let (Some(bytes), Some(mut stdin)) = (request.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "failed to write child stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_task = child.stdout.take().map(drain);
        let stderr_task = child.stderr.take().map(drain);

        let (status, timed_out) =
            match tokio::time::timeout(request.timeout, child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    warn!(
                        program = %request.program,
                        timeout_ms = request.timeout.as_millis() as u64,
                        "process timed out, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill timed-out process");
                    }
                    (None, true)
                },
            };

        let stdout = collect(stdout_task, timed_out).await;
        let mut stderr = collect(stderr_task, timed_out).await;

        let exit_code = match status {
            Some(status) => status.code().unwrap_or(1),
            None => {
                stderr.push_str("\nProcess timed out");
                1
            },
        };

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>, after_kill: bool) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    let bytes = if after_kill {
        // Grandchildren may keep the pipe open after the kill.
        match tokio::time::timeout(DRAIN_AFTER_KILL, &mut task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                task.abort();
                Vec::new()
            },
        }
    } else {
        task.await.unwrap_or_default()
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessRequest {
        ProcessRequest::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_stderr_and_code() {
        let out = TokioProcessRunner
            .run(sh("echo out; echo err >&2; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert!(!out.success());
        assert_eq!(out.diagnostic(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_stdin() {
        let out = TokioProcessRunner
            .run(sh("cat", Duration::from_secs(5)).with_stdin(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert!(out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_marks_output() {
        let started = std::time::Instant::now();
        let out = TokioProcessRunner
            .run(sh("echo partial; exec sleep 10", Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.ends_with("\nProcess timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let result = TokioProcessRunner
            .run(ProcessRequest::new(
                "/definitely/not/a/binary",
                Vec::new(),
                Duration::from_secs(1),
            ))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn diagnostic_falls_back_to_stdout() {
        let out = ProcessOutput {
            exit_code: 2,
            stdout: " only stdout \n".into(),
            stderr: "  ".into(),
            timed_out: false,
        };
        assert_eq!(out.diagnostic(), "only stdout");
    }
}
