//! JSON-RPC over the stdin/stdout of a spawned MCP server.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    serde_json::Value,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, ChildStdout, Command},
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, trace, warn},
};

use crate::{
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// Upper bound for a single request when the caller sets none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    server_id: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn `command` with the parent environment plus `env`. The child is
    /// killed when the transport is dropped.
    pub async fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        debug!(server = server_id, command, ?args, "spawning MCP server");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn MCP server {server_id}: {command}"))?;

        let stdin = child.stdin.take().context("MCP server stdin unavailable")?;
        let stdout = child.stdout.take().context("MCP server stdout unavailable")?;

        if let Some(stderr) = child.stderr.take() {
            let server = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(server = %server, stderr = %line.trim(), "MCP server stderr");
                    }
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(
            server_id.to_string(),
            stdout,
            Arc::clone(&pending),
        ));

        Ok(Arc::new(Self {
            server_id: server_id.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader: Mutex::new(Some(reader)),
        }))
    }

    async fn write_line(&self, payload: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Route each response line to its waiter. When stdout closes, pending
/// waiters are dropped so their requests fail immediately.
async fn read_responses(server_id: String, stdout: ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!(server = %server_id, raw = %line, "MCP server -> client");
                let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(line) else {
                    trace!(server = %server_id, "skipping non-response line");
                    continue;
                };
                let Some(id) = resp.id.as_u64() else {
                    continue;
                };
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(resp);
                } else {
                    warn!(server = %server_id, id, "response for unknown request id");
                }
            },
            Ok(None) => {
                debug!(server = %server_id, "MCP server stdout closed");
                break;
            },
            Err(e) => {
                warn!(server = %server_id, error = %e, "failed reading MCP server stdout");
                break;
            },
        }
    }
    pending.lock().await.clear();
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(server = %self.server_id, method, id, "client -> MCP server");
        if let Err(e) = self.write_line(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e.context(format!("failed to send '{method}'")));
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => bail!("MCP server exited before answering '{method}'"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!(
                    "MCP request '{method}' timed out after {}ms",
                    self.request_timeout.as_millis()
                );
            },
        };

        if let Some(err) = &resp.error {
            bail!("MCP error on '{method}': {} ({})", err.message, err.code);
        }
        Ok(resp)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let payload = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        trace!(server = %self.server_id, method, "client -> MCP server (notification)");
        self.write_line(payload).await
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(server = %self.server_id, error = %e, "MCP server already stopped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_names_server() {
        let err = StdioTransport::spawn(
            "verified/none",
            "crucible_no_such_command_42",
            &[],
            &HashMap::new(),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("verified/none"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_fails_fast_when_server_exits() {
        let transport = StdioTransport::spawn(
            "exits",
            "sh",
            &["-c".into(), "read line; exit 0".into()],
            &HashMap::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        let started = std::time::Instant::now();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(err.to_string().contains("exited"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn json_rpc_error_is_an_error() {
        let transport = StdioTransport::spawn(
            "errs",
            "sh",
            &[
                "-c".into(),
                r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}'; cat >/dev/null"#.into(),
            ],
            &HashMap::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert_eq!(err.to_string(), "MCP error on 'tools/list': nope (-32601)");
        transport.close().await;
    }
}
