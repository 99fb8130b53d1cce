//! Handshake and tool calls against a single MCP server.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    serde_json::Value,
    tracing::{debug, info},
};

use crate::{
    config::McpServerConfig,
    traits::{McpConnector, McpSession, McpTransport},
    transport::{DEFAULT_REQUEST_TIMEOUT, StdioTransport},
    types::{
        ClientInfo, InitializeParams, InitializeResult, McpToolDef, PROTOCOL_VERSION,
        ToolsCallParams, ToolsCallResult, ToolsListResult,
    },
};

pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    tools: Vec<McpToolDef>,
}

impl McpClient {
    /// Spawn the server and run `initialize` plus `notifications/initialized`.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let request_timeout = Duration::from_millis(config.call_timeout_ms.max(1))
            .max(DEFAULT_REQUEST_TIMEOUT);
        let transport = StdioTransport::spawn(
            &config.id,
            &config.command,
            &config.args,
            &config.env,
            request_timeout,
        )
        .await?;
        Self::handshake(&config.id, transport).await
    }

    /// Initialize over an already-open transport.
    pub async fn handshake(server_id: &str, transport: Arc<dyn McpTransport>) -> Result<Self> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            capabilities: Value::Object(Default::default()),
            client_info: ClientInfo {
                name: "crucible",
                version: env!("CARGO_PKG_VERSION"),
            },
        };
        let resp = match transport
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                transport.close().await;
                return Err(e.context(format!("MCP initialize failed for {server_id}")));
            },
        };
        let result: InitializeResult =
            serde_json::from_value(resp.result.context("MCP initialize returned no result")?)
                .context("malformed MCP initialize result")?;
        info!(
            server = server_id,
            protocol = %result.protocol_version,
            server_name = result.server_info.as_ref().map_or("", |s| s.name.as_str()),
            "MCP server initialized"
        );

        transport.notify("notifications/initialized", None).await?;
        Ok(Self {
            server_id: server_id.to_string(),
            transport,
            tools: Vec::new(),
        })
    }

    pub async fn list_tools(&mut self) -> Result<&[McpToolDef]> {
        let resp = self.transport.request("tools/list", None).await?;
        let result: ToolsListResult =
            serde_json::from_value(resp.result.context("tools/list returned no result")?)?;
        debug!(server = %self.server_id, count = result.tools.len(), "listed MCP tools");
        self.tools = result.tools;
        Ok(&self.tools)
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[async_trait]
impl McpSession for McpClient {
    fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        let params = serde_json::to_value(ToolsCallParams { name, arguments })?;
        let resp = self.transport.request("tools/call", Some(params)).await?;
        let Some(result) = resp.result else {
            bail!("tools/call returned no result");
        };
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}

/// Connects to servers as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConnector;

#[async_trait]
impl McpConnector for StdioConnector {
    async fn connect(&self, config: &McpServerConfig) -> Result<Box<dyn McpSession>> {
        let mut client = McpClient::connect(config).await?;
        if let Err(e) = client.list_tools().await {
            client.close().await;
            return Err(e.context(format!("listing tools of {} failed", config.id)));
        }
        Ok(Box::new(client))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn connects_lists_and_calls_over_stdio() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-mcp.sh");
        std::fs::write(
            &script,
            r#"read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake"}}}'
read line
read line
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"now","description":"Current time","inputSchema":{"type":"object"}}]}}'
read line
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"12:00 UTC"}]}}'
cat >/dev/null
"#,
        )
        .unwrap();

        let config = McpServerConfig::new(
            "test/fake",
            "Fake",
            "sh",
            vec![script.display().to_string()],
        );
        let session = StdioConnector.connect(&config).await.unwrap();
        assert_eq!(session.tools().len(), 1);
        assert_eq!(session.tools()[0].name, "now");

        let result = session
            .call_tool("now", serde_json::json!({"tz": "UTC"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "12:00 UTC");
        assert!(!result.is_error);
        session.close().await;
    }

    #[tokio::test]
    async fn missing_command_fails_to_connect() {
        let config = McpServerConfig::new("test/none", "None", "crucible_no_such_mcp_42", vec![]);
        assert!(StdioConnector.connect(&config).await.is_err());
    }
}
