//! Seams between the manager and the processes it talks to.

use {anyhow::Result, async_trait::async_trait, serde_json::Value};

use crate::{
    config::McpServerConfig,
    types::{JsonRpcResponse, McpToolDef, ToolsCallResult},
};

/// JSON-RPC channel to one server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response. JSON-RPC errors are `Err`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Stop the server. Never fails.
    async fn close(&self);
}

/// An initialized server whose tools have been listed.
#[async_trait]
pub trait McpSession: Send + Sync {
    fn tools(&self) -> &[McpToolDef];

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult>;

    async fn close(&self);
}

/// Opens sessions. Dropping an unfinished `connect` future must release the server.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, config: &McpServerConfig) -> Result<Box<dyn McpSession>>;
}
