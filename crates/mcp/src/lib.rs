//! Dynamic MCP (Model Context Protocol) tool servers.
//!
//! - JSON-RPC 2.0 over a child process's stdio (`transport`)
//! - Handshake and tool calls against one server (`client`)
//! - Curated servers and connection defaults (`config`)
//! - Public registry search for extra servers (`registry`)
//! - Query-driven discovery, namespacing and call routing (`manager`)

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod traits;
pub mod transport;
pub mod types;

pub use {
    client::{McpClient, StdioConnector},
    config::{McpServerConfig, VerifiedServer, verified_servers},
    error::{Error, Result},
    manager::{AnthropicTool, ConnectionStatus, McpCallResult, McpManager, ServerStatus},
    registry::{RegistryClient, extract_keywords},
    traits::{McpConnector, McpSession, McpTransport},
};
