//! Query-driven discovery of MCP servers and routing of namespaced tool calls.
//!
//! Connections are shared by every caller of one manager. Servers that fail
//! to connect stay in the table as `failed` and are not retried.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use {
    crucible_common::{text::truncate_with_marker, time::now_ms},
    crucible_config::McpConfig,
    regex::Regex,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    config::{McpServerConfig, VerifiedServer, verified_servers},
    error::{Error, Result},
    registry::RegistryClient,
    traits::{McpConnector, McpSession},
};

/// Tool definition in the shape the Anthropic Messages API expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    pub success: bool,
    pub output: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub id: String,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PrefixedTool {
    prefixed_name: String,
    original_name: String,
    description: String,
    input_schema: Value,
}

struct Connection {
    config: McpServerConfig,
    session: Option<Arc<dyn McpSession>>,
    tools: Vec<PrefixedTool>,
    status: ConnectionStatus,
    error: Option<String>,
    connected_at_ms: u64,
}

struct Route {
    server_id: String,
    original_name: String,
}

#[derive(Default)]
struct State {
    connections: Vec<Connection>,
    tool_index: HashMap<String, Route>,
    used_short_ids: HashMap<String, u32>,
}

impl State {
    fn contains(&self, id: &str) -> bool {
        self.connections.iter().any(|c| c.config.id == id)
    }

    fn connected_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .count()
    }

    fn next_short_id(&mut self, server_id: &str) -> String {
        let base = derive_short_id(server_id);
        let count = self.used_short_ids.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            format!("{base}{count}")
        } else {
            base
        }
    }

    fn rebuild_tool_index(&mut self) {
        self.tool_index.clear();
        for conn in &self.connections {
            if conn.status != ConnectionStatus::Connected {
                continue;
            }
            for tool in &conn.tools {
                self.tool_index.insert(tool.prefixed_name.clone(), Route {
                    server_id: conn.config.id.clone(),
                    original_name: tool.original_name.clone(),
                });
            }
        }
    }
}

pub struct McpManager {
    enabled: bool,
    dynamic_discovery: bool,
    max_connected: usize,
    discovery_timeout: Duration,
    verified: Vec<VerifiedServer>,
    connector: Arc<dyn McpConnector>,
    registry: Option<RegistryClient>,
    state: RwLock<State>,
}

impl McpManager {
    pub fn new(
        config: &McpConfig,
        connector: Arc<dyn McpConnector>,
        registry: Option<RegistryClient>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            dynamic_discovery: config.dynamic_discovery,
            max_connected: config.max_connected_servers,
            discovery_timeout: Duration::from_millis(config.discovery_timeout_ms),
            verified: verified_servers(),
            connector,
            registry,
            state: RwLock::new(State::default()),
        }
    }

    /// Replace the curated server table.
    #[must_use]
    pub fn with_verified(mut self, verified: Vec<VerifiedServer>) -> Self {
        self.verified = verified;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Connect servers relevant to `query`. Never fails; broken servers are
    /// recorded as `failed`.
    pub async fn discover_for_query(&self, query: &str) {
        if !self.enabled {
            return;
        }
        let connected = self.state.read().await.connected_count();
        if connected >= self.max_connected {
            info!(connected, "MCP connection limit reached, skipping discovery");
            return;
        }

        let mut to_connect = self.match_verified(query).await;
        if to_connect.is_empty() && self.dynamic_discovery {
            to_connect = self.discover_dynamic(query).await;
        }
        if to_connect.is_empty() {
            return;
        }
        to_connect.truncate(self.max_connected - connected);

        {
            let mut state = self.state.write().await;
            for config in &to_connect {
                state.connections.push(Connection {
                    config: config.clone(),
                    session: None,
                    tools: Vec::new(),
                    status: ConnectionStatus::Connecting,
                    error: None,
                    connected_at_ms: now_ms(),
                });
            }
        }

        let attempts = futures::future::join_all(
            to_connect.iter().map(|config| self.connect_with_timeout(config)),
        )
        .await;

        let mut state = self.state.write().await;
        for (config, attempt) in to_connect.iter().zip(attempts) {
            let attempt = attempt.map(|session| (session, state.next_short_id(&config.id)));
            let Some(conn) = state
                .connections
                .iter_mut()
                .find(|c| c.config.id == config.id)
            else {
                continue;
            };
            match attempt {
                Ok((session, short_id)) => {
                    conn.tools = session
                        .tools()
                        .iter()
                        .map(|t| PrefixedTool {
                            prefixed_name: format!("{short_id}_{}", t.name),
                            original_name: t.name.clone(),
                            description: t.description.clone().unwrap_or_default(),
                            input_schema: t.input_schema.clone(),
                        })
                        .collect();
                    conn.session = Some(Arc::from(session));
                    conn.status = ConnectionStatus::Connected;
                    let names: Vec<_> =
                        conn.tools.iter().map(|t| t.prefixed_name.as_str()).collect();
                    info!(server = %config.display_name, tools = ?names, "connected MCP server");
                },
                Err(e) => {
                    warn!(server = %config.display_name, error = %e, "failed to connect MCP server");
                    conn.status = ConnectionStatus::Failed;
                    conn.error = Some(e);
                },
            }
        }
        state.rebuild_tool_index();
    }

    async fn match_verified(&self, query: &str) -> Vec<McpServerConfig> {
        let query_lower = query.to_lowercase();
        let state = self.state.read().await;
        self.verified
            .iter()
            .filter(|v| !state.contains(&v.config.id) && v.matches(&query_lower))
            .map(|v| v.config.clone())
            .collect()
    }

    async fn discover_dynamic(&self, query: &str) -> Vec<McpServerConfig> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        let found = match tokio::time::timeout(self.discovery_timeout, registry.discover(query))
            .await
        {
            Ok(found) => found,
            Err(_) => {
                warn!(
                    timeout_ms = self.discovery_timeout.as_millis() as u64,
                    "MCP registry discovery timed out"
                );
                return Vec::new();
            },
        };
        let state = self.state.read().await;
        found
            .into_iter()
            .filter(|c| !state.contains(&c.id))
            .collect()
    }

    async fn connect_with_timeout(
        &self,
        config: &McpServerConfig,
    ) -> std::result::Result<Box<dyn McpSession>, String> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.connector.connect(config)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("MCP connect timeout: {}", config.display_name)),
        }
    }

    /// Tools of every connected server, prefixed with the server's short id.
    pub async fn anthropic_tools(&self) -> Vec<AnthropicTool> {
        if !self.enabled {
            return Vec::new();
        }
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .flat_map(|conn| {
                conn.tools.iter().map(move |tool| AnthropicTool {
                    name: tool.prefixed_name.clone(),
                    description: format!(
                        "[MCP: {}] {}",
                        conn.config.display_name, tool.description
                    ),
                    input_schema: tool.input_schema.clone(),
                })
            })
            .collect()
    }

    pub async fn is_mcp_tool(&self, name: &str) -> bool {
        self.state.read().await.tool_index.contains_key(name)
    }

    async fn route(
        &self,
        prefixed_name: &str,
    ) -> Result<(Arc<dyn McpSession>, McpServerConfig, String)> {
        let state = self.state.read().await;
        let route = state
            .tool_index
            .get(prefixed_name)
            .ok_or_else(|| Error::UnknownTool {
                name: prefixed_name.to_string(),
            })?;
        let conn = state
            .connections
            .iter()
            .find(|c| c.config.id == route.server_id);
        match conn {
            Some(Connection {
                config,
                session: Some(session),
                status: ConnectionStatus::Connected,
                ..
            }) => Ok((
                Arc::clone(session),
                config.clone(),
                route.original_name.clone(),
            )),
            other => Err(Error::NotConnected {
                server: other.map_or_else(
                    || route.server_id.clone(),
                    |c| c.config.display_name.clone(),
                ),
            }),
        }
    }

    /// Run a namespaced tool. Failures come back as `success: false`.
    pub async fn call_tool(&self, prefixed_name: &str, input: Value) -> McpCallResult {
        let (session, config, original_name) = match self.route(prefixed_name).await {
            Ok(found) => found,
            Err(e) => {
                return McpCallResult {
                    success: false,
                    output: e.to_string(),
                    execution_time_ms: 0,
                };
            },
        };

        let started = Instant::now();
        let timeout = Duration::from_millis(config.call_timeout_ms);
        let outcome = tokio::time::timeout(timeout, session.call_tool(&original_name, input)).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;
        debug!(tool = prefixed_name, server = %config.id, execution_time_ms, "MCP tool call");

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return McpCallResult {
                    success: false,
                    output: Error::call_failed(format!("{e:#}")).to_string(),
                    execution_time_ms,
                };
            },
            Err(_) => {
                return McpCallResult {
                    success: false,
                    output: Error::call_failed("MCP tool call timeout").to_string(),
                    execution_time_ms,
                };
            },
        };

        let marker = format!(
            "\n...[truncated, output exceeded {} chars]",
            config.max_output_chars
        );
        let output = sanitize_output(&truncate_with_marker(
            &result.text(),
            config.max_output_chars,
            &marker,
        ));
        let output = match (output.is_empty(), result.is_error) {
            (false, _) => output,
            (true, true) => "MCP tool returned an error with no details.".to_string(),
            (true, false) => "(no output)".to_string(),
        };
        McpCallResult {
            success: !result.is_error,
            output,
            execution_time_ms,
        }
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        self.state
            .read()
            .await
            .connections
            .iter()
            .map(|c| ServerStatus {
                id: c.config.id.clone(),
                display_name: c.config.display_name.clone(),
                status: c.status,
                tool_count: c.tools.len(),
                error: c.error.clone(),
            })
            .collect()
    }

    /// Epoch millis at which `server_id` was first attempted.
    pub async fn connected_at_ms(&self, server_id: &str) -> Option<u64> {
        self.state
            .read()
            .await
            .connections
            .iter()
            .find(|c| c.config.id == server_id)
            .map(|c| c.connected_at_ms)
    }

    /// Close every session and forget all servers.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        for conn in state.connections.drain(..) {
            if let Some(session) = conn.session {
                session.close().await;
            }
        }
        state.tool_index.clear();
        state.used_short_ids.clear();
        info!("MCP manager shut down");
    }
}

/// `io.github.someone/Weather MCP` becomes `weather_mcp`.
fn derive_short_id(server_id: &str) -> String {
    static INVALID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[^a-z0-9_-]").ok());
    static REPEATED: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"_{2,}").ok());

    let last = server_id.rsplit('/').next().unwrap_or(server_id).to_lowercase();
    let mut short = match INVALID.as_ref() {
        Some(re) => re.replace_all(&last, "_").into_owned(),
        None => last,
    };
    if let Some(re) = REPEATED.as_ref() {
        short = re.replace_all(&short, "_").into_owned();
    }
    short.trim_matches('_').to_string()
}

/// Drop C0 control characters other than tab, newline and carriage return.
fn sanitize_output(output: &str) -> String {
    output
        .chars()
        .filter(|c| !matches!(c, '\x00'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f'))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::types::{McpToolDef, ToolContent, ToolsCallResult, empty_object_schema},
        async_trait::async_trait,
        std::sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    struct FakeSession {
        tools: Vec<McpToolDef>,
        reply: ToolsCallResult,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl McpSession for FakeSession {
        fn tools(&self) -> &[McpToolDef] {
            &self.tools
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<ToolsCallResult> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            if name == "explode" {
                anyhow::bail!("server crashed");
            }
            Ok(self.reply.clone())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        failing: Vec<String>,
        reply: ToolsCallResult,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        closed: Arc<AtomicUsize>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl McpConnector for FakeConnector {
        async fn connect(&self, config: &McpServerConfig) -> anyhow::Result<Box<dyn McpSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&config.id) {
                anyhow::bail!("npx exited with status 1");
            }
            Ok(Box::new(FakeSession {
                tools: vec![
                    McpToolDef {
                        name: "lookup".into(),
                        description: Some("Look something up".into()),
                        input_schema: serde_json::json!({
                            "type": "object",
                            "properties": { "q": { "type": "string" } }
                        }),
                    },
                    McpToolDef {
                        name: "explode".into(),
                        description: None,
                        input_schema: empty_object_schema(),
                    },
                ],
                reply: self.reply.clone(),
                calls: Arc::clone(&self.calls),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn verified(id: &str, keyword: &str, max_output_chars: usize) -> VerifiedServer {
        VerifiedServer {
            config: McpServerConfig {
                max_output_chars,
                ..McpServerConfig::new(id, format!("Server {id}"), "npx", vec![])
            },
            keywords: vec![keyword.to_string()],
        }
    }

    fn text_reply(text: &str, is_error: bool) -> ToolsCallResult {
        ToolsCallResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error,
        }
    }

    fn manager(connector: Arc<FakeConnector>, servers: Vec<VerifiedServer>) -> McpManager {
        McpManager::new(&McpConfig::default(), connector, None).with_verified(servers)
    }

    #[test]
    fn short_ids_are_sanitized() {
        assert_eq!(derive_short_id("io.github.someone/weather"), "weather");
        assert_eq!(derive_short_id("io.github.x/Weather MCP!!"), "weather_mcp");
        assert_eq!(derive_short_id("plain-name"), "plain-name");
        assert_eq!(derive_short_id("a/__x__"), "x");
    }

    #[test]
    fn sanitize_keeps_whitespace_controls() {
        assert_eq!(sanitize_output("a\tb\r\nc\x00\x07\x1bd"), "a\tb\r\ncd");
    }

    #[tokio::test]
    async fn colliding_short_ids_get_numbered() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(Arc::clone(&connector), vec![
            verified("io.github.a/weather", "rain", 100),
            verified("io.github.b/weather", "rain", 100),
        ]);
        mgr.discover_for_query("Will it RAIN tomorrow?").await;

        let names: Vec<_> = mgr
            .anthropic_tools()
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec![
            "weather_lookup",
            "weather_explode",
            "weather2_lookup",
            "weather2_explode"
        ]);
        assert!(mgr.is_mcp_tool("weather2_lookup").await);

        let tools = mgr.anthropic_tools().await;
        assert_eq!(
            tools[0].description,
            "[MCP: Server io.github.a/weather] Look something up"
        );
        assert_eq!(tools[1].description, "[MCP: Server io.github.a/weather] ");
        assert_eq!(tools[1].input_schema, empty_object_schema());

        // Already-known servers are not reconnected.
        mgr.discover_for_query("rain again").await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_server_is_isolated() {
        let connector = Arc::new(FakeConnector {
            failing: vec!["io.github.bad/broken".into()],
            ..Default::default()
        });
        let mgr = manager(connector, vec![
            verified("io.github.bad/broken", "stock", 100),
            verified("io.github.ok/quotes", "stock", 100),
        ]);
        mgr.discover_for_query("stock price of AAPL").await;

        let status = mgr.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].status, ConnectionStatus::Failed);
        assert!(status[0].error.as_deref().unwrap().contains("npx exited"));
        assert_eq!(status[0].tool_count, 0);
        assert_eq!(status[1].status, ConnectionStatus::Connected);
        assert_eq!(status[1].tool_count, 2);
        assert!(mgr.connected_at_ms("io.github.ok/quotes").await.is_some());

        let names: Vec<_> = mgr.anthropic_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["quotes_lookup", "quotes_explode"]);

        let json = serde_json::to_value(&status[1]).unwrap();
        assert_eq!(json["displayName"], "Server io.github.ok/quotes");
        assert_eq!(json["status"], "connected");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn call_routes_truncates_and_sanitizes() {
        let connector = Arc::new(FakeConnector {
            reply: text_reply("0123456789\x07abc", false),
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&connector), vec![verified("x/clock", "time", 10)]);
        mgr.discover_for_query("what time is it").await;

        let result = mgr
            .call_tool("clock_lookup", serde_json::json!({"q": "UTC"}))
            .await;
        assert!(result.success);
        assert_eq!(
            result.output,
            "0123456789\n...[truncated, output exceeded 10 chars]"
        );
        let calls = connector.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("lookup".to_string(), serde_json::json!({"q": "UTC"}))]);

        let failed = mgr.call_tool("clock_explode", Value::Null).await;
        assert!(!failed.success);
        assert_eq!(failed.output, "MCP tool call failed: server crashed");

        let unknown = mgr.call_tool("clock_missing", Value::Null).await;
        assert!(!unknown.success);
        assert_eq!(unknown.output, "Unknown MCP tool: clock_missing");
    }

    #[tokio::test]
    async fn empty_outputs_get_placeholders() {
        let connector = Arc::new(FakeConnector {
            reply: text_reply("", true),
            ..Default::default()
        });
        let mgr = manager(connector, vec![verified("x/clock", "time", 100)]);
        mgr.discover_for_query("time").await;
        let result = mgr.call_tool("clock_lookup", Value::Null).await;
        assert!(!result.success);
        assert_eq!(result.output, "MCP tool returned an error with no details.");

        let connector = Arc::new(FakeConnector {
            reply: ToolsCallResult::default(),
            ..Default::default()
        });
        let mgr = manager(connector, vec![verified("x/clock", "time", 100)]);
        mgr.discover_for_query("time").await;
        let result = mgr.call_tool("clock_lookup", Value::Null).await;
        assert!(result.success);
        assert_eq!(result.output, "(no output)");
    }

    #[tokio::test]
    async fn respects_connection_cap_and_disabled_flag() {
        let connector = Arc::new(FakeConnector::default());
        let config = McpConfig {
            max_connected_servers: 1,
            ..McpConfig::default()
        };
        let mgr = McpManager::new(&config, Arc::clone(&connector) as Arc<dyn McpConnector>, None)
            .with_verified(vec![verified("x/one", "news", 100), verified("x/two", "news", 100)]);
        mgr.discover_for_query("news").await;
        assert_eq!(mgr.status().await.len(), 1);

        mgr.discover_for_query("news").await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        let disabled = McpManager::new(
            &McpConfig {
                enabled: false,
                ..McpConfig::default()
            },
            Arc::new(FakeConnector::default()),
            None,
        )
        .with_verified(vec![verified("x/one", "news", 100)]);
        disabled.discover_for_query("news").await;
        assert!(disabled.status().await.is_empty());
        assert!(disabled.anthropic_tools().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_resets_names() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(Arc::clone(&connector), vec![verified("x/clock", "time", 100)]);
        mgr.discover_for_query("time").await;
        assert!(mgr.is_mcp_tool("clock_lookup").await);

        mgr.shutdown().await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert!(mgr.status().await.is_empty());
        assert!(!mgr.is_mcp_tool("clock_lookup").await);

        // Short ids start over after shutdown.
        mgr.discover_for_query("time").await;
        assert!(mgr.is_mcp_tool("clock_lookup").await);
    }

    #[tokio::test]
    async fn dynamic_discovery_uses_registry_when_nothing_matches() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "servers": [{
                "server": {
                    "name": "io.github.someone/recipes",
                    "packages": [{
                        "registryType": "npm",
                        "identifier": "recipes-mcp",
                        "transport": { "type": "stdio" }
                    }]
                }
            }]
        });
        let _mock = server
            .mock("GET", "/servers")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let config = McpConfig {
            dynamic_discovery: true,
            ..McpConfig::default()
        };
        let mgr = McpManager::new(
            &config,
            Arc::new(FakeConnector::default()),
            Some(RegistryClient::new(server.url())),
        )
        .with_verified(Vec::new());
        mgr.discover_for_query("vegetarian lasagna recipes").await;

        let status = mgr.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].id, "io.github.someone/recipes");
        assert_eq!(status[0].display_name, "recipes");
        assert!(mgr.is_mcp_tool("recipes_lookup").await);
    }
}
