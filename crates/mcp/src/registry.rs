//! Search the public MCP registry for servers that can be auto-connected.
//!
//! Only npm packages speaking stdio and needing no secret credentials pass
//! the filter; everything else is silently skipped.

use std::{collections::HashSet, time::Duration};

use {
    crucible_config::McpConfig,
    serde::Deserialize,
    tracing::{debug, warn},
};

use crate::config::{MAX_SERVERS_PER_DISCOVERY, McpServerConfig};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_LIMIT: u32 = 10;
const MAX_KEYWORDS: usize = 3;
const OFFICIAL_META_KEY: &str = "io.modelcontextprotocol.registry/official";

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "it", "in", "on", "at", "to", "for", "of", "and", "or", "but", "not",
    "this", "that", "with", "from", "by", "be", "are", "was", "were", "been", "being", "have",
    "has", "had", "do", "does", "did", "will", "would", "could", "should", "may", "can", "what",
    "when", "where", "how", "who", "which", "why", "i", "me", "my", "you", "your", "we", "our",
    "they", "them", "tell", "show", "get", "give", "make", "find", "please", "help", "want",
    "need", "like", "know", "about", "some", "any", "all", "just", "also", "very", "much",
    "right", "now", "here", "there", "up", "out", "if", "then", "so", "than", "too", "only",
    "same", "other", "into", "its", "no", "yes", "ok", "hi", "hello",
];

/// Up to three distinct content words of `query`, in order of appearance.
#[must_use]
pub fn extract_keywords(query: &str) -> Vec<String> {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(*w))
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

// ── Registry wire types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    servers: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    server: RegistryServer,
    #[serde(default, rename = "_meta")]
    meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl RegistryEntry {
    fn is_latest(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.get(OFFICIAL_META_KEY))
            .and_then(|official| official.get("isLatest"))
            .and_then(serde_json::Value::as_bool)
            != Some(false)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryServer {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    packages: Vec<RegistryPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryPackage {
    #[serde(default)]
    registry_type: String,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    transport: Option<PackageTransport>,
    #[serde(default)]
    environment_variables: Vec<RegistryEnvVar>,
    #[serde(default)]
    package_arguments: Vec<PackageArgument>,
}

impl RegistryPackage {
    fn is_auto_connectable(&self) -> bool {
        self.registry_type == "npm"
            && self.transport.as_ref().is_some_and(|t| t.kind == "stdio")
            && !self
                .environment_variables
                .iter()
                .any(|v| v.is_required && v.is_secret)
            && !self.identifier.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct PackageTransport {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryEnvVar {
    #[serde(default)]
    is_required: bool,
    #[serde(default)]
    is_secret: bool,
}

#[derive(Debug, Deserialize)]
struct PackageArgument {
    #[serde(default)]
    value: String,
}

fn build_config(entry: &RegistryEntry) -> Option<McpServerConfig> {
    if !entry.is_latest() {
        return None;
    }
    let server = &entry.server;
    let pkg = server.packages.iter().find(|p| p.is_auto_connectable())?;

    let mut args = vec!["-y".to_string(), pkg.identifier.clone()];
    args.extend(pkg.package_arguments.iter().map(|a| a.value.clone()));

    let display_name = server
        .title
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| {
            server
                .name
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| server.name.clone());

    Some(McpServerConfig::new(
        server.name.clone(),
        display_name,
        "npx",
        args,
    ))
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn from_config(config: &McpConfig) -> Self {
        Self::new(config.registry_url.clone())
    }

    /// Candidate servers for one keyword. Any failure yields an empty list.
    pub async fn search(&self, keyword: &str) -> Vec<McpServerConfig> {
        match self.try_search(keyword).await {
            Ok(configs) => configs,
            Err(e) => {
                warn!(keyword, error = %e, "MCP registry search failed");
                Vec::new()
            },
        }
    }

    async fn try_search(&self, keyword: &str) -> anyhow::Result<Vec<McpServerConfig>> {
        let url = format!("{}/servers", self.base_url);
        let limit = SEARCH_LIMIT.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[("search", keyword), ("limit", limit.as_str())])
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry returned {}", resp.status());
        }
        let body: SearchResponse = resp.json().await?;
        let configs: Vec<_> = body
            .servers
            .iter()
            .filter_map(build_config)
            .take(MAX_SERVERS_PER_DISCOVERY)
            .collect();
        debug!(keyword, found = configs.len(), "MCP registry search");
        Ok(configs)
    }

    /// Search every keyword of `query` in parallel and dedupe by server id.
    pub async fn discover(&self, query: &str) -> Vec<McpServerConfig> {
        let keywords = extract_keywords(query);
        if keywords.is_empty() {
            return Vec::new();
        }
        let results =
            futures::future::join_all(keywords.iter().map(|kw| self.search(kw))).await;

        let mut seen = HashSet::new();
        results
            .into_iter()
            .flatten()
            .filter(|c| seen.insert(c.id.clone()))
            .take(MAX_SERVERS_PER_DISCOVERY)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, mockito::Matcher};

    #[test]
    fn keywords_skip_stop_words_and_short_words() {
        assert_eq!(
            extract_keywords("What's the weather forecast for Paris? weather!"),
            vec!["whats", "weather", "forecast"]
        );
        assert_eq!(extract_keywords("tell me about it"), Vec::<String>::new());
        assert_eq!(extract_keywords("convert USD to EUR"), vec!["convert", "usd", "eur"]);
    }

    fn entry(name: &str, pkg: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "server": { "name": name, "packages": [pkg] } })
    }

    fn npm_stdio(identifier: &str) -> serde_json::Value {
        serde_json::json!({
            "registryType": "npm",
            "identifier": identifier,
            "transport": { "type": "stdio" },
        })
    }

    #[test]
    fn filter_keeps_only_safe_npm_stdio_packages() {
        let ok: RegistryEntry =
            serde_json::from_value(entry("io.github.someone/weather", npm_stdio("weather-mcp")))
                .unwrap();
        let config = build_config(&ok).unwrap();
        assert_eq!(config.id, "io.github.someone/weather");
        assert_eq!(config.display_name, "weather");
        assert_eq!(config.command, "npx");
        assert_eq!(config.args, vec!["-y", "weather-mcp"]);

        let mut secret = npm_stdio("paid-mcp");
        secret["environmentVariables"] =
            serde_json::json!([{ "name": "API_KEY", "isRequired": true, "isSecret": true }]);
        let rejected: RegistryEntry = serde_json::from_value(entry("x/paid", secret)).unwrap();
        assert!(build_config(&rejected).is_none());

        let mut sse = npm_stdio("sse-mcp");
        sse["transport"] = serde_json::json!({ "type": "sse" });
        let rejected: RegistryEntry = serde_json::from_value(entry("x/sse", sse)).unwrap();
        assert!(build_config(&rejected).is_none());

        let pypi = serde_json::json!({
            "registryType": "pypi",
            "identifier": "py-mcp",
            "transport": { "type": "stdio" },
        });
        let rejected: RegistryEntry = serde_json::from_value(entry("x/py", pypi)).unwrap();
        assert!(build_config(&rejected).is_none());
    }

    #[test]
    fn filter_skips_superseded_versions_and_appends_arguments() {
        let mut stale = entry("x/old", npm_stdio("old-mcp"));
        stale["_meta"] = serde_json::json!({
            OFFICIAL_META_KEY: { "status": "active", "isLatest": false }
        });
        let stale: RegistryEntry = serde_json::from_value(stale).unwrap();
        assert!(build_config(&stale).is_none());

        let mut pkg = npm_stdio("args-mcp");
        pkg["packageArguments"] = serde_json::json!([{ "value": "--stdio" }]);
        let mut titled = entry("x/args", pkg);
        titled["server"]["title"] = serde_json::json!("Args Server");
        let titled: RegistryEntry = serde_json::from_value(titled).unwrap();
        let config = build_config(&titled).unwrap();
        assert_eq!(config.display_name, "Args Server");
        assert_eq!(config.args, vec!["-y", "args-mcp", "--stdio"]);
    }

    #[tokio::test]
    async fn search_queries_registry_and_filters() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "servers": [
                entry("io.github.a/weather", npm_stdio("weather-a")),
                { "server": { "name": "x/remote-only" } },
                entry("io.github.b/weather-mcp", npm_stdio("weather-b")),
            ],
            "metadata": { "count": 3 }
        });
        let mock = server
            .mock("GET", "/servers")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("search".into(), "weather".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
            ]))
            .match_header("accept", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = RegistryClient::new(server.url());
        let configs = client.search("weather").await;
        mock.assert_async().await;
        let ids: Vec<_> = configs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["io.github.a/weather", "io.github.b/weather-mcp"]);
    }

    #[tokio::test]
    async fn search_error_yields_empty() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/servers")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        let client = RegistryClient::new(server.url());
        assert!(client.search("weather").await.is_empty());
    }

    #[tokio::test]
    async fn discover_dedupes_across_keywords() {
        let mut server = mockito::Server::new_async().await;
        let shared = serde_json::json!({
            "servers": [entry("io.github.a/weather", npm_stdio("weather-a"))]
        });
        let _mock = server
            .mock("GET", "/servers")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(shared.to_string())
            .expect(2)
            .create_async()
            .await;

        let client = RegistryClient::new(format!("{}/", server.url()));
        let configs = client.discover("weather forecast").await;
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "io.github.a/weather");

        assert!(client.discover("tell me").await.is_empty());
    }
}
