//! Server configurations and the curated "verified" set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 12_000;
/// Servers queued by one discovery round.
pub const MAX_SERVERS_PER_DISCOVERY: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    /// Registry name, e.g. `io.github.someone/weather`.
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Added to the inherited environment of the server process.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub max_output_chars: usize,
}

impl McpServerConfig {
    /// A server launched with `command args...` and default limits.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

/// A pre-tested server and the query keywords that select it.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedServer {
    pub config: McpServerConfig,
    pub keywords: Vec<String>,
}

impl VerifiedServer {
    /// Whether any keyword is a substring of the lowercased query.
    #[must_use]
    pub fn matches(&self, query_lower: &str) -> bool {
        self.keywords.iter().any(|kw| query_lower.contains(kw.as_str()))
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}

#[must_use]
pub fn verified_servers() -> Vec<VerifiedServer> {
    vec![
        VerifiedServer {
            config: McpServerConfig {
                connect_timeout_ms: 15_000,
                call_timeout_ms: 5_000,
                max_output_chars: 2_000,
                ..McpServerConfig::new(
                    "verified/time",
                    "Time & Timezone",
                    "npx",
                    strings(&["-y", "@katomato65/time-mcp"]),
                )
            },
            keywords: strings(&[
                "time", "timezone", "clock", "date", "hour", "est", "pst", "utc", "gmt", "cst",
                "mst", "ist", "bst", "jst", "cet",
            ]),
        },
        VerifiedServer {
            config: McpServerConfig {
                connect_timeout_ms: 15_000,
                call_timeout_ms: 15_000,
                max_output_chars: 8_000,
                ..McpServerConfig::new(
                    "verified/search",
                    "DuckDuckGo Search",
                    "npx",
                    strings(&["-y", "duckduckgo-mcp-server"]),
                )
            },
            keywords: strings(&[
                "search",
                "find",
                "lookup",
                "google",
                "news",
                "latest",
                "current",
                "recent",
                "today",
                "weather",
                "forecast",
                "temperature",
                "stock",
                "price",
                "score",
                "result",
                "who is",
                "what is",
                "where is",
                "how to",
                "define",
                "meaning",
                "wiki",
                "wikipedia",
                "article",
                "headline",
            ]),
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn verified_servers_match_by_substring() {
        let servers = verified_servers();
        let time = &servers[0];
        let search = &servers[1];
        assert_eq!(time.config.call_timeout_ms, 5_000);
        assert_eq!(search.config.max_output_chars, 8_000);

        assert!(time.matches("what timezone is tokyo in"));
        assert!(search.matches("what is the weather in paris"));
        assert!(!time.matches("plot a histogram"));
        // Keywords match anywhere: "estimate" contains "est".
        assert!(time.matches("estimate the mean"));
    }

    #[test]
    fn new_applies_default_limits() {
        let config = McpServerConfig::new("a/b", "B", "npx", vec!["-y".into(), "b".into()]);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(config.call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
        assert_eq!(config.max_output_chars, DEFAULT_MAX_OUTPUT_CHARS);
        assert!(config.env.is_empty());
    }
}
