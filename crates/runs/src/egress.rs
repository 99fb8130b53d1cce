//! Hostname allowlist for network calls found in generated code.

use std::sync::LazyLock;

use {
    crucible_config::EgressConfig,
    regex::Regex,
    serde::{Deserialize, Serialize},
};

static HOST_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"https?://([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})(?::\d+)?").ok()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicyResult {
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub detected_hosts: Vec<String>,
    pub blocked_hosts: Vec<String>,
}

impl EgressPolicyResult {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.blocked_hosts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EgressPolicy {
    allowlist: Vec<String>,
}

/// Trim, lowercase and strip leading or trailing dots.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .to_lowercase()
        .trim_matches('.')
        .to_string()
}

impl EgressPolicy {
    /// An empty allowlist disables the check.
    #[must_use]
    pub fn new<S: AsRef<str>>(entries: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowlist: entries
                .into_iter()
                .map(|e| normalize_host(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &EgressConfig) -> Self {
        Self::new(&config.allowlist)
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.allowlist.is_empty()
    }

    #[must_use]
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.allowlist.iter().any(|entry| match entry.strip_prefix("*.") {
            Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
            None => host == *entry,
        })
    }

    #[must_use]
    pub fn evaluate(&self, code: &str) -> EgressPolicyResult {
        let detected_hosts = extract_hosts(code);
        let blocked_hosts = if self.enabled() {
            detected_hosts
                .iter()
                .filter(|host| !self.is_allowed(host))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        EgressPolicyResult {
            enabled: self.enabled(),
            allowlist: self.allowlist.clone(),
            detected_hosts,
            blocked_hosts,
        }
    }
}

/// Unique normalized hosts of every `http(s)://` URL in `code`, in first-seen order.
#[must_use]
pub fn extract_hosts(code: &str) -> Vec<String> {
    let Some(re) = HOST_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut hosts: Vec<String> = Vec::new();
    for cap in re.captures_iter(code) {
        let host = normalize_host(cap.get(1).map_or("", |m| m.as_str()));
        if !host.is_empty() && !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}
