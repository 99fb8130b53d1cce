//! Pattern-based scan of generated code for destructive or dynamic-execution constructs.

use {
    crucible_config::RiskConfig,
    regex::{Regex, RegexBuilder},
    serde::{Deserialize, Serialize},
};

use crate::error::Result;

/// Built-in `(pattern, reason)` table. Matching is case-insensitive.
pub const BUILTIN_RISK_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+-rf\b", "Destructive shell deletion command detected."),
    (r"\bshutil\.rmtree\b", "Recursive directory deletion detected."),
    (r"\bos\.remove\b", "File deletion call detected."),
    (r"\bsubprocess\.(run|Popen)\b", "Subprocess invocation detected."),
    (r"\beval\s*\(", "Dynamic eval execution detected."),
    (r"\bexec\s*\(", "Dynamic exec execution detected."),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRiskCheck {
    pub requires_approval: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct RiskRule {
    regex: Regex,
    reason: String,
}

#[derive(Debug, Clone)]
pub struct RiskPolicy {
    rules: Vec<RiskRule>,
}

impl RiskPolicy {
    /// Build from `(pattern, reason)` pairs.
    pub fn new<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let rules = patterns
            .into_iter()
            .map(|(pattern, reason)| {
                Ok(RiskRule {
                    regex: RegexBuilder::new(pattern).case_insensitive(true).build()?,
                    reason: reason.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(BUILTIN_RISK_PATTERNS.iter().copied())
    }

    /// Built-in table plus any configured extra patterns.
    pub fn from_config(config: &RiskConfig) -> Result<Self> {
        Self::new(
            BUILTIN_RISK_PATTERNS.iter().copied().chain(
                config
                    .extra_patterns
                    .iter()
                    .map(|p| (p.pattern.as_str(), p.reason.as_str())),
            ),
        )
    }

    #[must_use]
    pub fn inspect(&self, code: &str) -> CodeRiskCheck {
        let reasons: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.regex.is_match(code))
            .map(|rule| rule.reason.clone())
            .collect();
        CodeRiskCheck {
            requires_approval: !reasons.is_empty(),
            reasons,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crucible_config::RiskPatternConfig};

    #[test]
    fn each_builtin_pattern_requires_approval() {
        let policy = RiskPolicy::builtin().unwrap();
        for code in [
            "import os\nos.system('rm -rf /tmp/x')",
            "import shutil\nshutil.rmtree('data')",
            "os.remove('a.csv')",
            "subprocess.run(['ls'])",
            "subprocess.Popen('ls')",
            "eval ('1+1')",
            "exec(open('x').read())",
        ] {
            let check = policy.inspect(code);
            assert!(check.requires_approval, "{code}");
            assert!(!check.reasons.is_empty());
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        let policy = RiskPolicy::builtin().unwrap();
        assert!(policy.inspect("RM -RF /").requires_approval);
        assert!(policy.inspect("SHUTIL.RMTREE(p)").requires_approval);
    }

    #[test]
    fn safe_code_passes() {
        let policy = RiskPolicy::builtin().unwrap();
        let check = policy.inspect(
            "import pandas as pd\ndf = pd.read_csv('a.csv')\nprint(df.describe())\nevaluate(x)",
        );
        assert_eq!(check, CodeRiskCheck::default());
    }

    #[test]
    fn reasons_follow_table_order() {
        let policy = RiskPolicy::builtin().unwrap();
        let check = policy.inspect("exec(x); eval(y)");
        assert_eq!(
            check.reasons,
            vec![
                "Dynamic eval execution detected.".to_string(),
                "Dynamic exec execution detected.".to_string()
            ]
        );
    }

    #[test]
    fn extra_patterns_extend_table() {
        let config = RiskConfig {
            extra_patterns: vec![RiskPatternConfig {
                pattern: r"\bsocket\.socket\b".into(),
                reason: "Raw socket detected.".into(),
            }],
        };
        let policy = RiskPolicy::from_config(&config).unwrap();
        assert_eq!(
            policy.inspect("s = socket.socket()").reasons,
            vec!["Raw socket detected.".to_string()]
        );

        let bad = RiskConfig {
            extra_patterns: vec![RiskPatternConfig {
                pattern: "(".into(),
                reason: "x".into(),
            }],
        };
        assert!(RiskPolicy::from_config(&bad).is_err());
    }
}
