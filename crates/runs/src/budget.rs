//! Soft per-run resource ceilings and usage accounting.

use {
    crucible_config::BudgetConfig,
    serde::{Deserialize, Serialize},
};

pub const DEFAULT_MAX_TOTAL_TOKENS: u64 = 200_000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 8_192;
pub const DEFAULT_MAX_SANDBOX_MS: u64 = 10 * 60_000;
pub const DEFAULT_MAX_COST_USD: f64 = 15.0;
pub const DEFAULT_MAX_AGENT_ITERATIONS: u32 = 16;

/// Per-token USD rates keyed by model label.
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("haiku-4.5", 1.0 / 1_000_000.0, 5.0 / 1_000_000.0),
    ("sonnet-4", 3.0 / 1_000_000.0, 15.0 / 1_000_000.0),
    ("sonnet-4.5", 3.0 / 1_000_000.0, 15.0 / 1_000_000.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBudget {
    pub max_total_tokens: u64,
    pub max_output_tokens: u64,
    pub max_sandbox_ms: u64,
    pub max_cost_usd: f64,
    pub max_agent_iterations: u32,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_total_tokens: DEFAULT_MAX_TOTAL_TOKENS,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            max_sandbox_ms: DEFAULT_MAX_SANDBOX_MS,
            max_cost_usd: DEFAULT_MAX_COST_USD,
            max_agent_iterations: DEFAULT_MAX_AGENT_ITERATIONS,
        }
    }
}

impl RunBudget {
    /// Whether `usage` went over any ceiling. Checked after the fact, never preemptively.
    #[must_use]
    pub fn is_exceeded(&self, usage: &RunUsage) -> bool {
        usage.input_tokens + usage.output_tokens > self.max_total_tokens
            || usage.sandbox_ms > self.max_sandbox_ms
            || usage.estimated_cost_usd > self.max_cost_usd
    }
}

/// Accumulated consumption. Field order is part of the manifest encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub sandbox_ms: u64,
    pub estimated_cost_usd: f64,
}

impl RunUsage {
    /// Add one LLM call and return its estimated cost.
    pub fn add_llm_call(&mut self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = estimate_cost_usd(model, input_tokens, output_tokens);
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.estimated_cost_usd += cost;
        cost
    }

    pub fn add_sandbox_ms(&mut self, ms: u64) {
        self.sandbox_ms += ms;
    }
}

/// Budget settings a user saved on their profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BudgetOverrides {
    pub max_agent_iterations: Option<u32>,
    pub max_cost_usd: Option<f64>,
    pub max_sandbox_ms: Option<u64>,
    pub max_tokens_per_session: Option<u64>,
}

fn positive_u64(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

fn positive_f64(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Layer defaults, then user overrides, then operator overrides.
///
/// Output tokens are clamped to the total and iterations to at least one.
#[must_use]
pub fn resolve_budget(user: Option<&BudgetOverrides>, operator: &BudgetConfig) -> RunBudget {
    let defaults = RunBudget::default();
    let user = user.copied().unwrap_or_default();

    let max_total_tokens = positive_u64(operator.max_total_tokens)
        .or(positive_u64(user.max_tokens_per_session))
        .unwrap_or(defaults.max_total_tokens);
    let max_output_tokens =
        positive_u64(operator.max_output_tokens).unwrap_or(defaults.max_output_tokens);
    let max_sandbox_ms = positive_u64(operator.max_sandbox_ms)
        .or(positive_u64(user.max_sandbox_ms))
        .unwrap_or(defaults.max_sandbox_ms);
    let max_cost_usd = positive_f64(operator.max_cost_usd)
        .or(positive_f64(user.max_cost_usd))
        .unwrap_or(defaults.max_cost_usd);
    let max_agent_iterations = operator
        .max_agent_iterations
        .filter(|v| *v > 0)
        .or(user.max_agent_iterations.filter(|v| *v > 0))
        .unwrap_or(defaults.max_agent_iterations)
        .max(1);

    RunBudget {
        max_total_tokens,
        max_output_tokens: max_output_tokens.min(max_total_tokens),
        max_sandbox_ms,
        max_cost_usd,
        max_agent_iterations,
    }
}

/// Map a model id such as `claude-haiku-4-5-20251001` to its rate label.
#[must_use]
pub fn model_label(model: &str) -> &str {
    if MODEL_RATES.iter().any(|(label, ..)| *label == model) {
        return model;
    }
    let lower = model.to_ascii_lowercase();
    if lower.contains("sonnet") {
        "sonnet-4"
    } else {
        "haiku-4.5"
    }
}

/// Estimated USD cost of one call. Unknown models are priced at the haiku rate.
#[must_use]
pub fn estimate_cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let label = model_label(model);
    let (input_rate, output_rate) = MODEL_RATES
        .iter()
        .find(|(l, ..)| *l == label)
        .map_or((1.0 / 1_000_000.0, 5.0 / 1_000_000.0), |(_, i, o)| (*i, *o));
    input_tokens as f64 * input_rate + output_tokens as f64 * output_rate
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_overrides() {
        let budget = resolve_budget(None, &BudgetConfig::default());
        assert_eq!(budget, RunBudget::default());
        assert_eq!(budget.max_total_tokens, 200_000);
        assert_eq!(budget.max_sandbox_ms, 600_000);
    }

    #[test]
    fn operator_beats_user_beats_default() {
        let user = BudgetOverrides {
            max_cost_usd: Some(2.0),
            max_sandbox_ms: Some(5_000),
            max_tokens_per_session: Some(0),
            ..Default::default()
        };
        let operator = BudgetConfig {
            max_sandbox_ms: Some(9_000),
            ..Default::default()
        };
        let budget = resolve_budget(Some(&user), &operator);
        assert_eq!(budget.max_cost_usd, 2.0);
        assert_eq!(budget.max_sandbox_ms, 9_000);
        assert_eq!(budget.max_total_tokens, 200_000);
    }

    #[test]
    fn clamps_output_tokens_and_iterations() {
        let operator = BudgetConfig {
            max_total_tokens: Some(1_000),
            max_agent_iterations: Some(0),
            ..Default::default()
        };
        let budget = resolve_budget(None, &operator);
        assert_eq!(budget.max_output_tokens, 1_000);
        assert_eq!(budget.max_agent_iterations, 16);

        let user = BudgetOverrides {
            max_agent_iterations: Some(1),
            ..Default::default()
        };
        assert_eq!(
            resolve_budget(Some(&user), &BudgetConfig::default()).max_agent_iterations,
            1
        );
    }

    #[test]
    fn exceeded_on_any_dimension() {
        let budget = RunBudget {
            max_total_tokens: 100,
            max_sandbox_ms: 1_000,
            max_cost_usd: 1.0,
            ..Default::default()
        };
        let mut usage = RunUsage {
            input_tokens: 60,
            output_tokens: 40,
            sandbox_ms: 1_000,
            estimated_cost_usd: 1.0,
        };
        assert!(!budget.is_exceeded(&usage));
        usage.output_tokens = 41;
        assert!(budget.is_exceeded(&usage));
        usage.output_tokens = 40;
        usage.sandbox_ms = 1_001;
        assert!(budget.is_exceeded(&usage));
        usage.sandbox_ms = 0;
        usage.estimated_cost_usd = 1.01;
        assert!(budget.is_exceeded(&usage));
    }

    #[test]
    fn cost_uses_model_rates() {
        let haiku = estimate_cost_usd("haiku-4.5", 1_000_000, 1_000_000);
        assert!((haiku - 6.0).abs() < 1e-9);
        let sonnet = estimate_cost_usd("claude-sonnet-4-20250514", 1_000_000, 0);
        assert!((sonnet - 3.0).abs() < 1e-9);
        let unknown = estimate_cost_usd("mystery", 0, 1_000_000);
        assert!((unknown - 5.0).abs() < 1e-9);
    }

    #[test]
    fn usage_accumulates_llm_calls() {
        let mut usage = RunUsage::default();
        let cost = usage.add_llm_call("sonnet-4", 1_000, 100);
        usage.add_llm_call("haiku-4.5", 10, 10);
        usage.add_sandbox_ms(250);
        assert_eq!(usage.input_tokens, 1_010);
        assert_eq!(usage.output_tokens, 110);
        assert_eq!(usage.sandbox_ms, 250);
        assert!(usage.estimated_cost_usd > cost);
    }
}
