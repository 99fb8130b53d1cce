pub mod anthropic;

use std::sync::Arc;

use {anyhow::Context, crucible_config::LlmConfig};

pub use anthropic::AnthropicProvider;

use crate::model::LlmProvider;

/// The fast router model and the tool-calling orchestrator model.
pub struct ProviderPair {
    pub router: Arc<dyn LlmProvider>,
    pub orchestrator: Arc<dyn LlmProvider>,
}

/// Build both Anthropic endpoints. Fails when no API key is configured.
pub fn anthropic_pair(config: &LlmConfig) -> anyhow::Result<ProviderPair> {
    let api_key = config
        .api_key
        .clone()
        .context("no Anthropic API key configured (set ANTHROPIC_API_KEY)")?;
    Ok(ProviderPair {
        router: Arc::new(AnthropicProvider::new(
            api_key.clone(),
            config.router_model.clone(),
            config.base_url.clone(),
        )),
        orchestrator: Arc::new(AnthropicProvider::new(
            api_key,
            config.orchestrator_model.clone(),
            config.base_url.clone(),
        )),
    })
}
