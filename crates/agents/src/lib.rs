//! The agent side of Crucible: LLM providers, intent routing, code
//! generation, tool execution and the workflow that ties them to the
//! sandbox, the run ledger and MCP servers.

pub mod codegen;
pub mod collaborators;
pub mod collaborators_memory;
pub mod content_type;
pub mod discovery;
pub mod error;
pub mod events;
pub mod model;
pub mod prompts;
pub mod providers;
pub mod router;
pub mod tools;
pub mod workflow;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test_support;

pub use {
    collaborators::{
        AssistantTurn, BlobStore, Collaborators, ConversationStore, EntitlementChecker,
        ExecutionSettings, HistoryTurn, MemoryContext, MemoryStore, ProfileStore, UsageTracker,
    },
    collaborators_memory::InMemoryCollaborators,
    error::{Error, Result},
    events::{ChannelSink, CollectingSink, EventSink, WorkflowEvent},
    model::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider},
    providers::{AnthropicProvider, ProviderPair, anthropic_pair},
    router::{IntentType, RouterResult},
    workflow::{Workflow, WorkflowInput, WorkflowOutcome},
};
