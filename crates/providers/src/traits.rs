use cg_domain::cancel::CancelToken;
use cg_domain::error::Result;
use cg_domain::tool::{Message, StopReason, ToolCall, ToolDefinition, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// The system prompt, passed separately from the message list.
    pub system: Option<String>,
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke. Empty = no tools offered.
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens in the response.
    pub max_tokens: u32,
    /// Cooperative cancellation; adapters should abort in-flight requests
    /// when the token fires.
    pub signal: Option<CancelToken>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response, if any.
    pub text: Option<String>,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Why the model stopped generating.
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// The model that actually produced the response.
    pub model: String,
    /// The provider that served the request.
    pub provider: String,
}

/// Tool-calling support advertised by a {provider, model} pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSupport {
    Yes,
    No,
    /// Some models behind this provider support tools, some don't; offer
    /// tools and let the provider strip them where unsupported.
    ModelDependent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements. Adapters translate between these
/// types and each provider's wire format.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Whether this provider can accept tool definitions.
    fn tool_support(&self) -> ToolSupport {
        ToolSupport::Yes
    }

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
