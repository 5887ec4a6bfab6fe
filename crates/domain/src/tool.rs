use serde::{Deserialize, Serialize};

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Permission tier of a tool: 0 read-only, 1 local writes, 2 external
/// reads, 3 mutating external state, 4 destructive. Tiers 3 and 4 imply
/// confirmation by policy.
pub type PermissionTier = u8;

/// Tool definition exposed to the LLM and enforced by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Lowercase snake_case, globally unique in the registry.
    pub name: String,
    pub description: String,
    /// Object-typed JSON-schema subset: `properties`, `required`,
    /// per-field `type`/`enum`/`minimum`/`maximum`/`minItems`/`maxItems`/
    /// `maxLength`. Interpreted by the input validator.
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub permission_tier: PermissionTier,
    /// Execution is gated behind a single-use confirmation token.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Never dispatched from a sub-agent context, however requested.
    #[serde(default)]
    pub main_agent_only: bool,
    /// Inputs/outputs are flagged in audit; confirmation governed by the
    /// sensitive-tool policy.
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub requires_critique: bool,
}

impl ToolDefinition {
    /// A minimal definition with an empty object schema. Flags default off.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
            permission_tier: 0,
            requires_confirmation: false,
            main_agent_only: false,
            sensitive: false,
            requires_critique: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// An assistant message carrying text plus the tool_use blocks the
    /// model emitted, for replay in the continuation request.
    pub fn assistant_with_tool_uses(text: &str, tool_calls: &[ToolCall]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        for tc in tool_calls {
            parts.push(ContentPart::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }

    /// A user-role message carrying one tool_result block per executed call.
    pub fn tool_results(results: Vec<(String, String, bool)>) -> Self {
        let parts = results
            .into_iter()
            .map(|(tool_use_id, content, is_error)| ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            })
            .collect();
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

impl MessageContent {
    /// Extract and join all text content, returning an owned String.
    /// Non-text parts are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop reason & usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

/// Token usage for one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}
