use serde_json::Value;

use cg_domain::context::CallerContext;
use cg_domain::error::Result;
use cg_domain::tool::ToolDefinition;

/// Whether a skill wraps an external system or is self-contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    /// Talks to an external service (email, network controller, ...).
    Integration,
    /// Self-contained capability (notes, reminders, ...).
    Skill,
}

/// A pluggable capability. Implementations own their tools; tool names are
/// globally unique across the registry.
///
/// `execute` signals *tool-level* failure by returning an error **string**
/// (`Ok`), so the LLM sees the refusal and can adapt. `Err` is reserved for
/// system bugs and infrastructure failures — those are recorded against the
/// skill's health.
#[async_trait::async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SkillKind {
        SkillKind::Skill
    }

    /// The tools this skill exposes. Called once at registration.
    fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call with validated input.
    async fn execute(&self, tool_name: &str, input: &Value, ctx: &CallerContext)
        -> Result<String>;

    /// One-time startup hook (connections, caches). Default: no-op.
    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Graceful shutdown hook. Default: no-op.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Config keys this skill needs; used by the embedding application to
    /// decide whether to register it at all.
    fn required_config(&self) -> &[&str] {
        &[]
    }
}
