//! Caller context threaded explicitly through every public core function.
//!
//! Carries the correlation id, the principal, the originating channel, and
//! — when execution is happening inside a sub-agent run — that run's id.
//! Passed by reference rather than stored in ambient task-local state so
//! the recursion guard and the main-agent-only gate cannot be bypassed by
//! a detached task.

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub correlation_id: Uuid,
    pub user_id: String,
    pub channel: String,
    /// Set when the current execution is inside a sub-agent run.
    pub subagent_run_id: Option<Uuid>,
}

impl CallerContext {
    /// Fresh context for one inbound user message.
    pub fn for_message(user_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            user_id: user_id.into(),
            channel: channel.into(),
            subagent_run_id: None,
        }
    }

    /// Derive the context a sub-agent run executes under. Keeps the parent
    /// correlation id so audit lines stay linkable.
    pub fn for_subagent(&self, run_id: Uuid) -> Self {
        Self {
            correlation_id: self.correlation_id,
            user_id: self.user_id.clone(),
            channel: self.channel.clone(),
            subagent_run_id: Some(run_id),
        }
    }

    pub fn is_subagent(&self) -> bool {
        self.subagent_run_id.is_some()
    }
}
