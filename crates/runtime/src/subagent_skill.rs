//! The built-in `sessions` skill — the LLM-facing bridge to the
//! [`SubagentManager`]. Every tool here is main-agent-only: combined with
//! the manager's recursion guard, a sub-agent can never reach another
//! sub-agent.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use cg_domain::context::CallerContext;
use cg_domain::error::Result;
use cg_domain::tool::ToolDefinition;
use cg_skills::skill::{Skill, SkillKind};

use crate::subagent::{SpawnOptions, SubagentManager};

pub struct SubagentSkill {
    manager: Arc<SubagentManager>,
}

impl SubagentSkill {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }

    fn options_from(&self, input: &Value) -> SpawnOptions {
        SpawnOptions {
            preferred_model: input
                .get("model")
                .and_then(|v| v.as_str())
                .map(String::from),
            timeout_ms: input
                .get("timeout_minutes")
                .and_then(|v| v.as_u64())
                .map(|m| m * 60_000),
            ..SpawnOptions::default()
        }
    }
}

#[async_trait::async_trait]
impl Skill for SubagentSkill {
    fn name(&self) -> &str {
        "sessions"
    }

    fn kind(&self) -> SkillKind {
        SkillKind::Integration
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task": { "type": "string", "maxLength": 4000 },
                        "model": { "type": "string" },
                        "timeout_minutes": { "type": "number", "minimum": 1, "maximum": 120 }
                    },
                    "required": ["task"]
                }),
                permission_tier: 1,
                main_agent_only: true,
                ..ToolDefinition::new(
                    "sessions_spawn",
                    "Start a background sub-agent for a task. Returns immediately; the \
                     result is announced to this channel when the sub-agent finishes.",
                )
            },
            ToolDefinition {
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "task": { "type": "string", "maxLength": 4000 },
                        "model": { "type": "string" }
                    },
                    "required": ["task"]
                }),
                permission_tier: 1,
                main_agent_only: true,
                ..ToolDefinition::new(
                    "sessions_run",
                    "Delegate a task to a sub-agent and wait for its answer.",
                )
            },
            ToolDefinition {
                permission_tier: 0,
                main_agent_only: true,
                ..ToolDefinition::new("sessions_list", "List your sub-agent runs and their status.")
            },
            ToolDefinition {
                input_schema: json!({
                    "type": "object",
                    "properties": { "run_id": { "type": "string" } },
                    "required": ["run_id"]
                }),
                permission_tier: 1,
                main_agent_only: true,
                ..ToolDefinition::new("sessions_stop", "Cancel a running sub-agent.")
            },
            ToolDefinition {
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "run_id": { "type": "string" },
                        "message": { "type": "string", "maxLength": 4000 }
                    },
                    "required": ["run_id", "message"]
                }),
                permission_tier: 1,
                main_agent_only: true,
                ..ToolDefinition::new(
                    "sessions_send",
                    "Send a follow-up message to a running sub-agent.",
                )
            },
        ]
    }

    async fn execute(&self, tool_name: &str, input: &Value, ctx: &CallerContext) -> Result<String> {
        match tool_name {
            "sessions_spawn" => {
                let task = input.get("task").and_then(|v| v.as_str()).unwrap_or("");
                match self.manager.spawn(ctx, task, self.options_from(input)) {
                    Ok(run_id) => Ok(json!({
                        "status": "accepted",
                        "run_id": run_id,
                        "note": "The result will be announced here when the sub-agent finishes."
                    })
                    .to_string()),
                    Err(e) => Ok(e.to_string()),
                }
            }
            "sessions_run" => {
                let task = input.get("task").and_then(|v| v.as_str()).unwrap_or("");
                match self
                    .manager
                    .delegate_sync(ctx, task, self.options_from(input))
                    .await
                {
                    Ok(result) => Ok(result),
                    Err(e) => Ok(format!("Sub-agent failed: {e}")),
                }
            }
            "sessions_list" => {
                let runs: Vec<Value> = self
                    .manager
                    .list_runs(&ctx.user_id)
                    .into_iter()
                    .map(|r| {
                        json!({
                            "run_id": r.id,
                            "status": r.status,
                            "mode": r.mode,
                            "task": r.task,
                            "created_at": r.created_at,
                            "tool_calls": r.tool_call_count,
                        })
                    })
                    .collect();
                Ok(json!({ "runs": runs, "count": runs.len() }).to_string())
            }
            "sessions_stop" => {
                let Some(run_id) = parse_run_id(input) else {
                    return Ok("Invalid run_id.".into());
                };
                match self.manager.stop_run(&ctx.user_id, run_id) {
                    Ok(true) => Ok(json!({ "stopped": run_id }).to_string()),
                    Ok(false) => Ok(format!("No run found with id {run_id}.")),
                    Err(e) => Ok(e.to_string()),
                }
            }
            "sessions_send" => {
                let Some(run_id) = parse_run_id(input) else {
                    return Ok("Invalid run_id.".into());
                };
                let message = input.get("message").and_then(|v| v.as_str()).unwrap_or("");
                match self.manager.send_to_run(&ctx.user_id, run_id, message) {
                    Ok(true) => Ok(json!({ "delivered": run_id }).to_string()),
                    Ok(false) => Ok(format!("Run {run_id} is not accepting messages.")),
                    Err(e) => Ok(e.to_string()),
                }
            }
            other => Ok(format!("Unknown sessions tool \"{other}\".")),
        }
    }
}

fn parse_run_id(input: &Value) -> Option<Uuid> {
    input
        .get("run_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
