//! Skill registry and the tool dispatch pipeline.
//!
//! Tool-level refusals (unknown tool, blocked tool, invalid input,
//! unavailable skill, rate limit) are returned as strings the LLM can see
//! and adapt to, never raised as errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;

use cg_domain::config::{HealthConfig, RegistryConfig};
use cg_domain::context::CallerContext;
use cg_domain::error::{Error, Result};
use cg_domain::redact::redact;
use cg_domain::tool::ToolDefinition;

use crate::audit::{fire_audit, AuditEntry, AuditSink, NullAuditSink};
use crate::health::SkillHealth;
use crate::ratelimit::RateLimiter;
use crate::skill::Skill;
use crate::validator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A file produced by a tool, referenced by path.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct OutputFile {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// JSON envelope skills use to carry binary/file results alongside text.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultEnvelope {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
}

impl ToolResultEnvelope {
    /// Parse a tool result string as an envelope. Returns `None` for plain
    /// text results or envelopes without files.
    pub fn parse(result: &str) -> Option<Self> {
        let envelope: Self = serde_json::from_str(result).ok()?;
        if envelope.output_files.is_empty() {
            None
        } else {
            Some(envelope)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ToolEntry {
    skill_name: String,
    definition: ToolDefinition,
}

pub struct SkillRegistry {
    config: RegistryConfig,
    skills: RwLock<HashMap<String, Arc<dyn Skill>>>,
    tools: RwLock<HashMap<String, ToolEntry>>,
    health: Arc<SkillHealth>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
}

impl SkillRegistry {
    pub fn new(config: RegistryConfig, health_config: HealthConfig) -> Self {
        Self {
            config,
            skills: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            health: Arc::new(SkillHealth::new(health_config)),
            rate_limiter: Arc::new(RateLimiter::new()),
            audit: Arc::new(NullAuditSink),
        }
    }

    /// Install the audit sink. Call before serving traffic.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn health(&self) -> &Arc<SkillHealth> {
        &self.health
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Register a skill and all its tools. Rejects duplicate skill or tool
    /// names — names are globally unique.
    pub fn register(&self, skill: Arc<dyn Skill>) -> Result<()> {
        let skill_name = skill.name().to_string();
        let definitions = skill.list_tools();

        let mut skills = self.skills.write();
        let mut tools = self.tools.write();

        if skills.contains_key(&skill_name) {
            return Err(Error::Config(format!(
                "skill \"{skill_name}\" is already registered"
            )));
        }
        for def in &definitions {
            if tools.contains_key(&def.name) {
                return Err(Error::Config(format!(
                    "tool \"{}\" is already registered",
                    def.name
                )));
            }
        }

        for def in definitions {
            tracing::debug!(skill = %skill_name, tool = %def.name, "registered tool");
            tools.insert(
                def.name.clone(),
                ToolEntry {
                    skill_name: skill_name.clone(),
                    definition: def,
                },
            );
        }
        skills.insert(skill_name, skill);
        Ok(())
    }

    /// Run every skill's startup hook. Per-skill failures are logged and do
    /// not abort the rest.
    pub async fn startup_all(&self) {
        let skills: Vec<_> = self.skills.read().values().cloned().collect();
        for skill in skills {
            if let Err(e) = skill.startup().await {
                tracing::warn!(skill = skill.name(), error = %e, "skill startup failed");
            }
        }
    }

    /// Run every skill's shutdown hook.
    pub async fn shutdown_all(&self) {
        let skills: Vec<_> = self.skills.read().values().cloned().collect();
        for skill in skills {
            if let Err(e) = skill.shutdown().await {
                tracing::warn!(skill = skill.name(), error = %e, "skill shutdown failed");
            }
        }
    }

    // ── Lookups ────────────────────────────────────────────────────

    /// Tool definitions for the LLM, sorted by name.
    pub fn get_tool_definitions(&self, exclude_main_agent_only: bool) -> Vec<ToolDefinition> {
        let tools = self.tools.read();
        let mut defs: Vec<_> = tools
            .values()
            .filter(|e| !(exclude_main_agent_only && e.definition.main_agent_only))
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn skill_for_tool(&self, tool_name: &str) -> Option<String> {
        self.tools.read().get(tool_name).map(|e| e.skill_name.clone())
    }

    pub fn tool_definition(&self, tool_name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(tool_name).map(|e| e.definition.clone())
    }

    pub fn tool_requires_confirmation(&self, tool_name: &str) -> bool {
        self.tools
            .read()
            .get(tool_name)
            .map(|e| e.definition.requires_confirmation)
            .unwrap_or(false)
    }

    pub fn is_sensitive_tool(&self, tool_name: &str) -> bool {
        self.tools
            .read()
            .get(tool_name)
            .map(|e| e.definition.sensitive)
            .unwrap_or(false)
    }

    pub fn registered_tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn registered_skill_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.skills.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Execute one tool call. Returns `(result_content, is_error)`; every
    /// refusal is a string the LLM sees.
    pub async fn execute_tool_call(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: &CallerContext,
    ) -> (String, bool) {
        // 1. Lookup.
        let (skill_name, definition) = {
            let tools = self.tools.read();
            match tools.get(tool_name) {
                Some(entry) => (entry.skill_name.clone(), entry.definition.clone()),
                None => {
                    return (
                        format!("Unknown tool \"{tool_name}\". Check the available tools."),
                        true,
                    );
                }
            }
        };

        // 2. Main-agent gate.
        if definition.main_agent_only && ctx.is_subagent() {
            tracing::warn!(
                tool = tool_name,
                run_id = ?ctx.subagent_run_id,
                "sub-agent attempted a main-agent-only tool"
            );
            return (
                format!("Tool \"{tool_name}\" is restricted to the main agent only."),
                true,
            );
        }

        // 3. Input validation.
        let sanitized = match validator::validate(input, &definition.input_schema) {
            Ok(v) => v,
            Err(problems) => {
                return (
                    format!(
                        "Invalid input for \"{tool_name}\": {}",
                        problems.join("; ")
                    ),
                    true,
                );
            }
        };

        // 4. Skill availability.
        if !self.health.is_available(&skill_name) {
            return (
                format!(
                    "The \"{skill_name}\" skill is temporarily unavailable after repeated failures. Try again later."
                ),
                true,
            );
        }

        // 5. Per-tool rate limit.
        if let Some(policy) = self.config.tool_rate_limits.get(tool_name) {
            let decision = self.rate_limiter.check(tool_name, &ctx.user_id, policy);
            if !decision.allowed {
                return (
                    format!(
                        "Rate limit reached for \"{tool_name}\". Retry in {} seconds.",
                        decision.retry_after_seconds
                    ),
                    true,
                );
            }
        }

        // 6. Dispatch to the owning skill.
        let skill = match self.skills.read().get(&skill_name) {
            Some(s) => s.clone(),
            None => {
                // Tool index and skill map out of sync — a bug, not a user error.
                tracing::error!(tool = tool_name, skill = %skill_name, "tool registered without skill");
                return (format!("Error executing {tool_name}: skill missing"), true);
            }
        };

        let started = Instant::now();
        let outcome = skill.execute(tool_name, &sanitized, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // 7. Health accounting + 8. audit.
        let (content, is_error, error_text) = match outcome {
            Ok(content) => {
                self.health.record_success(&skill_name);
                (content, false, None)
            }
            Err(e) => {
                let message = redact(&e.to_string());
                self.health.record_failure(&skill_name, &message);
                (
                    format!("Error executing {tool_name}: {message}"),
                    true,
                    Some(message),
                )
            }
        };

        fire_audit(
            self.audit.clone(),
            AuditEntry {
                timestamp: chrono::Utc::now(),
                correlation_id: ctx.correlation_id,
                user_id: ctx.user_id.clone(),
                skill: skill_name,
                tool: tool_name.to_string(),
                sensitive: definition.sensitive,
                ok: !is_error,
                duration_ms,
                error: error_text,
            },
        );

        (content, is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_domain::config::RateLimitPolicy;
    use serde_json::json;

    struct TestSkill {
        name: String,
        tools: Vec<ToolDefinition>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Skill for TestSkill {
        fn name(&self) -> &str {
            &self.name
        }

        fn list_tools(&self) -> Vec<ToolDefinition> {
            self.tools.clone()
        }

        async fn execute(
            &self,
            tool_name: &str,
            input: &Value,
            _ctx: &CallerContext,
        ) -> Result<String> {
            if self.fail {
                return Err(Error::Other("backend exploded at 10.0.0.7".into()));
            }
            Ok(json!({ "tool": tool_name, "echo": input }).to_string())
        }
    }

    fn search_tool() -> ToolDefinition {
        ToolDefinition {
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
            ..ToolDefinition::new("note_search", "Search notes")
        }
    }

    fn spawn_tool() -> ToolDefinition {
        ToolDefinition {
            main_agent_only: true,
            ..ToolDefinition::new("sessions_spawn", "Spawn a sub-agent")
        }
    }

    fn registry() -> SkillRegistry {
        let registry = SkillRegistry::new(RegistryConfig::default(), HealthConfig::default());
        registry
            .register(Arc::new(TestSkill {
                name: "notes".into(),
                tools: vec![search_tool()],
                fail: false,
            }))
            .unwrap();
        registry
            .register(Arc::new(TestSkill {
                name: "sessions".into(),
                tools: vec![spawn_tool()],
                fail: false,
            }))
            .unwrap();
        registry
    }

    fn main_ctx() -> CallerContext {
        CallerContext::for_message("alice", "dm")
    }

    #[test]
    fn duplicate_names_rejected() {
        let r = registry();
        let dup_skill = r.register(Arc::new(TestSkill {
            name: "notes".into(),
            tools: vec![],
            fail: false,
        }));
        assert!(dup_skill.is_err());

        let dup_tool = r.register(Arc::new(TestSkill {
            name: "other".into(),
            tools: vec![search_tool()],
            fail: false,
        }));
        assert!(dup_tool.is_err());
    }

    #[test]
    fn definitions_filter_main_agent_only() {
        let r = registry();
        let all = r.get_tool_definitions(false);
        assert_eq!(all.len(), 2);
        let restricted = r.get_tool_definitions(true);
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].name, "note_search");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_string() {
        let r = registry();
        let (content, is_error) = r
            .execute_tool_call("nope", &json!({}), &main_ctx())
            .await;
        assert!(is_error);
        assert!(content.contains("Unknown tool \"nope\""));
    }

    #[tokio::test]
    async fn subagent_blocked_from_main_agent_tool() {
        let r = registry();
        let ctx = main_ctx().for_subagent(uuid::Uuid::new_v4());
        let (content, is_error) = r
            .execute_tool_call("sessions_spawn", &json!({}), &ctx)
            .await;
        assert!(is_error);
        assert_eq!(
            content,
            "Tool \"sessions_spawn\" is restricted to the main agent only."
        );
    }

    #[tokio::test]
    async fn main_agent_may_use_restricted_tool() {
        let r = registry();
        let (_, is_error) = r
            .execute_tool_call("sessions_spawn", &json!({}), &main_ctx())
            .await;
        assert!(!is_error);
    }

    #[tokio::test]
    async fn invalid_input_enumerates_problems() {
        let r = registry();
        let (content, is_error) = r
            .execute_tool_call("note_search", &json!({}), &main_ctx())
            .await;
        assert!(is_error);
        assert!(content.contains("missing required field \"query\""));
    }

    #[tokio::test]
    async fn successful_dispatch_returns_skill_output() {
        let r = registry();
        let (content, is_error) = r
            .execute_tool_call("note_search", &json!({"query": "api keys"}), &main_ctx())
            .await;
        assert!(!is_error);
        assert!(content.contains("note_search"));
    }

    #[tokio::test]
    async fn skill_error_is_redacted_and_recorded() {
        let r = SkillRegistry::new(RegistryConfig::default(), HealthConfig::default());
        r.register(Arc::new(TestSkill {
            name: "flaky".into(),
            tools: vec![ToolDefinition::new("flaky_op", "Always fails")],
            fail: true,
        }))
        .unwrap();

        let (content, is_error) = r
            .execute_tool_call("flaky_op", &json!({}), &main_ctx())
            .await;
        assert!(is_error);
        assert!(content.starts_with("Error executing flaky_op:"));
        assert!(!content.contains("10.0.0.7"), "IP must be redacted: {content}");

        // Five failures mark the skill unavailable.
        for _ in 0..4 {
            r.execute_tool_call("flaky_op", &json!({}), &main_ctx()).await;
        }
        let (content, _) = r
            .execute_tool_call("flaky_op", &json!({}), &main_ctx())
            .await;
        assert!(content.contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn per_tool_rate_limit_applies() {
        let mut config = RegistryConfig::default();
        config.tool_rate_limits.insert(
            "note_search".into(),
            RateLimitPolicy {
                max_requests: 1,
                window_seconds: 60,
            },
        );
        let r = SkillRegistry::new(config, HealthConfig::default());
        r.register(Arc::new(TestSkill {
            name: "notes".into(),
            tools: vec![search_tool()],
            fail: false,
        }))
        .unwrap();

        let input = json!({"query": "x"});
        let (_, first_err) = r.execute_tool_call("note_search", &input, &main_ctx()).await;
        assert!(!first_err);
        let (content, second_err) = r.execute_tool_call("note_search", &input, &main_ctx()).await;
        assert!(second_err);
        assert!(content.contains("Rate limit reached"));
    }

    #[test]
    fn envelope_parsing() {
        let plain = ToolResultEnvelope::parse("no files here");
        assert!(plain.is_none());

        let json_no_files = ToolResultEnvelope::parse(r#"{"content": "hi"}"#);
        assert!(json_no_files.is_none());

        let with_files = ToolResultEnvelope::parse(
            r#"{"content": "rendered", "output_files": [{"name": "a.png", "path": "/tmp/a.png", "media_type": "image/png"}]}"#,
        )
        .unwrap();
        assert_eq!(with_files.content, "rendered");
        assert_eq!(with_files.output_files.len(), 1);
        assert_eq!(with_files.output_files[0].name, "a.png");
    }
}
