//! Runtime configuration.
//!
//! Loading (files, env) is the embedding application's job; these structs
//! only define the shape and the defaults. Every field is individually
//! defaulted so partial configs deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
    #[serde(default)]
    pub confirmations: ConfirmationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How sensitive tools are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveToolPolicy {
    /// Sensitive tools require a confirmation token like destructive ones.
    #[default]
    AlwaysConfirm,
    /// Sensitive tools execute directly but are flagged in audit.
    AuditOnly,
}

/// One few-shot exchange appended to the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Messages longer than this are refused before any LLM call.
    #[serde(default = "d_4000")]
    pub max_message_chars: usize,
    /// Per-turn tool call cap.
    #[serde(default = "d_10")]
    pub max_tool_calls_per_turn: u32,
    /// Session-wide tool call cap within the sliding window.
    #[serde(default = "d_50")]
    pub session_tool_call_cap: u32,
    /// Sliding window for the session cap, in seconds.
    #[serde(default = "d_3600")]
    pub session_window_seconds: u64,
    /// Per-tool-call execution timeout.
    #[serde(default = "d_30")]
    pub tool_timeout_seconds: u64,
    /// `max_tokens` passed to the provider on each call.
    #[serde(default = "d_4096")]
    pub max_tokens: u32,
    #[serde(default)]
    pub sensitive_tool_policy: SensitiveToolPolicy,
    /// Always-on context notes appended to the system prompt.
    #[serde(default)]
    pub context_notes: Option<String>,
    /// Guidance appended when code-execution tools are registered.
    #[serde(default)]
    pub code_execution_guidance: Option<String>,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    /// How many memory snippets to retrieve into the system prompt.
    #[serde(default = "d_5u")]
    pub memory_snippet_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 4_000,
            max_tool_calls_per_turn: 10,
            session_tool_call_cap: 50,
            session_window_seconds: 3_600,
            tool_timeout_seconds: 30,
            max_tokens: 4_096,
            sensitive_tool_policy: SensitiveToolPolicy::AlwaysConfirm,
            context_notes: None,
            code_execution_guidance: None,
            few_shot_examples: Vec::new(),
            memory_snippet_limit: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tier routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Messages shorter than this with no complexity signal stay light.
    #[serde(default = "d_400")]
    pub light_max_chars: usize,
    /// Tool names whose availability (or mid-turn use) escalates to heavy.
    #[serde(default)]
    pub heavy_tool_hints: Vec<String>,
    /// Extra regex patterns that force the heavy tier.
    #[serde(default)]
    pub extra_heavy_patterns: Vec<String>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            light_max_chars: 400,
            heavy_tool_hints: Vec::new(),
            extra_heavy_patterns: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Concurrent async runs allowed per user.
    #[serde(default = "d_3")]
    pub max_per_user: u32,
    /// Concurrent async runs allowed across all users.
    #[serde(default = "d_10")]
    pub max_global: u32,
    /// Spawn-rate policy per user.
    #[serde(default = "d_spawn_rate")]
    pub spawn_rate: RateLimitPolicy,
    /// Wall-clock deadline for async runs.
    #[serde(default = "d_600")]
    pub default_timeout_seconds: u64,
    /// Deadline for synchronous delegation.
    #[serde(default = "d_300")]
    pub sync_timeout_seconds: u64,
    /// Tool call cap inside one run.
    #[serde(default = "d_15")]
    pub max_tool_calls: u32,
    /// Per-tool-call execution timeout inside a run.
    #[serde(default = "d_30")]
    pub tool_timeout_seconds: u64,
    /// Input+output token budget for one run.
    #[serde(default = "d_100_000")]
    pub max_token_budget: u32,
    #[serde(default = "d_200u")]
    pub max_transcript_entries: usize,
    /// Completed runs linger this long before the sweep removes them.
    #[serde(default = "d_3600")]
    pub archive_ttl_seconds: u64,
    #[serde(default = "d_300")]
    pub cleanup_interval_seconds: u64,
    /// Announcement messages are truncated to this many characters.
    #[serde(default = "d_1800")]
    pub announce_max_chars: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_user: 3,
            max_global: 10,
            spawn_rate: d_spawn_rate(),
            default_timeout_seconds: 600,
            sync_timeout_seconds: 300,
            max_tool_calls: 15,
            tool_timeout_seconds: 30,
            max_token_budget: 100_000,
            max_transcript_entries: 200,
            archive_ttl_seconds: 3_600,
            cleanup_interval_seconds: 300,
            announce_max_chars: 1_800,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Confirmations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Token time-to-live. Capped at five minutes by the manager.
    #[serde(default = "d_300")]
    pub ttl_seconds: u64,
    /// Cadence of the expired-token sweep.
    #[serde(default = "d_300")]
    pub cleanup_interval_seconds: u64,
    /// Rate limit on confirmation attempts per user.
    #[serde(default = "d_confirm_rate")]
    pub attempt_rate: RateLimitPolicy,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            cleanup_interval_seconds: 300,
            attempt_rate: d_confirm_rate(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-task evaluations.
    #[serde(default = "d_30")]
    pub tick_seconds: u64,
    /// IANA timezone name for cron evaluation. Invalid names fall back to UTC.
    #[serde(default = "d_utc")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            timezone: "UTC".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History / compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries kept per (user, channel) key before eviction.
    #[serde(default = "d_200u")]
    pub capacity: usize,
    /// Compaction runs once the entry count exceeds this.
    #[serde(default = "d_40u")]
    pub compact_threshold: usize,
    /// How many of the oldest entries one compaction collapses.
    #[serde(default = "d_20u")]
    pub compact_batch: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            compact_threshold: 40,
            compact_batch: 20,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "d_3")]
    pub degraded_threshold: u32,
    #[serde(default = "d_5")]
    pub unavailable_threshold: u32,
    #[serde(default = "d_300")]
    pub recovery_window_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            unavailable_threshold: 5,
            recovery_window_seconds: 300,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry & rate limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A sliding-window rate limit policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Optional per-tool rate limits, keyed by tool name, applied per user.
    #[serde(default)]
    pub tool_rate_limits: HashMap<String, RateLimitPolicy>,
}

// ── serde default helpers ──────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> u32 {
    10
}
fn d_15() -> u32 {
    15
}
fn d_50() -> u32 {
    50
}
fn d_4096() -> u32 {
    4_096
}
fn d_100_000() -> u32 {
    100_000
}
fn d_30() -> u64 {
    30
}
fn d_300() -> u64 {
    300
}
fn d_600() -> u64 {
    600
}
fn d_3600() -> u64 {
    3_600
}
fn d_5u() -> usize {
    5
}
fn d_20u() -> usize {
    20
}
fn d_40u() -> usize {
    40
}
fn d_200u() -> usize {
    200
}
fn d_400() -> usize {
    400
}
fn d_1800() -> usize {
    1_800
}
fn d_4000() -> usize {
    4_000
}
fn d_utc() -> String {
    "UTC".into()
}
fn d_spawn_rate() -> RateLimitPolicy {
    RateLimitPolicy {
        max_requests: 10,
        window_seconds: 3_600,
    }
}
fn d_confirm_rate() -> RateLimitPolicy {
    RateLimitPolicy {
        max_requests: 10,
        window_seconds: 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.orchestrator.max_message_chars, 4_000);
        assert_eq!(config.orchestrator.max_tool_calls_per_turn, 10);
        assert_eq!(config.orchestrator.session_tool_call_cap, 50);
        assert_eq!(config.subagents.max_per_user, 3);
        assert_eq!(config.confirmations.ttl_seconds, 300);
        assert_eq!(config.health.unavailable_threshold, 5);
        assert_eq!(config.scheduler.timezone, "UTC");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"subagents": {"max_per_user": 1}}"#).unwrap();
        assert_eq!(config.subagents.max_per_user, 1);
        assert_eq!(config.subagents.max_global, 10);
        assert!(config.subagents.enabled);
    }

    #[test]
    fn sensitive_policy_default_is_confirm() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.sensitive_tool_policy, SensitiveToolPolicy::AlwaysConfirm);
    }
}
