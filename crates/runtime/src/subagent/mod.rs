//! Sub-agent lifecycle manager.
//!
//! Async runs are accepted, executed on the runtime's task pool under a
//! wall-clock deadline, and announced back to their channel when they
//! finish. Sync delegation runs the same inner loop inside the caller's
//! turn. Spawning is gated: feature flag, recursion guard, spawn rate,
//! per-user and global caps.

pub mod inner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use cg_domain::cancel::CancelToken;
use cg_domain::config::SubagentConfig;
use cg_domain::context::CallerContext;
use cg_domain::error::{Error, Result};
use cg_domain::event::{topics, Event, Severity};
use cg_domain::redact::redact;
use cg_providers::manager::{ProviderManager, ProviderSelection};
use cg_providers::tiering::MessageTier;
use cg_skills::ratelimit::RateLimiter;
use cg_skills::registry::SkillRegistry;

use crate::bus::EventBus;
use crate::hooks::Announcer;
use inner::{run_inner, InnerAgentParams, TranscriptEntry, SAFETY_PREAMBLE};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Accepted,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl SubagentStatus {
    /// Counts against the per-user and global concurrency caps.
    fn is_active(self) -> bool {
        matches!(self, Self::Accepted | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentMode {
    Sync,
    Async,
}

/// Snapshot of one run. Lives in memory; completed runs linger until the
/// archive TTL sweep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubagentRun {
    pub id: Uuid,
    pub user_id: String,
    pub channel: String,
    pub task: String,
    pub status: SubagentStatus,
    pub mode: SubagentMode,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tool_call_count: u32,
    pub timeout_ms: u64,
    pub transcript: Vec<TranscriptEntry>,
    pub allowed_skills: Option<Vec<String>>,
    pub blocked_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Caller-supplied knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// `"provider/model"` override.
    pub preferred_model: Option<String>,
    /// Extra instructions appended after the safety preamble.
    pub system_prompt: Option<String>,
    pub timeout_ms: Option<u64>,
    pub allowed_skills: Option<Vec<String>>,
    pub blocked_tools: Vec<String>,
    pub max_tool_calls: Option<u32>,
    pub max_token_budget: Option<u32>,
}

struct RunSlot {
    record: RwLock<SubagentRun>,
    cancel: CancelToken,
    timeout_handle: Mutex<Option<JoinHandle<()>>>,
    queue: Mutex<Vec<String>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Clones share the active-run map; executor, deadline, and sweeper tasks
/// each capture their own clone.
#[derive(Clone)]
pub struct SubagentManager {
    config: SubagentConfig,
    registry: Arc<SkillRegistry>,
    providers: Arc<dyn ProviderManager>,
    bus: Arc<EventBus>,
    announcer: Arc<dyn Announcer>,
    rate_limiter: Arc<RateLimiter>,
    runs: Arc<RwLock<HashMap<Uuid, Arc<RunSlot>>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SubagentManager {
    pub fn new(
        config: SubagentConfig,
        registry: Arc<SkillRegistry>,
        providers: Arc<dyn ProviderManager>,
        bus: Arc<EventBus>,
        announcer: Arc<dyn Announcer>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            registry,
            providers,
            bus,
            announcer,
            rate_limiter,
            runs: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    // ── Validation ─────────────────────────────────────────────────

    /// The spawn gate, in strict order: feature flag, recursion guard,
    /// spawn rate, per-user cap, global cap.
    pub fn validate_spawn(&self, ctx: &CallerContext) -> Result<()> {
        if !self.config.enabled {
            return Err(Error::Subagent("Sub-agents are disabled.".into()));
        }
        if ctx.is_subagent() {
            return Err(Error::Subagent(
                "A sub-agent cannot spawn another sub-agent.".into(),
            ));
        }
        let decision =
            self.rate_limiter
                .check("subagent_spawn", &ctx.user_id, &self.config.spawn_rate);
        if !decision.allowed {
            return Err(Error::Subagent(format!(
                "Sub-agent spawn rate limit reached. Retry in {} seconds.",
                decision.retry_after_seconds
            )));
        }
        let (user_active, global_active) = self.active_counts(&ctx.user_id);
        if user_active >= self.config.max_per_user {
            return Err(Error::Subagent(format!(
                "You already have {user_active} sub-agents active (limit {}).",
                self.config.max_per_user
            )));
        }
        if global_active >= self.config.max_global {
            return Err(Error::Subagent(
                "The system is at its sub-agent capacity. Try again shortly.".into(),
            ));
        }
        Ok(())
    }

    fn active_counts(&self, user_id: &str) -> (u32, u32) {
        let runs = self.runs.read();
        let mut user = 0;
        let mut global = 0;
        for slot in runs.values() {
            let record = slot.record.read();
            if record.status.is_active() {
                global += 1;
                if record.user_id == user_id {
                    user += 1;
                }
            }
        }
        (user, global)
    }

    // ── Async spawn ────────────────────────────────────────────────

    /// Accept an async run and return its id immediately. The result is
    /// announced on the originating channel when the run finishes.
    pub fn spawn(&self, ctx: &CallerContext, task: &str, options: SpawnOptions) -> Result<Uuid> {
        self.validate_spawn(ctx)?;
        let selection = self.select_provider(&ctx.user_id, &options)?;

        let run_id = Uuid::new_v4();
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.config.default_timeout_seconds * 1_000);
        let slot = self.install_run(run_id, ctx, task, SubagentMode::Async, timeout_ms, &selection, &options);

        self.bus.publish(
            Event::new(topics::SUBAGENT_SPAWNED, "subagent", Severity::Low)
                .with("runId", serde_json::json!(run_id))
                .with("userId", serde_json::json!(ctx.user_id)),
        );

        // Wall-clock deadline, independent of the executor.
        let manager = self.clone();
        let deadline_slot = slot.clone();
        let channel = ctx.channel.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            manager.fire_timeout(run_id, &deadline_slot, &channel);
        });
        *slot.timeout_handle.lock() = Some(timeout_task);

        // Executor.
        let manager = self.clone();
        let child_ctx = ctx.for_subagent(run_id);
        let task_text = task.to_string();
        tokio::spawn(async move {
            manager
                .run_async(run_id, slot, child_ctx, task_text, selection, options)
                .await;
        });

        Ok(run_id)
    }

    async fn run_async(
        self,
        run_id: Uuid,
        slot: Arc<RunSlot>,
        ctx: CallerContext,
        task: String,
        selection: ProviderSelection,
        options: SpawnOptions,
    ) {
        {
            let mut record = slot.record.write();
            record.status = SubagentStatus::Running;
            record.started_at = Some(Utc::now());
        }
        self.bus.publish(
            Event::new(topics::SUBAGENT_RUNNING, "subagent", Severity::Low)
                .with("runId", serde_json::json!(run_id)),
        );

        let params = self.inner_params(&selection, &options, slot.cancel.clone());
        let queue_slot = slot.clone();
        let outcome = run_inner(&self.registry, params, &task, &ctx, move || {
            queue_slot.queue.lock().drain(..).collect()
        })
        .await;

        // Clear the deadline; the run is settled one way or the other.
        if let Some(handle) = slot.timeout_handle.lock().take() {
            handle.abort();
        }

        let channel = slot.record.read().channel.clone();
        match outcome {
            Ok(outcome) => {
                self.providers.track_usage(
                    selection.provider.provider_id(),
                    &selection.model,
                    outcome.usage,
                    None,
                );
                let announce = {
                    let mut record = slot.record.write();
                    if !record.status.is_active() {
                        // Timeout or cancellation won the race; keep it.
                        false
                    } else {
                        record.status = SubagentStatus::Completed;
                        record.result = Some(outcome.final_text.clone());
                        record.input_tokens = outcome.usage.input_tokens;
                        record.output_tokens = outcome.usage.output_tokens;
                        record.tool_call_count = outcome.tool_call_count;
                        record.transcript = outcome.transcript;
                        record.completed_at = Some(Utc::now());
                        true
                    }
                };
                if announce {
                    self.bus.publish(
                        Event::new(topics::SUBAGENT_COMPLETED, "subagent", Severity::Low)
                            .with("runId", serde_json::json!(run_id)),
                    );
                    self.fire_announcement(
                        &channel,
                        &format!("Sub-agent task complete: {}", outcome.final_text),
                    );
                }
            }
            Err(e) => {
                let message = redact(&e.to_string());
                let announce = {
                    let mut record = slot.record.write();
                    if !record.status.is_active() {
                        false
                    } else {
                        record.status = SubagentStatus::Failed;
                        record.error = Some(message.clone());
                        record.completed_at = Some(Utc::now());
                        true
                    }
                };
                if announce {
                    self.bus.publish(
                        Event::new(topics::SUBAGENT_FAILED, "subagent", Severity::Medium)
                            .with("runId", serde_json::json!(run_id))
                            .with("error", serde_json::json!(message)),
                    );
                    self.fire_announcement(&channel, &format!("Sub-agent task failed: {message}"));
                }
            }
        }
    }

    fn fire_timeout(&self, run_id: Uuid, slot: &Arc<RunSlot>, channel: &str) {
        let timed_out = {
            let mut record = slot.record.write();
            if record.status.is_active() {
                record.status = SubagentStatus::Timeout;
                record.completed_at = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if !timed_out {
            return;
        }
        slot.cancel.cancel();
        tracing::warn!(%run_id, "sub-agent run hit its wall-clock deadline");
        self.bus.publish(
            Event::new(topics::SUBAGENT_TIMEOUT, "subagent", Severity::Medium)
                .with("runId", serde_json::json!(run_id)),
        );
        let timeout_ms = slot.record.read().timeout_ms;
        self.fire_announcement(
            channel,
            &format!(
                "Sub-agent task timed out after {} seconds.",
                timeout_ms / 1_000
            ),
        );
    }

    // ── Sync delegation ────────────────────────────────────────────

    /// Run a sub-agent inside the caller's turn and return its sanitized
    /// result, wrapped in `<subagent_result>` delimiters.
    pub async fn delegate_sync(
        &self,
        ctx: &CallerContext,
        task: &str,
        options: SpawnOptions,
    ) -> Result<String> {
        self.validate_spawn(ctx)?;
        let selection = self.select_provider(&ctx.user_id, &options)?;

        let run_id = Uuid::new_v4();
        let timeout_ms = self.config.sync_timeout_seconds * 1_000;
        let slot = self.install_run(run_id, ctx, task, SubagentMode::Sync, timeout_ms, &selection, &options);
        {
            let mut record = slot.record.write();
            record.status = SubagentStatus::Running;
            record.started_at = Some(Utc::now());
        }
        self.bus.publish(
            Event::new(topics::SUBAGENT_RUNNING, "subagent", Severity::Low)
                .with("runId", serde_json::json!(run_id)),
        );

        let params = self.inner_params(&selection, &options, slot.cancel.clone());
        let child_ctx = ctx.for_subagent(run_id);
        let queue_slot = slot.clone();
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            run_inner(&self.registry, params, task, &child_ctx, move || {
                queue_slot.queue.lock().drain(..).collect()
            }),
        )
        .await;

        match outcome {
            Ok(Ok(outcome)) => {
                self.providers.track_usage(
                    selection.provider.provider_id(),
                    &selection.model,
                    outcome.usage,
                    None,
                );
                {
                    let mut record = slot.record.write();
                    record.status = SubagentStatus::Completed;
                    record.result = Some(outcome.final_text.clone());
                    record.input_tokens = outcome.usage.input_tokens;
                    record.output_tokens = outcome.usage.output_tokens;
                    record.tool_call_count = outcome.tool_call_count;
                    record.transcript = outcome.transcript;
                    record.completed_at = Some(Utc::now());
                }
                self.bus.publish(
                    Event::new(topics::SUBAGENT_COMPLETED, "subagent", Severity::Low)
                        .with("runId", serde_json::json!(run_id)),
                );
                Ok(format!(
                    "<subagent_result>\n{}\n</subagent_result>",
                    outcome.final_text
                ))
            }
            Ok(Err(e)) => {
                let message = redact(&e.to_string());
                {
                    let mut record = slot.record.write();
                    record.status = SubagentStatus::Failed;
                    record.error = Some(message.clone());
                    record.completed_at = Some(Utc::now());
                }
                self.bus.publish(
                    Event::new(topics::SUBAGENT_FAILED, "subagent", Severity::Medium)
                        .with("runId", serde_json::json!(run_id))
                        .with("error", serde_json::json!(message)),
                );
                Err(Error::Subagent(message))
            }
            Err(_) => {
                slot.cancel.cancel();
                {
                    let mut record = slot.record.write();
                    record.status = SubagentStatus::Timeout;
                    record.completed_at = Some(Utc::now());
                }
                self.bus.publish(
                    Event::new(topics::SUBAGENT_TIMEOUT, "subagent", Severity::Medium)
                        .with("runId", serde_json::json!(run_id)),
                );
                Err(Error::Timeout(format!(
                    "sub-agent did not finish within {} seconds",
                    self.config.sync_timeout_seconds
                )))
            }
        }
    }

    // ── Run control ────────────────────────────────────────────────

    /// Cancel a run. `Ok(false)` for an unknown id; an ownership mismatch
    /// is an error.
    pub fn stop_run(&self, user_id: &str, run_id: Uuid) -> Result<bool> {
        let slot = match self.runs.read().get(&run_id) {
            Some(slot) => slot.clone(),
            None => return Ok(false),
        };
        {
            let record = slot.record.read();
            if record.user_id != user_id {
                return Err(Error::Subagent(
                    "You do not own this sub-agent run.".into(),
                ));
            }
        }
        let cancelled = {
            let mut record = slot.record.write();
            if record.status.is_active() {
                record.status = SubagentStatus::Cancelled;
                record.completed_at = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if cancelled {
            slot.cancel.cancel();
            if let Some(handle) = slot.timeout_handle.lock().take() {
                handle.abort();
            }
            self.bus.publish(
                Event::new(topics::SUBAGENT_CANCELLED, "subagent", Severity::Low)
                    .with("runId", serde_json::json!(run_id)),
            );
        }
        Ok(true)
    }

    /// Queue a message for a running run. Delivered between loop
    /// iterations. `Ok(false)` when the run is not running.
    pub fn send_to_run(&self, user_id: &str, run_id: Uuid, message: &str) -> Result<bool> {
        let slot = match self.runs.read().get(&run_id) {
            Some(slot) => slot.clone(),
            None => return Ok(false),
        };
        {
            let record = slot.record.read();
            if record.user_id != user_id {
                return Err(Error::Subagent(
                    "You do not own this sub-agent run.".into(),
                ));
            }
            if record.status != SubagentStatus::Running {
                return Ok(false);
            }
        }
        slot.queue.lock().push(message.to_owned());
        Ok(true)
    }

    /// The caller's runs (active and archived), newest first.
    pub fn list_runs(&self, user_id: &str) -> Vec<SubagentRun> {
        let runs = self.runs.read();
        let mut rows: Vec<SubagentRun> = runs
            .values()
            .map(|slot| slot.record.read().clone())
            .filter(|r| r.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn get_run(&self, user_id: &str, run_id: Uuid) -> Option<SubagentRun> {
        let runs = self.runs.read();
        let record = runs.get(&run_id)?.record.read().clone();
        if record.user_id == user_id {
            Some(record)
        } else {
            None
        }
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// Remove completed runs past the archive TTL.
    pub fn cleanup_archived(&self) {
        let ttl = chrono::Duration::seconds(self.config.archive_ttl_seconds as i64);
        let cutoff = Utc::now() - ttl;
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, slot| {
            let record = slot.record.read();
            match record.completed_at {
                Some(at) => at > cutoff,
                None => true,
            }
        });
        let removed = before - runs.len();
        if removed > 0 {
            tracing::debug!(removed, "archived sub-agent runs swept");
        }
    }

    pub fn start_sweeper(&self) {
        let manager = self.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.cleanup_archived();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let runs = self.runs.read();
        for slot in runs.values() {
            slot.cancel.cancel();
            if let Some(handle) = slot.timeout_handle.lock().take() {
                handle.abort();
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn select_provider(&self, user_id: &str, options: &SpawnOptions) -> Result<ProviderSelection> {
        if let Some(spec) = &options.preferred_model {
            return self.providers.resolve_spec(spec);
        }
        if self.providers.is_tier_enabled() {
            return self.providers.get_for_user_tiered(user_id, MessageTier::Heavy);
        }
        self.providers.get_for_user(user_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn install_run(
        &self,
        run_id: Uuid,
        ctx: &CallerContext,
        task: &str,
        mode: SubagentMode,
        timeout_ms: u64,
        selection: &ProviderSelection,
        options: &SpawnOptions,
    ) -> Arc<RunSlot> {
        let record = SubagentRun {
            id: run_id,
            user_id: ctx.user_id.clone(),
            channel: ctx.channel.clone(),
            task: task.to_owned(),
            status: SubagentStatus::Accepted,
            mode,
            model: Some(selection.model.clone()),
            provider: Some(selection.provider.provider_id().to_owned()),
            result: None,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            tool_call_count: 0,
            timeout_ms,
            transcript: Vec::new(),
            allowed_skills: options.allowed_skills.clone(),
            blocked_tools: options.blocked_tools.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let slot = Arc::new(RunSlot {
            record: RwLock::new(record),
            cancel: CancelToken::new(),
            timeout_handle: Mutex::new(None),
            queue: Mutex::new(Vec::new()),
        });
        self.runs.write().insert(run_id, slot.clone());
        slot
    }

    fn inner_params(
        &self,
        selection: &ProviderSelection,
        options: &SpawnOptions,
        cancel: CancelToken,
    ) -> InnerAgentParams {
        let mut system_prompt = SAFETY_PREAMBLE.to_string();
        system_prompt.push_str("\n\nComplete the delegated task and reply with a concise final answer.");
        if let Some(extra) = &options.system_prompt {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(extra);
        }
        InnerAgentParams {
            system_prompt,
            selection: selection.clone(),
            allowed_skills: options.allowed_skills.clone(),
            blocked_tools: options.blocked_tools.clone(),
            max_tool_calls: options.max_tool_calls.unwrap_or(self.config.max_tool_calls),
            tool_timeout: Duration::from_secs(self.config.tool_timeout_seconds),
            max_token_budget: options
                .max_token_budget
                .unwrap_or(self.config.max_token_budget),
            max_tokens_per_call: 4_096,
            max_transcript_entries: self.config.max_transcript_entries,
            cancel,
        }
    }

    fn fire_announcement(&self, channel: &str, message: &str) {
        let message = truncate_announcement(message, self.config.announce_max_chars);
        let announcer = self.announcer.clone();
        let channel = channel.to_owned();
        tokio::spawn(async move {
            announcer.announce(&channel, &message).await;
        });
    }
}

/// Truncate to `max` characters, appending a marker when clipped.
fn truncate_announcement(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_owned();
    }
    let clipped: String = message.chars().take(max).collect();
    format!("{clipped} (truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_domain::config::{HealthConfig, RateLimitPolicy, RegistryConfig};
    use cg_domain::tool::{StopReason, Usage};
    use cg_providers::manager::ProviderRegistry;
    use cg_providers::traits::{ChatRequest, ChatResponse, LlmProvider};
    use std::collections::VecDeque;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<ChatResponse>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn replying(text: &str) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from([reply(text)])),
                delay: None,
            }
        }

        fn slow() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                delay: Some(Duration::from_secs(60)),
            }
        }
    }

    fn reply(text: &str) -> ChatResponse {
        ChatResponse {
            text: Some(text.to_owned()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            model: "test-model".into(),
            provider: "scripted".into(),
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| reply("done")))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    struct RecordingAnnouncer {
        messages: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn announce(&self, channel: &str, message: &str) {
            self.messages.lock().push((channel.into(), message.into()));
        }
    }

    struct Harness {
        manager: Arc<SubagentManager>,
        announcer: Arc<RecordingAnnouncer>,
    }

    fn harness_with(config: SubagentConfig, provider: ScriptedProvider) -> Harness {
        let registry = Arc::new(SkillRegistry::new(
            RegistryConfig::default(),
            HealthConfig::default(),
        ));
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(Arc::new(provider), "test-model");
        let announcer = Arc::new(RecordingAnnouncer {
            messages: Mutex::new(Vec::new()),
        });
        let manager = Arc::new(SubagentManager::new(
            config,
            registry,
            providers,
            Arc::new(EventBus::new()),
            announcer.clone(),
            Arc::new(RateLimiter::new()),
        ));
        Harness { manager, announcer }
    }

    fn harness() -> Harness {
        harness_with(SubagentConfig::default(), ScriptedProvider::replying("all done"))
    }

    fn ctx() -> CallerContext {
        CallerContext::for_message("alice", "dm")
    }

    async fn wait_for_status(
        manager: &Arc<SubagentManager>,
        run_id: Uuid,
        status: SubagentStatus,
    ) -> SubagentRun {
        for _ in 0..400 {
            if let Some(run) = manager.get_run("alice", run_id) {
                if run.status == status {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never reached {status:?}");
    }

    #[tokio::test]
    async fn recursion_guard_blocks_subagent_context() {
        let h = harness();
        let nested = ctx().for_subagent(Uuid::new_v4());
        let err = h.manager.validate_spawn(&nested).unwrap_err();
        assert!(err.to_string().contains("cannot spawn"));
    }

    #[tokio::test]
    async fn disabled_feature_blocks_spawn() {
        let h = harness_with(
            SubagentConfig {
                enabled: false,
                ..SubagentConfig::default()
            },
            ScriptedProvider::replying("x"),
        );
        assert!(h.manager.validate_spawn(&ctx()).is_err());
    }

    #[tokio::test]
    async fn spawn_rate_limit_applies() {
        let h = harness_with(
            SubagentConfig {
                spawn_rate: RateLimitPolicy {
                    max_requests: 1,
                    window_seconds: 3_600,
                },
                ..SubagentConfig::default()
            },
            ScriptedProvider::replying("x"),
        );
        assert!(h.manager.validate_spawn(&ctx()).is_ok());
        let err = h.manager.validate_spawn(&ctx()).unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn async_run_completes_and_announces() {
        let h = harness();
        let run_id = h
            .manager
            .spawn(&ctx(), "summarize the inbox", SpawnOptions::default())
            .unwrap();
        let run = wait_for_status(&h.manager, run_id, SubagentStatus::Completed).await;

        assert_eq!(run.mode, SubagentMode::Async);
        assert_eq!(run.result.as_deref(), Some("all done"));
        assert_eq!(run.input_tokens, 10);
        assert!(run.completed_at.is_some());

        for _ in 0..200 {
            if !h.announcer.messages.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let messages = h.announcer.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "dm");
        assert!(messages[0].1.contains("all done"));
    }

    #[tokio::test]
    async fn wall_clock_timeout_cancels_and_announces() {
        let h = harness_with(SubagentConfig::default(), ScriptedProvider::slow());
        let run_id = h
            .manager
            .spawn(
                &ctx(),
                "never finishes",
                SpawnOptions {
                    timeout_ms: Some(50),
                    ..SpawnOptions::default()
                },
            )
            .unwrap();
        let run = wait_for_status(&h.manager, run_id, SubagentStatus::Timeout).await;
        assert_eq!(run.status, SubagentStatus::Timeout);

        for _ in 0..200 {
            if !h.announcer.messages.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.announcer.messages.lock()[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn per_user_cap_counts_active_runs() {
        let h = harness_with(
            SubagentConfig {
                max_per_user: 1,
                ..SubagentConfig::default()
            },
            ScriptedProvider::slow(),
        );
        let _running = h
            .manager
            .spawn(&ctx(), "task one", SpawnOptions::default())
            .unwrap();
        let err = h
            .manager
            .spawn(&ctx(), "task two", SpawnOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("limit 1"));
        // A different user still has room.
        let other = CallerContext::for_message("bob", "dm");
        assert!(h.manager.validate_spawn(&other).is_ok());
    }

    #[tokio::test]
    async fn stop_run_is_ownership_checked() {
        let h = harness_with(SubagentConfig::default(), ScriptedProvider::slow());
        let run_id = h
            .manager
            .spawn(&ctx(), "long task", SpawnOptions::default())
            .unwrap();
        wait_for_status(&h.manager, run_id, SubagentStatus::Running).await;

        assert!(h.manager.stop_run("mallory", run_id).is_err());
        assert!(h.manager.stop_run("alice", run_id).unwrap());
        let run = h.manager.get_run("alice", run_id).unwrap();
        assert_eq!(run.status, SubagentStatus::Cancelled);

        // Unknown id is not an error.
        assert!(!h.manager.stop_run("alice", Uuid::new_v4()).unwrap());
    }

    #[tokio::test]
    async fn send_to_run_only_while_running() {
        let h = harness_with(SubagentConfig::default(), ScriptedProvider::slow());
        let run_id = h
            .manager
            .spawn(&ctx(), "long task", SpawnOptions::default())
            .unwrap();
        wait_for_status(&h.manager, run_id, SubagentStatus::Running).await;

        assert!(h.manager.send_to_run("alice", run_id, "also check spam").unwrap());
        assert!(h.manager.send_to_run("mallory", run_id, "hi").is_err());

        h.manager.stop_run("alice", run_id).unwrap();
        assert!(!h.manager.send_to_run("alice", run_id, "too late").unwrap());
    }

    #[tokio::test]
    async fn delegate_sync_wraps_result() {
        let h = harness();
        let result = h
            .manager
            .delegate_sync(&ctx(), "quick lookup", SpawnOptions::default())
            .await
            .unwrap();
        assert!(result.starts_with("<subagent_result>\n"));
        assert!(result.contains("all done"));
        assert!(result.ends_with("</subagent_result>"));
    }

    #[tokio::test]
    async fn archive_sweep_removes_old_completed_runs() {
        let h = harness_with(
            SubagentConfig {
                archive_ttl_seconds: 0,
                ..SubagentConfig::default()
            },
            ScriptedProvider::replying("done"),
        );
        let run_id = h
            .manager
            .spawn(&ctx(), "short task", SpawnOptions::default())
            .unwrap();
        wait_for_status(&h.manager, run_id, SubagentStatus::Completed).await;
        h.manager.cleanup_archived();
        assert!(h.manager.get_run("alice", run_id).is_none());
    }

    #[test]
    fn announcement_truncation() {
        let long = "x".repeat(2_000);
        let out = truncate_announcement(&long, 1_800);
        assert!(out.ends_with("(truncated)"));
        assert!(out.chars().count() <= 1_800 + " (truncated)".len());
        assert_eq!(truncate_announcement("short", 1_800), "short");
    }
}
