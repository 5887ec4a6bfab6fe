//! The per-message orchestration loop.
//!
//! One `handle_message` call: confirmation short-circuit, length cap,
//! history load and compaction, tier routing, prompt assembly, then the
//! tool-use loop with per-turn and per-session caps, confirmation gating,
//! per-call timeout and retry, tier escalation, truncation recovery, and
//! persistence. Every failure inside becomes a user-safe response; only
//! the providers-unavailable sentinel escapes to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use cg_domain::cancel::CancelToken;
use cg_domain::config::SensitiveToolPolicy;
use cg_domain::context::CallerContext;
use cg_domain::error::{classify_error, Error, Result};
use cg_domain::event::{topics, Event, Severity};
use cg_domain::redact::redact;
use cg_domain::tool::{Message, StopReason, ToolDefinition};
use cg_providers::manager::ProviderSelection;
use cg_providers::tiering::{classify_message, is_heavy_tool, MessageTier};
use cg_providers::traits::{ChatRequest, ChatResponse, ToolSupport};
use cg_sessions::compact;
use cg_sessions::history::session_key;
use cg_skills::registry::{OutputFile, ToolResultEnvelope};

use crate::confirm::ConfirmationManager;
use crate::prompt::assemble_system_prompt;
use crate::state::AgentState;

const APOLOGY: &str = "Something went wrong while handling that. Please try again.";
const MAX_ACTIONS_RESPONSE: &str = "I've hit the maximum number of actions allowed for one \
request. Break the task into smaller steps and try again.";
const COOL_DOWN_RESPONSE: &str = "I've used a lot of tool calls in the past hour and need to \
cool down. Please try again in a little while.";
const INVALID_CONFIRMATION: &str = "That confirmation code is invalid or expired.";
const CONTINUE_PROMPT: &str = "Your previous response was truncated. Please continue from \
where you left off.";
const NO_RESPONSE: &str = "No response generated.";

/// Minimum message length for fire-and-forget memory ingestion.
const MEMORY_MIN_CHARS: usize = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One inbound user message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub message: String,
    pub channel: String,
    pub attachments: Vec<String>,
    pub working_dir: Option<String>,
    /// Cooperative cancellation for the whole turn.
    pub cancel: Option<CancelToken>,
}

impl TurnRequest {
    pub fn new(
        user_id: impl Into<String>,
        message: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            channel: channel.into(),
            attachments: Vec::new(),
            working_dir: None,
            cancel: None,
        }
    }
}

/// What the transport adapter delivers back to the user.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub files: Vec<OutputFile>,
    pub pending_confirmation: bool,
}

impl AgentResponse {
    fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
            pending_confirmation: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    state: Arc<AgentState>,
}

impl Orchestrator {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    /// Handle one user message end to end.
    ///
    /// The only error this returns is [`Error::ProvidersUnavailable`];
    /// everything else is converted to a user-safe response after
    /// publishing `alert.system.error`.
    pub async fn handle_message(&self, req: TurnRequest) -> Result<AgentResponse> {
        let ctx = CallerContext::for_message(&req.user_id, &req.channel);
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            user_id = %req.user_id,
            channel = %req.channel,
            "turn started"
        );

        match self.handle_inner(&ctx, &req).await {
            Ok(response) => Ok(response),
            Err(Error::ProvidersUnavailable) => Err(Error::ProvidersUnavailable),
            Err(e) => {
                let message = redact(&e.to_string());
                tracing::error!(
                    correlation_id = %ctx.correlation_id,
                    error = %message,
                    "turn failed"
                );
                self.state.bus.publish(
                    Event::new(topics::SYSTEM_ERROR, "orchestrator", Severity::High)
                        .with("error", serde_json::json!(message))
                        .with("correlationId", serde_json::json!(ctx.correlation_id)),
                );
                Ok(AgentResponse::text_only(APOLOGY))
            }
        }
    }

    async fn handle_inner(&self, ctx: &CallerContext, req: &TurnRequest) -> Result<AgentResponse> {
        let state = &self.state;
        let config = &state.config.orchestrator;
        let key = session_key(&req.user_id, &req.channel);

        // ── 2. Confirmation short-circuit ─────────────────────────
        if let Some(token) = ConfirmationManager::is_confirmation_message(&req.message) {
            return self.handle_confirmation(ctx, req, &key, token).await;
        }

        // ── 3. Length cap ─────────────────────────────────────────
        if req.message.chars().count() > config.max_message_chars {
            return Ok(AgentResponse::text_only(format!(
                "That message is too long for me to handle ({} character limit). \
                 Please shorten it or split it up.",
                config.max_message_chars
            )));
        }

        // ── 4. History load + compaction ──────────────────────────
        self.compact_if_due(&key, &req.user_id).await;
        let history = state.history.snapshot(&key).await;

        // ── 5. Tier routing ───────────────────────────────────────
        let mut tier = if state.providers.is_tier_enabled() {
            Some(classify_message(&req.message, &state.config.tiers))
        } else {
            None
        };
        let mut selection = self.select(&req.user_id, tier)?;

        // ── 6. Attachment & workdir augmentation ──────────────────
        let tool_names = state.registry.registered_tool_names();
        let outbound = augment_message(req, &tool_names);

        // ── 7. System prompt ──────────────────────────────────────
        let memory_snippets = match state
            .memory
            .retrieve(&req.user_id, &req.message, config.memory_snippet_limit)
            .await
        {
            Ok(snippets) => snippets,
            Err(e) => {
                tracing::warn!(error = %e, "memory retrieval failed, continuing without");
                Vec::new()
            }
        };
        let has_code_tools = tool_names
            .iter()
            .any(|n| n.contains("exec") || n.contains("shell") || n.contains("code"));
        let system = assemble_system_prompt(
            config,
            &state.registry.registered_skill_names(),
            &memory_snippets,
            has_code_tools,
        );
        let tool_defs = state.registry.get_tool_definitions(false);

        // ── 8. Initial LLM call ───────────────────────────────────
        let mut messages = history;
        messages.push(Message::user(outbound));
        let mut response = self
            .chat(&selection, &system, &messages, &tool_defs, tier, req.cancel.clone())
            .await?;

        // ── 9. Tool-use loop ──────────────────────────────────────
        let mut turn_tool_count: u32 = 0;
        let mut files: Vec<OutputFile> = Vec::new();

        while response.stop_reason == StopReason::ToolUse && !response.tool_calls.is_empty() {
            if turn_tool_count + response.tool_calls.len() as u32 > config.max_tool_calls_per_turn
            {
                self.persist_turn(&key, req, MAX_ACTIONS_RESPONSE).await;
                return Ok(AgentResponse {
                    text: MAX_ACTIONS_RESPONSE.into(),
                    files,
                    pending_confirmation: false,
                });
            }
            if state.counter.count(&key) >= config.session_tool_call_cap {
                self.persist_turn(&key, req, COOL_DOWN_RESPONSE).await;
                return Ok(AgentResponse {
                    text: COOL_DOWN_RESPONSE.into(),
                    files,
                    pending_confirmation: false,
                });
            }

            let assistant_text = response.text.clone().unwrap_or_default();
            let mut results: Vec<(String, String, bool)> = Vec::new();
            let mut pending_texts: Vec<String> = Vec::new();
            let mut escalate = false;

            for call in &response.tool_calls {
                turn_tool_count += 1;

                if let Some(confirmation_text) =
                    self.maybe_gate_behind_confirmation(&req.user_id, &call.tool_name, &call.arguments)
                {
                    results.push((call.call_id.clone(), confirmation_text.clone(), false));
                    pending_texts.push(confirmation_text);
                    continue;
                }

                let (content, is_error) = self
                    .run_tool_with_retry(ctx, &call.tool_name, &call.arguments)
                    .await;
                state.counter.record(&key);

                if is_error {
                    let sink = state.error_patterns.clone();
                    let tool = call.tool_name.clone();
                    let error = content.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sink.record(&tool, &error).await {
                            tracing::warn!(error = %e, "error-pattern sink failed");
                        }
                    });
                }

                if tier == Some(MessageTier::Light)
                    && is_heavy_tool(&call.tool_name, &state.config.tiers)
                {
                    escalate = true;
                }

                let content = match ToolResultEnvelope::parse(&content) {
                    Some(envelope) => {
                        files.extend(envelope.output_files);
                        if envelope.content.is_empty() {
                            "(file output attached)".to_string()
                        } else {
                            envelope.content
                        }
                    }
                    None => content,
                };
                results.push((call.call_id.clone(), content, is_error));
            }

            // A pending confirmation ends the loop; the user must reply
            // before anything executes.
            if !pending_texts.is_empty() {
                let text = pending_texts.join("\n");
                self.persist_turn(&key, req, &text).await;
                return Ok(AgentResponse {
                    text,
                    files,
                    pending_confirmation: true,
                });
            }

            if escalate && tier == Some(MessageTier::Light) {
                tracing::debug!("escalating to heavy tier after heavy tool use");
                tier = Some(MessageTier::Heavy);
                selection = self.select(&req.user_id, tier)?;
            }

            messages.push(Message::assistant_with_tool_uses(
                &assistant_text,
                &response.tool_calls,
            ));
            messages.push(Message::tool_results(results));

            response = self
                .chat(&selection, &system, &messages, &tool_defs, tier, req.cancel.clone())
                .await?;
        }

        // ── 10. Truncation recovery (single attempt) ──────────────
        let mut final_text = response.text.unwrap_or_default();
        if response.stop_reason == StopReason::MaxTokens && !final_text.is_empty() {
            messages.push(Message::assistant(final_text.clone()));
            messages.push(Message::user(CONTINUE_PROMPT));
            match self
                .chat(&selection, &system, &messages, &tool_defs, tier, req.cancel.clone())
                .await
            {
                Ok(continuation) => {
                    final_text.push_str(&continuation.text.unwrap_or_default());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "continuation request failed, keeping truncated text");
                }
            }
        }
        if final_text.is_empty() {
            final_text = NO_RESPONSE.into();
        }

        // ── 11. Failover notice ───────────────────────────────────
        if selection.failed_over {
            final_text = format!(
                "[Notice: your usual provider was unavailable; this response came from {}.]\n{final_text}",
                selection.provider.provider_id()
            );
        }

        // ── 12. Persist + memory ingestion ────────────────────────
        self.persist_turn(&key, req, &final_text).await;
        self.fire_memory_ingest(req);

        Ok(AgentResponse {
            text: final_text,
            files,
            pending_confirmation: false,
        })
    }

    // ── Confirmation flow ──────────────────────────────────────────

    async fn handle_confirmation(
        &self,
        ctx: &CallerContext,
        req: &TurnRequest,
        key: &str,
        token: &str,
    ) -> Result<AgentResponse> {
        let state = &self.state;
        let decision = state.registry.rate_limiter().check(
            "confirm",
            &req.user_id,
            &state.config.confirmations.attempt_rate,
        );
        if !decision.allowed {
            return Ok(AgentResponse::text_only(
                "Too many confirmation attempts. Please wait a moment and try again.",
            ));
        }

        let action = match state.confirmations.consume_confirmation(token, &req.user_id) {
            Some(action) => action,
            None => return Ok(AgentResponse::text_only(INVALID_CONFIRMATION)),
        };

        tracing::info!(
            correlation_id = %ctx.correlation_id,
            tool = %action.tool_name,
            "confirmed action executing"
        );
        let (content, is_error) = self
            .run_tool_with_retry(ctx, &action.tool_name, &action.input)
            .await;
        state.counter.record(key);

        if let Some(dir) = &action.temp_dir {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "temp dir cleanup failed");
                }
            }
        }

        let mut files = Vec::new();
        let content = match ToolResultEnvelope::parse(&content) {
            Some(envelope) => {
                files.extend(envelope.output_files);
                if envelope.content.is_empty() {
                    "(file output attached)".to_string()
                } else {
                    envelope.content
                }
            }
            None => content,
        };
        let text = if is_error {
            content
        } else {
            format!("Done. {content}")
        };
        self.persist_turn(key, req, &text).await;

        Ok(AgentResponse {
            text,
            files,
            pending_confirmation: false,
        })
    }

    fn maybe_gate_behind_confirmation(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Option<String> {
        let definition = self.state.registry.tool_definition(tool_name)?;
        let policy = self.state.config.orchestrator.sensitive_tool_policy;
        let needs_confirmation = definition.requires_confirmation
            || (definition.sensitive && policy == SensitiveToolPolicy::AlwaysConfirm);
        if !needs_confirmation {
            return None;
        }

        let skill = self
            .state
            .registry
            .skill_for_tool(tool_name)
            .unwrap_or_default();
        let description = format!(
            "{tool_name}({})",
            serde_json::to_string(arguments).unwrap_or_else(|_| "{}".into())
        );
        let token = self.state.confirmations.create_confirmation(
            user_id,
            &skill,
            tool_name,
            arguments.clone(),
            &description,
            None,
        );
        Some(format!(
            "This action requires confirmation. Reply with \"confirm {token}\" to proceed. \
             Action: {description}"
        ))
    }

    // ── Tool execution ─────────────────────────────────────────────

    /// One execution with the per-call timeout, plus a single retry when
    /// the failure classifies as retryable.
    async fn run_tool_with_retry(
        &self,
        ctx: &CallerContext,
        tool_name: &str,
        arguments: &Value,
    ) -> (String, bool) {
        let first = self.run_tool_once(ctx, tool_name, arguments).await;
        if first.1 && classify_error(&first.0).is_retryable() {
            tracing::debug!(tool = tool_name, "retrying tool after transient failure");
            return self.run_tool_once(ctx, tool_name, arguments).await;
        }
        first
    }

    async fn run_tool_once(
        &self,
        ctx: &CallerContext,
        tool_name: &str,
        arguments: &Value,
    ) -> (String, bool) {
        let timeout = Duration::from_secs(self.state.config.orchestrator.tool_timeout_seconds);
        match tokio::time::timeout(
            timeout,
            self.state.registry.execute_tool_call(tool_name, arguments, ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => (
                format!(
                    "Error executing {tool_name}: timed out after {}s",
                    timeout.as_secs()
                ),
                true,
            ),
        }
    }

    // ── Provider plumbing ──────────────────────────────────────────

    fn select(&self, user_id: &str, tier: Option<MessageTier>) -> Result<ProviderSelection> {
        match tier {
            Some(tier) => self.state.providers.get_for_user_tiered(user_id, tier),
            None => self.state.providers.get_for_user(user_id),
        }
    }

    async fn chat(
        &self,
        selection: &ProviderSelection,
        system: &str,
        messages: &[Message],
        tool_defs: &[ToolDefinition],
        tier: Option<MessageTier>,
        cancel: Option<CancelToken>,
    ) -> Result<ChatResponse> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(Error::Other("turn cancelled".into()));
            }
        }
        let tools = if selection.provider.tool_support() == ToolSupport::No {
            Vec::new()
        } else {
            tool_defs.to_vec()
        };
        let req = ChatRequest {
            model: Some(selection.model.clone()),
            system: Some(system.to_owned()),
            messages: messages.to_vec(),
            tools,
            max_tokens: self.state.config.orchestrator.max_tokens,
            signal: cancel,
        };
        let response = selection.provider.chat(req).await?;
        self.state
            .providers
            .track_usage(&response.provider, &response.model, response.usage, tier);
        Ok(response)
    }

    // ── History & side channels ────────────────────────────────────

    async fn compact_if_due(&self, key: &str, user_id: &str) {
        let state = &self.state;
        if !state.history.compaction_due(key).await {
            return;
        }
        let batch = state.history.compaction_batch(key).await;
        if batch.is_empty() {
            return;
        }

        let selection = if state.providers.is_tier_enabled() {
            state.providers.get_for_user_tiered(user_id, MessageTier::Light)
        } else {
            state.providers.get_for_user(user_id)
        };
        let selection = match selection {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "no summarizer available, skipping compaction");
                return;
            }
        };

        let req = ChatRequest {
            model: Some(selection.model.clone()),
            system: None,
            messages: vec![Message::user(compact::summary_prompt(&batch))],
            tools: Vec::new(),
            max_tokens: 1_024,
            signal: None,
        };
        match selection.provider.chat(req).await {
            Ok(response) => {
                let summary = response.text.unwrap_or_default();
                if summary.is_empty() {
                    return;
                }
                state
                    .history
                    .replace_with_summary(key, batch.len(), compact::summary_entry(&summary))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "compaction failed, continuing with full history");
            }
        }
    }

    async fn persist_turn(&self, key: &str, req: &TurnRequest, response_text: &str) {
        self.state
            .history
            .append(
                key,
                vec![
                    Message::user(req.message.clone()),
                    Message::assistant(response_text.to_owned()),
                ],
            )
            .await;
    }

    fn fire_memory_ingest(&self, req: &TurnRequest) {
        if req.message.chars().count() < MEMORY_MIN_CHARS || req.message.starts_with('/') {
            return;
        }
        let memory = self.state.memory.clone();
        let ingest = crate::hooks::MemoryIngestRequest {
            user_id: req.user_id.clone(),
            content: req.message.clone(),
            source: "conversation".into(),
            metadata: std::collections::HashMap::from([(
                "channel".to_string(),
                req.channel.clone(),
            )]),
        };
        tokio::spawn(async move {
            if let Err(e) = memory.ingest(ingest).await {
                tracing::warn!(error = %e, "memory ingestion failed");
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append attachment and working-directory hints to the outbound message
/// when file-capable tools are registered.
fn augment_message(req: &TurnRequest, tool_names: &[String]) -> String {
    let has_file_tools = tool_names
        .iter()
        .any(|n| n.contains("file") || n.contains("read") || n.contains("exec"));
    let mut outbound = req.message.clone();
    if has_file_tools {
        if !req.attachments.is_empty() {
            outbound.push_str(&format!("\n[Attached files: {}]", req.attachments.join(", ")));
        }
        if let Some(dir) = &req.working_dir {
            outbound.push_str(&format!("\n[Working directory: {dir}]"));
        }
    }
    outbound
}
