//! Single-use confirmation tokens gating destructive tool invocations.
//!
//! A pending action is minted when the LLM requests a confirmation-gated
//! tool; the user replies `confirm <token>` to release exactly one
//! execution. Tokens expire after the TTL (capped at five minutes) and a
//! background sweep evicts stragglers, cleaning up any scratch directory
//! attached to the action.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use cg_domain::config::ConfirmationConfig;

/// Hard ceiling on the configured TTL.
const MAX_TTL: Duration = Duration::from_secs(300);

/// `confirm <token>` — token is case-sensitive alphanumeric, 16+ chars.
fn confirm_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^confirm\s+([A-Za-z0-9]{16,})$").unwrap())
}

/// The action a token releases.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub token: String,
    pub user_id: String,
    pub skill_name: String,
    pub tool_name: String,
    pub input: Value,
    pub description: String,
    /// Scratch directory removed when the token is evicted unconsumed.
    pub temp_dir: Option<PathBuf>,
}

struct StoredAction {
    action: PendingAction,
    expires_at: Instant,
}

/// Clones share the token store; the sweeper task holds its own clone.
#[derive(Clone)]
pub struct ConfirmationManager {
    ttl: Duration,
    pending: Arc<Mutex<HashMap<String, StoredAction>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConfirmationManager {
    pub fn new(config: &ConfirmationConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds).min(MAX_TTL),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    /// Mint a token for one future invocation of `tool_name` with `input`
    /// by `user_id`.
    pub fn create_confirmation(
        &self,
        user_id: &str,
        skill_name: &str,
        tool_name: &str,
        input: Value,
        description: &str,
        temp_dir: Option<PathBuf>,
    ) -> String {
        // 122 bits from the OS CSPRNG, hex-encoded: satisfies the
        // >= 80-bit entropy floor and the alphanumeric grammar.
        let token = Uuid::new_v4().simple().to_string();
        let action = PendingAction {
            token: token.clone(),
            user_id: user_id.to_owned(),
            skill_name: skill_name.to_owned(),
            tool_name: tool_name.to_owned(),
            input,
            description: description.to_owned(),
            temp_dir,
        };
        self.pending.lock().insert(
            token.clone(),
            StoredAction {
                action,
                expires_at: Instant::now() + self.ttl,
            },
        );
        tracing::debug!(user_id, tool_name, "confirmation minted");
        token
    }

    /// Extract the token from a `confirm <token>` message, if it is one.
    pub fn is_confirmation_message(text: &str) -> Option<&str> {
        confirm_re()
            .captures(text.trim())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Atomically consume a token. Returns `None` when the token is
    /// unknown, expired, or minted for a different user. A wrong-user
    /// probe leaves the token intact for its owner.
    pub fn consume_confirmation(&self, token: &str, user_id: &str) -> Option<PendingAction> {
        let mut pending = self.pending.lock();
        let stored = pending.get(token)?;
        if stored.action.user_id != user_id {
            tracing::warn!(
                token_owner = %stored.action.user_id,
                claimant = user_id,
                "confirmation attempted by non-owner"
            );
            return None;
        }
        if Instant::now() >= stored.expires_at {
            if let Some(stored) = pending.remove(token) {
                drop(pending);
                cleanup_temp_dir(&stored.action);
            }
            return None;
        }
        pending.remove(token).map(|s| s.action)
    }

    /// Remove expired tokens and clean up their scratch directories.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let expired: Vec<StoredAction> = {
            let mut pending = self.pending.lock();
            let dead: Vec<String> = pending
                .iter()
                .filter(|(_, s)| now >= s.expires_at)
                .map(|(t, _)| t.clone())
                .collect();
            dead.into_iter().filter_map(|t| pending.remove(&t)).collect()
        };
        for stored in &expired {
            cleanup_temp_dir(&stored.action);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expired confirmations swept");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Start the periodic sweep. Idempotent; the previous sweeper is
    /// replaced.
    pub fn start_sweeper(&self, interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.cleanup();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

fn cleanup_temp_dir(action: &PendingAction) {
    if let Some(dir) = &action.temp_dir {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "temp dir cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> ConfirmationManager {
        ConfirmationManager::new(&ConfirmationConfig::default())
    }

    fn mint(m: &ConfirmationManager, user: &str) -> String {
        m.create_confirmation(
            user,
            "unifi",
            "unifi_block_device",
            json!({"mac": "aa:bb"}),
            "unifi_block_device({\"mac\":\"aa:bb\"})",
            None,
        )
    }

    #[test]
    fn token_shape_matches_grammar() {
        let m = manager();
        let token = mint(&m, "alice");
        assert!(token.len() >= 16);
        assert!(ConfirmationManager::is_confirmation_message(&format!("confirm {token}"))
            .is_some());
    }

    #[test]
    fn grammar_recognition() {
        assert_eq!(
            ConfirmationManager::is_confirmation_message("confirm abcdef0123456789"),
            Some("abcdef0123456789")
        );
        assert!(ConfirmationManager::is_confirmation_message("confirm short").is_none());
        assert!(
            ConfirmationManager::is_confirmation_message("please confirm abcdef0123456789")
                .is_none()
        );
        assert!(ConfirmationManager::is_confirmation_message("hello").is_none());
        // Trailing text is not a confirmation.
        assert!(ConfirmationManager::is_confirmation_message(
            "confirm abcdef0123456789 now"
        )
        .is_none());
    }

    #[test]
    fn consume_round_trip() {
        let m = manager();
        let token = mint(&m, "alice");
        let action = m.consume_confirmation(&token, "alice").unwrap();
        assert_eq!(action.tool_name, "unifi_block_device");
        assert_eq!(action.input, json!({"mac": "aa:bb"}));
        // Second consume is always None.
        assert!(m.consume_confirmation(&token, "alice").is_none());
    }

    #[test]
    fn wrong_user_does_not_burn_the_token() {
        let m = manager();
        let token = mint(&m, "alice");
        assert!(m.consume_confirmation(&token, "mallory").is_none());
        // The owner can still consume.
        assert!(m.consume_confirmation(&token, "alice").is_some());
    }

    #[test]
    fn unknown_token_is_none() {
        let m = manager();
        assert!(m.consume_confirmation("deadbeefdeadbeefdeadbeef", "alice").is_none());
    }

    #[test]
    fn expired_token_is_none_and_swept() {
        let m = ConfirmationManager::new(&ConfirmationConfig {
            ttl_seconds: 0,
            ..ConfirmationConfig::default()
        });
        let token = mint(&m, "alice");
        assert!(m.consume_confirmation(&token, "alice").is_none());
        assert_eq!(m.pending_count(), 0);
    }

    #[test]
    fn cleanup_removes_expired_and_temp_dirs() {
        let m = ConfirmationManager::new(&ConfirmationConfig {
            ttl_seconds: 0,
            ..ConfirmationConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep();
        m.create_confirmation("alice", "files", "file_write", json!({}), "write", Some(path.clone()));
        assert_eq!(m.pending_count(), 1);
        m.cleanup();
        assert_eq!(m.pending_count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn ttl_is_capped_at_five_minutes() {
        let m = ConfirmationManager::new(&ConfirmationConfig {
            ttl_seconds: 86_400,
            ..ConfirmationConfig::default()
        });
        assert_eq!(m.ttl, MAX_TTL);
    }

    #[test]
    fn tokens_are_unique() {
        let m = manager();
        let a = mint(&m, "alice");
        let b = mint(&m, "alice");
        assert_ne!(a, b);
        assert_eq!(m.pending_count(), 2);
    }
}
