//! Heuristic light/heavy message classification for tier routing.
//!
//! Classification is local and deterministic: message length, a small set
//! of complexity patterns, and mentions of known heavy tools. The
//! orchestrator may still escalate mid-turn when a heavy-hinted tool
//! actually executes.

use regex::Regex;
use std::sync::OnceLock;

use cg_domain::config::TierConfig;

/// The routing tier of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageTier {
    /// Cheap, fast model.
    Light,
    /// Capable model.
    Heavy,
}

/// Built-in complexity signals that force the heavy tier regardless of
/// message length: code fences, multi-step planning language, analysis or
/// generation requests.
const HEAVY_PATTERNS: &[&str] = &[
    r"```",
    r"(?i)\bstep[- ]by[- ]step\b",
    r"(?i)\b(write|generate|draft|refactor|implement|debug)\b.{0,40}\b(code|script|function|program|class|module)\b",
    r"(?i)\b(analy[sz]e|compare|summari[sz]e|investigate|research)\b",
    r"(?i)\bthen\b.+\bthen\b",
];

fn heavy_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        HEAVY_PATTERNS
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

/// Classify a user message as light or heavy.
pub fn classify_message(message: &str, config: &TierConfig) -> MessageTier {
    if message.len() > config.light_max_chars {
        tracing::debug!(len = message.len(), "heavy tier: message length");
        return MessageTier::Heavy;
    }

    if heavy_res().iter().any(|re| re.is_match(message)) {
        tracing::debug!("heavy tier: complexity pattern");
        return MessageTier::Heavy;
    }

    for pattern in &config.extra_heavy_patterns {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(message) => {
                tracing::debug!(pattern, "heavy tier: configured pattern");
                return MessageTier::Heavy;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid heavy-tier pattern, ignoring");
            }
        }
    }

    let lower = message.to_lowercase();
    if config
        .heavy_tool_hints
        .iter()
        .any(|hint| lower.contains(&hint.to_lowercase()))
    {
        tracing::debug!("heavy tier: heavy tool hint");
        return MessageTier::Heavy;
    }

    MessageTier::Light
}

/// Whether an executed tool name is on the heavy-hint list (mid-turn
/// escalation check).
pub fn is_heavy_tool(tool_name: &str, config: &TierConfig) -> bool {
    config.heavy_tool_hints.iter().any(|hint| hint == tool_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TierConfig {
        TierConfig {
            light_max_chars: 400,
            heavy_tool_hints: vec!["browser_navigate".into(), "sessions_spawn".into()],
            extra_heavy_patterns: vec![],
        }
    }

    #[test]
    fn short_plain_messages_stay_light() {
        assert_eq!(classify_message("what time is it?", &config()), MessageTier::Light);
        assert_eq!(classify_message("hello", &config()), MessageTier::Light);
    }

    #[test]
    fn long_messages_go_heavy() {
        let long = "a".repeat(500);
        assert_eq!(classify_message(&long, &config()), MessageTier::Heavy);
    }

    #[test]
    fn code_fences_go_heavy() {
        let msg = "why does this fail?\n```\nlet x = 1;\n```";
        assert_eq!(classify_message(msg, &config()), MessageTier::Heavy);
    }

    #[test]
    fn generation_requests_go_heavy() {
        assert_eq!(
            classify_message("write a python script that renames files", &config()),
            MessageTier::Heavy
        );
        assert_eq!(
            classify_message("analyze last month's spending", &config()),
            MessageTier::Heavy
        );
    }

    #[test]
    fn heavy_tool_mentions_go_heavy() {
        assert_eq!(
            classify_message("use browser_navigate to check the page", &config()),
            MessageTier::Heavy
        );
    }

    #[test]
    fn configured_extra_pattern_applies() {
        let mut cfg = config();
        cfg.extra_heavy_patterns.push(r"(?i)\btax return\b".into());
        assert_eq!(
            classify_message("help with my tax return", &cfg),
            MessageTier::Heavy
        );
    }

    #[test]
    fn invalid_extra_pattern_is_ignored() {
        let mut cfg = config();
        cfg.extra_heavy_patterns.push("([unclosed".into());
        assert_eq!(classify_message("hi there", &cfg), MessageTier::Light);
    }

    #[test]
    fn heavy_tool_check_is_exact() {
        let cfg = config();
        assert!(is_heavy_tool("sessions_spawn", &cfg));
        assert!(!is_heavy_tool("note_search", &cfg));
    }
}
