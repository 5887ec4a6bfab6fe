//! Per-skill health tracking with failure thresholds and recovery.
//!
//! Consecutive failures walk a skill healthy → degraded → unavailable;
//! a success resets it. An unavailable skill that stays quiet for the
//! recovery window drops back to degraded, then heals on the next success.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use cg_domain::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone)]
struct SkillStatus {
    state: HealthState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Default for SkillStatus {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

/// Snapshot row for operator introspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub skill: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
}

pub struct SkillHealth {
    config: HealthConfig,
    statuses: RwLock<HashMap<String, SkillStatus>>,
}

impl SkillHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Record a successful execution: resets the failure counter and the
    /// state (via degraded when recovering from unavailable).
    pub fn record_success(&self, skill: &str) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(skill.to_owned()).or_default();
        status.consecutive_failures = 0;
        status.last_failure = None;
        if status.state != HealthState::Healthy {
            tracing::info!(skill, from = ?status.state, "skill recovered");
        }
        status.state = HealthState::Healthy;
    }

    /// Record a failed execution and apply the thresholds.
    pub fn record_failure(&self, skill: &str, error: &str) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(skill.to_owned()).or_default();
        status.consecutive_failures += 1;
        status.last_failure = Some(Instant::now());

        let next = if status.consecutive_failures >= self.config.unavailable_threshold {
            HealthState::Unavailable
        } else if status.consecutive_failures >= self.config.degraded_threshold {
            HealthState::Degraded
        } else {
            status.state
        };

        if next != status.state {
            tracing::warn!(
                skill,
                failures = status.consecutive_failures,
                from = ?status.state,
                to = ?next,
                error,
                "skill health transition"
            );
        }
        status.state = next;
    }

    /// False only when the skill is unavailable. Applies the recovery
    /// window: a quiet unavailable skill drops to degraded and is given
    /// another chance.
    pub fn is_available(&self, skill: &str) -> bool {
        let mut statuses = self.statuses.write();
        let status = match statuses.get_mut(skill) {
            Some(s) => s,
            None => return true,
        };
        if status.state != HealthState::Unavailable {
            return true;
        }
        let window = Duration::from_secs(self.config.recovery_window_seconds);
        match status.last_failure {
            Some(at) if at.elapsed() >= window => {
                tracing::info!(skill, "recovery window elapsed, downgrading to degraded");
                status.state = HealthState::Degraded;
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, skill: &str) -> HealthState {
        self.statuses
            .read()
            .get(skill)
            .map(|s| s.state)
            .unwrap_or(HealthState::Healthy)
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let statuses = self.statuses.read();
        let mut rows: Vec<_> = statuses
            .iter()
            .map(|(skill, s)| HealthSnapshot {
                skill: skill.clone(),
                state: s.state,
                consecutive_failures: s.consecutive_failures,
                seconds_since_last_failure: s.last_failure.map(|t| t.elapsed().as_secs()),
            })
            .collect();
        rows.sort_by(|a, b| a.skill.cmp(&b.skill));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> SkillHealth {
        SkillHealth::new(HealthConfig {
            degraded_threshold: 3,
            unavailable_threshold: 5,
            recovery_window_seconds: 0, // elapses immediately in tests
        })
    }

    #[test]
    fn unknown_skill_is_healthy_and_available() {
        let h = health();
        assert_eq!(h.state_of("email"), HealthState::Healthy);
        assert!(h.is_available("email"));
    }

    #[test]
    fn thresholds_walk_states() {
        let h = health();
        for _ in 0..2 {
            h.record_failure("email", "boom");
        }
        assert_eq!(h.state_of("email"), HealthState::Healthy);

        h.record_failure("email", "boom");
        assert_eq!(h.state_of("email"), HealthState::Degraded);
        assert!(h.is_available("email"), "degraded skills still serve");

        h.record_failure("email", "boom");
        h.record_failure("email", "boom");
        assert_eq!(h.state_of("email"), HealthState::Unavailable);
    }

    #[test]
    fn success_resets() {
        let h = health();
        for _ in 0..5 {
            h.record_failure("email", "boom");
        }
        h.record_success("email");
        assert_eq!(h.state_of("email"), HealthState::Healthy);
        assert!(h.is_available("email"));
    }

    #[test]
    fn recovery_window_downgrades_unavailable() {
        let h = health(); // window = 0s
        for _ in 0..5 {
            h.record_failure("email", "boom");
        }
        assert_eq!(h.state_of("email"), HealthState::Unavailable);
        // Window already elapsed: the availability check itself downgrades.
        assert!(h.is_available("email"));
        assert_eq!(h.state_of("email"), HealthState::Degraded);
        h.record_success("email");
        assert_eq!(h.state_of("email"), HealthState::Healthy);
    }

    #[test]
    fn unavailable_within_window_stays_blocked() {
        let h = SkillHealth::new(HealthConfig {
            degraded_threshold: 3,
            unavailable_threshold: 5,
            recovery_window_seconds: 3_600,
        });
        for _ in 0..5 {
            h.record_failure("email", "boom");
        }
        assert!(!h.is_available("email"));
    }

    #[test]
    fn snapshot_sorted_by_skill() {
        let h = health();
        h.record_failure("notes", "x");
        h.record_failure("email", "y");
        let snap = h.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].skill, "email");
        assert_eq!(snap[1].skill, "notes");
        assert_eq!(snap[0].consecutive_failures, 1);
    }
}
