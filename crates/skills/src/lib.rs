//! Skill catalog and tool dispatch for the Concierge runtime.
//!
//! A skill owns a set of tools; the registry owns the skills and enforces
//! the dispatch pipeline: lookup, main-agent gate, input validation,
//! health, rate limits, execution, and audit.

pub mod audit;
pub mod health;
pub mod ratelimit;
pub mod registry;
pub mod skill;
pub mod validator;

pub use audit::{AuditEntry, AuditSink, NullAuditSink};
pub use health::{HealthState, SkillHealth};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use registry::{SkillRegistry, ToolResultEnvelope};
pub use skill::{Skill, SkillKind};
