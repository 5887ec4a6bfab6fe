//! The Concierge agent runtime core.
//!
//! Ties the skill registry, provider abstraction, and session state into
//! the per-message orchestration loop, and hosts the supporting services:
//! event bus, confirmation tokens, cron scheduler, and the sub-agent
//! lifecycle manager.

pub mod bus;
pub mod confirm;
pub mod hooks;
pub mod orchestrator;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod subagent;
pub mod subagent_skill;

pub use bus::EventBus;
pub use confirm::ConfirmationManager;
pub use orchestrator::{AgentResponse, Orchestrator, TurnRequest};
pub use scheduler::TaskScheduler;
pub use state::AgentState;
pub use subagent::SubagentManager;
