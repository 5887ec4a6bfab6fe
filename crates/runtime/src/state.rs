//! Shared runtime state threaded through the orchestrator and services.

use std::sync::Arc;
use std::time::Duration;

use cg_domain::config::RuntimeConfig;
use cg_providers::manager::ProviderManager;
use cg_sessions::{ContextStore, SessionToolCounter};
use cg_skills::registry::SkillRegistry;

use crate::bus::EventBus;
use crate::confirm::ConfirmationManager;
use crate::hooks::{Announcer, ErrorPatternSink, MemoryService, NullAnnouncer, NullErrorPatternSink, NullMemory};
use crate::scheduler::TaskScheduler;
use crate::subagent::SubagentManager;

/// Everything a turn needs, bundled behind `Arc`s.
///
/// Build with [`AgentState::builder`], then call [`AgentState::start`] once
/// to launch the background services (scheduler ticks, confirmation sweep,
/// sub-agent archive sweep).
pub struct AgentState {
    pub config: RuntimeConfig,
    pub registry: Arc<SkillRegistry>,
    pub providers: Arc<dyn ProviderManager>,
    pub history: Arc<ContextStore>,
    pub counter: Arc<SessionToolCounter>,
    pub confirmations: Arc<ConfirmationManager>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<TaskScheduler>,
    pub subagents: Arc<SubagentManager>,
    pub memory: Arc<dyn MemoryService>,
    pub error_patterns: Arc<dyn ErrorPatternSink>,
}

impl AgentState {
    pub fn builder(
        config: RuntimeConfig,
        registry: Arc<SkillRegistry>,
        providers: Arc<dyn ProviderManager>,
    ) -> AgentStateBuilder {
        AgentStateBuilder {
            config,
            registry,
            providers,
            announcer: Arc::new(NullAnnouncer),
            memory: Arc::new(NullMemory),
            error_patterns: Arc::new(NullErrorPatternSink),
        }
    }

    /// Launch the background services. Call once after construction.
    pub fn start(&self) {
        self.scheduler.start();
        self.confirmations.start_sweeper(Duration::from_secs(
            self.config.confirmations.cleanup_interval_seconds.max(1),
        ));
        self.subagents.start_sweeper();
    }

    /// Stop background services and shut the skills down.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.confirmations.stop_sweeper();
        self.subagents.shutdown();
        self.registry.shutdown_all().await;
        self.bus.drain().await;
    }
}

pub struct AgentStateBuilder {
    config: RuntimeConfig,
    registry: Arc<SkillRegistry>,
    providers: Arc<dyn ProviderManager>,
    announcer: Arc<dyn Announcer>,
    memory: Arc<dyn MemoryService>,
    error_patterns: Arc<dyn ErrorPatternSink>,
}

impl AgentStateBuilder {
    pub fn announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = announcer;
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = memory;
        self
    }

    pub fn error_patterns(mut self, sink: Arc<dyn ErrorPatternSink>) -> Self {
        self.error_patterns = sink;
        self
    }

    pub fn build(self) -> Arc<AgentState> {
        let bus = Arc::new(EventBus::new());
        let scheduler = Arc::new(TaskScheduler::new(self.config.scheduler.clone(), bus.clone()));
        let subagents = Arc::new(SubagentManager::new(
            self.config.subagents.clone(),
            self.registry.clone(),
            self.providers.clone(),
            bus.clone(),
            self.announcer,
            self.registry.rate_limiter().clone(),
        ));
        let history = Arc::new(ContextStore::new(self.config.history.clone()));
        let counter = Arc::new(SessionToolCounter::new(Duration::from_secs(
            self.config.orchestrator.session_window_seconds,
        )));
        let confirmations = Arc::new(ConfirmationManager::new(&self.config.confirmations));

        Arc::new(AgentState {
            config: self.config,
            registry: self.registry,
            providers: self.providers,
            history,
            counter,
            confirmations,
            bus,
            scheduler,
            subagents,
            memory: self.memory,
            error_patterns: self.error_patterns,
        })
    }
}
