//! Cron-backed task scheduler.
//!
//! Tasks register under unique names; re-registering a name replaces the
//! prior task. A single runner ticks every `tick_seconds`, fires due
//! enabled tasks, and skips a fire while the previous one is still in
//! flight. Every execution gets at most two attempts; a double failure
//! publishes `alert.system.task_failed`.

pub mod cron;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use cg_domain::config::SchedulerConfig;
use cg_domain::error::{Error, Result};
use cg_domain::event::{topics, Event, Severity};
use cg_domain::redact::redact;

use crate::bus::EventBus;
use cron::{cron_next_tz, parse_tz, validate_cron};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The work a task runs on each fire.
pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct TaskDefinition {
    pub name: String,
    pub cron_expression: String,
    pub handler: TaskHandler,
    pub enabled: bool,
}

/// Optional overrides applied at registration (operator config wins over
/// skill defaults).
#[derive(Default, Clone)]
pub struct TaskOverride {
    pub cron_expression: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskMetadata {
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<TaskResult>,
    pub last_duration_ms: Option<u64>,
    pub next_run: Option<DateTime<Utc>>,
}

struct TaskEntry {
    name: String,
    cron_expression: String,
    handler: TaskHandler,
    enabled: AtomicBool,
    /// Guards against overlapping fires; a due task is skipped while set.
    in_flight: AtomicBool,
    metadata: Mutex<TaskMetadata>,
}

/// Snapshot row for operator introspection.
#[derive(Clone, serde::Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub metadata: TaskMetadata,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Clones share state; background tasks capture their own clone.
#[derive(Clone)]
pub struct TaskScheduler {
    config: SchedulerConfig,
    bus: Arc<EventBus>,
    tasks: Arc<RwLock<HashMap<String, Arc<TaskEntry>>>>,
    runner: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            runner: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a task. An existing task under the same name is stopped
    /// and replaced. Enabled tasks get their `next_run` computed
    /// immediately.
    pub fn register_task(&self, def: TaskDefinition, overrides: Option<TaskOverride>) -> Result<()> {
        let overrides = overrides.unwrap_or_default();
        let cron_expression = overrides.cron_expression.unwrap_or(def.cron_expression);
        let enabled = overrides.enabled.unwrap_or(def.enabled);

        if !validate_cron(&cron_expression) {
            return Err(Error::Config(format!(
                "invalid cron expression \"{cron_expression}\" for task \"{}\"",
                def.name
            )));
        }

        let entry = Arc::new(TaskEntry {
            name: def.name.clone(),
            cron_expression,
            handler: def.handler,
            enabled: AtomicBool::new(enabled),
            in_flight: AtomicBool::new(false),
            metadata: Mutex::new(TaskMetadata::default()),
        });
        if enabled {
            entry.metadata.lock().next_run = self.next_fire(&entry.cron_expression);
        }

        let replaced = self.tasks.write().insert(def.name.clone(), entry).is_some();
        tracing::info!(task = %def.name, enabled, replaced, "task registered");
        Ok(())
    }

    /// Remove a task entirely.
    pub fn remove_task(&self, name: &str) -> bool {
        self.tasks.write().remove(name).is_some()
    }

    /// Enable or disable a task. Enabling computes `next_run`; disabling
    /// clears it.
    pub fn toggle_task(&self, name: &str, enabled: bool) -> Result<()> {
        let entry = self
            .tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown task \"{name}\"")))?;
        entry.enabled.store(enabled, Ordering::Release);
        let mut metadata = entry.metadata.lock();
        metadata.next_run = if enabled {
            self.next_fire(&entry.cron_expression)
        } else {
            None
        };
        Ok(())
    }

    /// Run a task now, with the standard two-attempt policy. Used by the
    /// tick loop and exposed for manual triggering.
    pub async fn execute_task(&self, name: &str) -> Result<()> {
        let entry = self
            .tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown task \"{name}\"")))?;
        self.run_attempts(&entry).await;
        Ok(())
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.read().get(name).map(|e| TaskStatus {
            name: e.name.clone(),
            cron_expression: e.cron_expression.clone(),
            enabled: e.enabled.load(Ordering::Acquire),
            metadata: e.metadata.lock().clone(),
        })
    }

    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        let mut rows: Vec<_> = self
            .tasks
            .read()
            .values()
            .map(|e| TaskStatus {
                name: e.name.clone(),
                cron_expression: e.cron_expression.clone(),
                enabled: e.enabled.load(Ordering::Acquire),
                metadata: e.metadata.lock().clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Start the tick loop. Idempotent; a prior runner is replaced.
    pub fn start(&self) {
        let scheduler = self.clone();
        let tick = std::time::Duration::from_secs(self.config.tick_seconds.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.tick_once().await;
            }
        });
        if let Some(previous) = self.runner.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the runner. Registered tasks stay in place for a later start.
    pub fn shutdown(&self) {
        if let Some(handle) = self.runner.lock().take() {
            handle.abort();
        }
    }

    /// A namespacing handle for one skill: task names are registered as
    /// `"<skill>.<name>"`.
    pub fn client_for(&self, skill_name: &str) -> SchedulerClient {
        SchedulerClient {
            scheduler: self.clone(),
            prefix: skill_name.to_owned(),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn next_fire(&self, cron_expression: &str) -> Option<DateTime<Utc>> {
        cron_next_tz(cron_expression, &Utc::now(), parse_tz(&self.config.timezone))
    }

    /// Fire every due, enabled, not-in-flight task.
    async fn tick_once(&self) {
        let now = Utc::now();
        let due: Vec<Arc<TaskEntry>> = {
            let tasks = self.tasks.read();
            tasks
                .values()
                .filter(|e| {
                    e.enabled.load(Ordering::Acquire)
                        && !e.in_flight.load(Ordering::Acquire)
                        && e.metadata
                            .lock()
                            .next_run
                            .map(|t| t <= now)
                            .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        for entry in due {
            if entry.in_flight.swap(true, Ordering::AcqRel) {
                continue;
            }
            // Advance the schedule before running so a long execution
            // doesn't re-trigger on the next tick.
            entry.metadata.lock().next_run = self.next_fire(&entry.cron_expression);

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_attempts(&entry).await;
                entry.in_flight.store(false, Ordering::Release);
            });
        }
    }

    /// Two attempts total: one retry on any handler error. A double
    /// failure publishes the task-failed alert.
    async fn run_attempts(&self, entry: &TaskEntry) {
        let started_wall = Utc::now();
        let started = Instant::now();
        let mut last_error = String::new();

        let mut succeeded = false;
        for attempt in 1..=2u32 {
            match (entry.handler)().await {
                Ok(()) => {
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    last_error = redact(&e.to_string());
                    tracing::warn!(
                        task = %entry.name,
                        attempt,
                        error = %last_error,
                        "task attempt failed"
                    );
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut metadata = entry.metadata.lock();
            metadata.last_run = Some(started_wall);
            metadata.last_duration_ms = Some(duration_ms);
            metadata.last_result = Some(if succeeded {
                TaskResult::Success
            } else {
                TaskResult::Failure
            });
            if entry.enabled.load(Ordering::Acquire) {
                metadata.next_run = self.next_fire(&entry.cron_expression);
            }
        }

        if !succeeded {
            tracing::error!(task = %entry.name, error = %last_error, "task failed after retry");
            self.bus.publish(
                Event::new(topics::TASK_FAILED, "scheduler", Severity::High)
                    .with("taskName", serde_json::json!(entry.name))
                    .with("error", serde_json::json!(last_error)),
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill-scoped client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SchedulerClient {
    scheduler: TaskScheduler,
    prefix: String,
}

impl SchedulerClient {
    pub fn register_task(&self, mut def: TaskDefinition, overrides: Option<TaskOverride>) -> Result<()> {
        def.name = format!("{}.{}", self.prefix, def.name);
        self.scheduler.register_task(def, overrides)
    }

    pub fn toggle_task(&self, name: &str, enabled: bool) -> Result<()> {
        self.scheduler
            .toggle_task(&format!("{}.{}", self.prefix, name), enabled)
    }

    pub fn remove_task(&self, name: &str) -> bool {
        self.scheduler
            .remove_task(&format!("{}.{}", self.prefix, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventHandler;
    use std::sync::atomic::AtomicU32;

    fn scheduler() -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            Arc::new(EventBus::new()),
        ))
    }

    fn counting_handler(counter: Arc<AtomicU32>, fail_first: u32) -> TaskHandler {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    anyhow::bail!("NetworkError");
                }
                Ok(())
            })
        })
    }

    fn def(name: &str, handler: TaskHandler) -> TaskDefinition {
        TaskDefinition {
            name: name.into(),
            cron_expression: "*/5 * * * *".into(),
            handler,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn register_computes_next_run_for_enabled() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(calls, 0)), None)
            .unwrap();
        let status = s.task_status("x.poll").unwrap();
        assert!(status.enabled);
        assert!(status.metadata.next_run.is_some());
    }

    #[tokio::test]
    async fn disabled_registration_has_no_next_run() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        let mut d = def("x.poll", counting_handler(calls, 0));
        d.enabled = false;
        s.register_task(d, None).unwrap();
        assert!(s.task_status("x.poll").unwrap().metadata.next_run.is_none());
    }

    #[tokio::test]
    async fn override_replaces_cron_and_enabled() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(
            def("x.poll", counting_handler(calls, 0)),
            Some(TaskOverride {
                cron_expression: Some("0 * * * *".into()),
                enabled: Some(false),
            }),
        )
        .unwrap();
        let status = s.task_status("x.poll").unwrap();
        assert_eq!(status.cron_expression, "0 * * * *");
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn invalid_cron_rejected() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        let mut d = def("x.poll", counting_handler(calls, 0));
        d.cron_expression = "nope".into();
        assert!(s.register_task(d, None).is_err());
    }

    #[tokio::test]
    async fn success_on_first_attempt_runs_once() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(calls.clone(), 0)), None)
            .unwrap();
        s.execute_task("x.poll").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = s.task_status("x.poll").unwrap();
        assert_eq!(status.metadata.last_result, Some(TaskResult::Success));
        assert!(status.metadata.last_duration_ms.is_some());
    }

    #[tokio::test]
    async fn retry_once_then_succeed_publishes_no_alert() {
        let bus = Arc::new(EventBus::new());
        let alerts = Arc::new(AtomicU32::new(0));
        let alert_count = alerts.clone();
        let handler: EventHandler = Arc::new(move |_e| {
            let alert_count = alert_count.clone();
            Box::pin(async move {
                alert_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        bus.subscribe(topics::TASK_FAILED, handler).unwrap();

        let s = Arc::new(TaskScheduler::new(SchedulerConfig::default(), bus.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(calls.clone(), 1)), None)
            .unwrap();
        s.execute_task("x.poll").await.unwrap();
        bus.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "one failure + one retry");
        assert_eq!(alerts.load(Ordering::SeqCst), 0);
        assert_eq!(
            s.task_status("x.poll").unwrap().metadata.last_result,
            Some(TaskResult::Success)
        );
    }

    #[tokio::test]
    async fn double_failure_publishes_exactly_one_alert() {
        let bus = Arc::new(EventBus::new());
        let payloads: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = payloads.clone();
        let handler: EventHandler = Arc::new(move |e| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(e);
                Ok(())
            })
        });
        bus.subscribe("alert.system.*", handler).unwrap();

        let s = Arc::new(TaskScheduler::new(SchedulerConfig::default(), bus.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(calls.clone(), 99)), None)
            .unwrap();
        s.execute_task("x.poll").await.unwrap();
        bus.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly two attempts");
        let events = payloads.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, topics::TASK_FAILED);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].payload["taskName"], "x.poll");
        assert!(events[0].payload["error"]
            .as_str()
            .unwrap()
            .contains("NetworkError"));
        assert_eq!(
            s.task_status("x.poll").unwrap().metadata.last_result,
            Some(TaskResult::Failure)
        );
    }

    #[tokio::test]
    async fn toggle_clears_and_restores_next_run() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(calls, 0)), None)
            .unwrap();
        s.toggle_task("x.poll", false).unwrap();
        assert!(s.task_status("x.poll").unwrap().metadata.next_run.is_none());
        s.toggle_task("x.poll", true).unwrap();
        assert!(s.task_status("x.poll").unwrap().metadata.next_run.is_some());
        assert!(s.toggle_task("ghost", true).is_err());
    }

    #[tokio::test]
    async fn reregistering_replaces() {
        let s = scheduler();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        s.register_task(def("x.poll", counting_handler(first.clone(), 0)), None)
            .unwrap();
        s.register_task(def("x.poll", counting_handler(second.clone(), 0)), None)
            .unwrap();
        s.execute_task("x.poll").await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(s.list_tasks().len(), 1);
    }

    #[tokio::test]
    async fn scoped_client_namespaces_names() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        let client = s.client_for("email");
        client
            .register_task(
                TaskDefinition {
                    name: "poll".into(),
                    cron_expression: "*/5 * * * *".into(),
                    handler: counting_handler(calls, 0),
                    enabled: true,
                },
                None,
            )
            .unwrap();
        assert!(s.task_status("email.poll").is_some());
        assert!(s.task_status("poll").is_none());
        assert!(client.remove_task("poll"));
    }

    #[tokio::test]
    async fn due_task_fires_on_tick_and_skips_while_in_flight() {
        let s = scheduler();
        let calls = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let count = calls.clone();
        let handler: TaskHandler = Arc::new(move || {
            let gate = gate.clone();
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(())
            })
        });
        s.register_task(def("slow.job", handler), None).unwrap();
        // Force the task due.
        {
            let tasks = s.tasks.read();
            tasks.get("slow.job").unwrap().metadata.lock().next_run =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }

        s.tick_once().await;
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Still in flight: a second due tick must skip it.
        {
            let tasks = s.tasks.read();
            tasks.get("slow.job").unwrap().metadata.lock().next_run =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }
        s.tick_once().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "overlapping fire skipped");

        release.notify_waiters();
    }
}
