//! Glob-pattern publish/subscribe event bus.
//!
//! Publishers may themselves be subscribers, so `publish` never runs
//! handlers inline: events land in an inbox and a single dispatcher task
//! drains it, fanning each event out to every matching handler in
//! subscription order. Handler failures are logged and never block
//! delivery to siblings. One inbox means per-publisher ordering holds for
//! every subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use cg_domain::error::{Error, Result};
use cg_domain::event::Event;

/// An async event handler. Errors are caught and logged by the dispatcher.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Subscription {
    pattern: String,
    regex: Regex,
    handler: EventHandler,
}

/// Compile a glob pattern (`.` literal separator, `*` wildcard) to an
/// anchored regex.
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            ch => out.push_str(&regex::escape(&ch.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::Config(format!("invalid event pattern \"{pattern}\": {e}")))
}

struct Inner {
    subscriptions: RwLock<Vec<Subscription>>,
    published: AtomicU64,
    processed: AtomicU64,
    processed_notify: Notify,
}

pub struct EventBus {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Event>,
    dispatcher: JoinHandle<()>,
}

impl EventBus {
    /// Create the bus and start its dispatcher task.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let inner = Arc::new(Inner {
            subscriptions: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            processed_notify: Notify::new(),
        });

        let dispatcher_inner = inner.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let matching: Vec<EventHandler> = {
                    let subs = dispatcher_inner.subscriptions.read();
                    subs.iter()
                        .filter(|s| s.regex.is_match(&event.event_type))
                        .map(|s| s.handler.clone())
                        .collect()
                };
                for handler in matching {
                    if let Err(e) = handler(event.clone()).await {
                        tracing::warn!(
                            event_type = %event.event_type,
                            error = %e,
                            "event handler failed"
                        );
                    }
                }
                dispatcher_inner.processed.fetch_add(1, Ordering::Release);
                dispatcher_inner.processed_notify.notify_waiters();
            }
        });

        Self {
            inner,
            tx,
            dispatcher,
        }
    }

    /// Subscribe a handler to a glob pattern. Returns an error only for an
    /// uncompilable pattern.
    pub fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<()> {
        let regex = compile_pattern(pattern)?;
        self.inner.subscriptions.write().push(Subscription {
            pattern: pattern.to_owned(),
            regex,
            handler,
        });
        Ok(())
    }

    /// Enqueue an event for delivery. Non-blocking; safe from any context.
    pub fn publish(&self, event: Event) {
        tracing::debug!(event_type = %event.event_type, source = %event.source, "event published");
        self.inner.published.fetch_add(1, Ordering::Release);
        if self.tx.send(event).is_err() {
            tracing::warn!("event bus is shut down, event dropped");
        }
    }

    /// Await delivery of everything published so far.
    pub async fn drain(&self) {
        loop {
            let target = self.inner.published.load(Ordering::Acquire);
            if self.inner.processed.load(Ordering::Acquire) >= target {
                return;
            }
            let notified = self.inner.processed_notify.notified();
            if self.inner.processed.load(Ordering::Acquire) >= target {
                return;
            }
            notified.await;
        }
    }

    /// Current subscription patterns (diagnostics).
    pub fn patterns(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .read()
            .iter()
            .map(|s| s.pattern.clone())
            .collect()
    }

    /// Stop the dispatcher after the inbox drains.
    pub async fn shutdown(self) {
        self.drain().await;
        drop(self.tx);
        let _ = self.dispatcher.await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
