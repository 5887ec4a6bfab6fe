//! Per-`(user, channel)` conversation history.
//!
//! Each key owns a bounded deque of messages behind its own async mutex,
//! so appends and compaction on the same key serialize while different
//! keys proceed independently. Entries live in memory only; a process
//! restart clears them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use cg_domain::config::HistoryConfig;
use cg_domain::tool::Message;

/// History key for one conversation.
pub fn session_key(user_id: &str, channel: &str) -> String {
    format!("{user_id}:{channel}")
}

/// One stored history entry (re-exported message type).
pub type HistoryEntry = Message;

struct Session {
    entries: VecDeque<Message>,
}

pub struct ContextStore {
    config: HistoryConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl ContextStore {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn session(&self, key: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.read().get(key) {
            return session.clone();
        }
        let mut sessions = self.sessions.write();
        sessions
            .entry(key.to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session {
                    entries: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// Current entries for a key, oldest first.
    pub async fn snapshot(&self, key: &str) -> Vec<Message> {
        let session = self.session(key);
        let guard = session.lock().await;
        guard.entries.iter().cloned().collect()
    }

    /// Append entries, evicting the oldest past capacity.
    pub async fn append(&self, key: &str, entries: Vec<Message>) {
        let session = self.session(key);
        let mut guard = session.lock().await;
        for entry in entries {
            guard.entries.push_back(entry);
        }
        while guard.entries.len() > self.config.capacity {
            guard.entries.pop_front();
        }
    }

    /// Whether this key's history has grown past the compaction threshold.
    pub async fn compaction_due(&self, key: &str) -> bool {
        let session = self.session(key);
        let guard = session.lock().await;
        guard.entries.len() > self.config.compact_threshold
    }

    /// The oldest `compact_batch` entries, for summarization. Empty when
    /// compaction is not due.
    pub async fn compaction_batch(&self, key: &str) -> Vec<Message> {
        let session = self.session(key);
        let guard = session.lock().await;
        if guard.entries.len() <= self.config.compact_threshold {
            return Vec::new();
        }
        guard
            .entries
            .iter()
            .take(self.config.compact_batch)
            .cloned()
            .collect()
    }

    /// Replace the oldest `batch_len` entries with a single summary entry.
    /// Appends that raced in the meantime land at the back and are safe.
    pub async fn replace_with_summary(&self, key: &str, batch_len: usize, summary: Message) {
        let session = self.session(key);
        let mut guard = session.lock().await;
        let drop_count = batch_len.min(guard.entries.len());
        for _ in 0..drop_count {
            guard.entries.pop_front();
        }
        guard.entries.push_front(summary);
        tracing::debug!(key, dropped = drop_count, "history compacted");
    }

    pub async fn len(&self, key: &str) -> usize {
        let session = self.session(key);
        let guard = session.lock().await;
        guard.entries.len()
    }

    pub async fn is_empty(&self, key: &str) -> bool {
        self.len(key).await == 0
    }

    /// Drop a key's history entirely.
    pub fn clear(&self, key: &str) {
        self.sessions.write().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.sessions.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize, threshold: usize, batch: usize) -> ContextStore {
        ContextStore::new(HistoryConfig {
            capacity,
            compact_threshold: threshold,
            compact_batch: batch,
        })
    }

    #[tokio::test]
    async fn append_and_snapshot_preserve_order() {
        let store = store(10, 8, 4);
        let key = session_key("alice", "dm");
        store
            .append(&key, vec![Message::user("one"), Message::assistant("two")])
            .await;
        let snap = store.snapshot(&key).await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].content.extract_all_text(), "one");
        assert_eq!(snap[1].content.extract_all_text(), "two");
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = store(3, 8, 4);
        let key = session_key("alice", "dm");
        for i in 0..5 {
            store.append(&key, vec![Message::user(format!("m{i}"))]).await;
        }
        let snap = store.snapshot(&key).await;
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].content.extract_all_text(), "m2");
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store = store(10, 8, 4);
        store
            .append(&session_key("alice", "dm"), vec![Message::user("a")])
            .await;
        store
            .append(&session_key("alice", "general"), vec![Message::user("b")])
            .await;
        assert_eq!(store.len(&session_key("alice", "dm")).await, 1);
        assert_eq!(store.len(&session_key("alice", "general")).await, 1);
        assert_eq!(store.keys().len(), 2);
    }

    #[tokio::test]
    async fn compaction_batch_respects_threshold() {
        let store = store(100, 4, 3);
        let key = session_key("alice", "dm");
        for i in 0..4 {
            store.append(&key, vec![Message::user(format!("m{i}"))]).await;
        }
        assert!(!store.compaction_due(&key).await);
        assert!(store.compaction_batch(&key).await.is_empty());

        store.append(&key, vec![Message::user("m4")]).await;
        assert!(store.compaction_due(&key).await);
        let batch = store.compaction_batch(&key).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].content.extract_all_text(), "m0");
    }

    #[tokio::test]
    async fn summary_replaces_prefix() {
        let store = store(100, 4, 3);
        let key = session_key("alice", "dm");
        for i in 0..6 {
            store.append(&key, vec![Message::user(format!("m{i}"))]).await;
        }
        store
            .replace_with_summary(&key, 3, Message::user("[summary]"))
            .await;
        let snap = store.snapshot(&key).await;
        assert_eq!(snap.len(), 4);
        assert_eq!(snap[0].content.extract_all_text(), "[summary]");
        assert_eq!(snap[1].content.extract_all_text(), "m3");
    }

    #[tokio::test]
    async fn clear_drops_key() {
        let store = store(10, 8, 4);
        let key = session_key("alice", "dm");
        store.append(&key, vec![Message::user("x")]).await;
        store.clear(&key);
        assert!(store.is_empty(&key).await);
    }
}
