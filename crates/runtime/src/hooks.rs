//! Side-channel contracts consumed by the runtime.
//!
//! All of these are fire-and-forget from the request path: failures are
//! logged, never surfaced. The embedding application supplies real
//! implementations; the no-op defaults keep tests and minimal deployments
//! honest.

use std::collections::HashMap;

use cg_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Long-term memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct MemoryIngestRequest {
    pub user_id: String,
    pub content: String,
    pub source: String,
    pub metadata: HashMap<String, String>,
}

/// Semantic memory service. Ingestion runs in the background after each
/// turn; retrieval feeds the system-prompt memory snippet.
#[async_trait::async_trait]
pub trait MemoryService: Send + Sync {
    async fn ingest(&self, req: MemoryIngestRequest) -> Result<()>;

    /// Relevant memory snippets for a query, most relevant first.
    async fn retrieve(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<String>>;
}

pub struct NullMemory;

#[async_trait::async_trait]
impl MemoryService for NullMemory {
    async fn ingest(&self, _req: MemoryIngestRequest) -> Result<()> {
        Ok(())
    }

    async fn retrieve(&self, _user_id: &str, _query: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Async announcements
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Delivers deferred sub-agent results back to a channel. Channel ids are
/// opaque; the embedding application routes them.
#[async_trait::async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, channel: &str, message: &str);
}

pub struct NullAnnouncer;

#[async_trait::async_trait]
impl Announcer for NullAnnouncer {
    async fn announce(&self, _channel: &str, _message: &str) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error pattern aggregation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives tool errors for trend detection ("the email skill has failed
/// 12 times today"). Purely advisory.
#[async_trait::async_trait]
pub trait ErrorPatternSink: Send + Sync {
    async fn record(&self, tool: &str, error: &str) -> Result<()>;
}

pub struct NullErrorPatternSink;

#[async_trait::async_trait]
impl ErrorPatternSink for NullErrorPatternSink {
    async fn record(&self, _tool: &str, _error: &str) -> Result<()> {
        Ok(())
    }
}
