//! Audit trail contract.
//!
//! The registry writes one entry per dispatched tool call, fire-and-forget:
//! audit failures are logged and never block the request path. The actual
//! sink (database table, log shipper) is supplied by the embedding
//! application.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cg_domain::error::Result;

/// One tool-call audit record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub user_id: String,
    pub skill: String,
    pub tool: String,
    /// The tool is flagged sensitive; sinks may store inputs hashed.
    pub sensitive: bool,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Discards entries. Used in tests and when auditing is not configured.
pub struct NullAuditSink;

#[async_trait::async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _entry: AuditEntry) -> Result<()> {
        Ok(())
    }
}

/// Write an audit entry in the background.
pub fn fire_audit(sink: Arc<dyn AuditSink>, entry: AuditEntry) {
    tokio::spawn(async move {
        let tool = entry.tool.clone();
        if let Err(e) = sink.record(entry).await {
            tracing::warn!(tool, error = %e, "audit write failed");
        }
    });
}
