/// Shared error type used across all Concierge crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Sentinel for total provider outage. The only error the orchestrator
    /// lets escape its boundary; the embedding application converts it to a
    /// user-facing apology.
    #[error("All LLM providers are currently unavailable")]
    ProvidersUnavailable,

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("subagent: {0}")]
    Subagent(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classification of a failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network resets, timeouts, 5xx, "overloaded". Retry with backoff.
    Transient,
    /// 429 or explicit rate-limit wording. Retry with backoff.
    RateLimited,
    /// 401 / expired credentials. Refresh, then retry once.
    AuthExpired,
    /// JSON parse failures in expected structured output. Reprompt.
    MalformedOutput,
    /// Tool input failed validation. Reprompt the LLM once.
    SchemaViolation,
    /// Token budget / tool-call caps / context length. Terminal.
    ResourceExhausted,
    /// 400/404/422, missing config. Terminal.
    Permanent,
    /// Anything else. Terminal.
    Unknown,
}

impl ErrorClass {
    /// Whether an operation that failed with this class is worth one more
    /// attempt without any external change.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Classify an error message into a taxonomy class.
///
/// The match is textual by necessity: failures arrive from providers,
/// skills, and the OS with no shared structure beyond their messages.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if lower.contains("429") || lower.contains("rate limit") {
        return ErrorClass::RateLimited;
    }
    if lower.contains("401")
        || lower.contains("token expired")
        || lower.contains("invalid_grant")
    {
        return ErrorClass::AuthExpired;
    }
    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("overloaded")
        || lower.contains("capacity")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        return ErrorClass::Transient;
    }
    if lower.contains("token budget")
        || lower.contains("context length")
        || lower.contains("maximum number of")
        || lower.contains("too many tool calls")
    {
        return ErrorClass::ResourceExhausted;
    }
    if lower.contains("invalid input") || lower.contains("schema") {
        return ErrorClass::SchemaViolation;
    }
    if lower.contains("expected value")
        || lower.contains("parse error")
        || lower.contains("invalid json")
    {
        return ErrorClass::MalformedOutput;
    }
    if lower.contains("400")
        || lower.contains("404")
        || lower.contains("422")
        || lower.contains("missing config")
        || lower.contains("not configured")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}
