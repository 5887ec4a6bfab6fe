//! Redaction of sensitive substrings from error messages and logs.
//!
//! Applied before any raw error text is logged, published on the bus, or
//! surfaced to a user. Masks bearer/API tokens, `key=value` credential
//! pairs, and IPv4 addresses.

use regex::Regex;
use std::sync::OnceLock;

const MASK: &str = "[redacted]";

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(bearer|token)\s+[A-Za-z0-9._\-]{8,}").unwrap())
}

fn credential_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(api[_-]?key|secret|password|passwd|access[_-]?token)\s*[=:]\s*[^\s"',;]+"#)
            .unwrap()
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,3}\.){3}\d{1,3}\b").unwrap())
}

/// Long unbroken token-shaped strings (e.g. leaked API keys with a known
/// vendor prefix).
fn key_material_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(sk|pk|ghp|xox[bap])[-_][A-Za-z0-9_\-]{16,}\b").unwrap())
}

/// Mask sensitive substrings in `text`.
pub fn redact(text: &str) -> String {
    let out = bearer_re().replace_all(text, MASK);
    let out = credential_pair_re().replace_all(&out, MASK);
    let out = key_material_re().replace_all(&out, MASK);
    let out = ipv4_re().replace_all(&out, MASK);
    out.into_owned()
}
