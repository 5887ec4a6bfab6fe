//! Shared domain types for the Concierge agent runtime.
//!
//! Everything here is transport-agnostic: messages, tool definitions,
//! published events, caller context, cancellation, configuration, and the
//! workspace error type with its retry taxonomy.

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod redact;
pub mod tool;

pub use cancel::CancelToken;
pub use context::CallerContext;
pub use error::{Error, ErrorClass, Result};
