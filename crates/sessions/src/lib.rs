//! In-memory conversation state for the Concierge runtime.
//!
//! History lives per `(user_id, channel)` key, bounded by capacity and
//! compacted into a summary prefix when it grows long. The session
//! tool-call counter enforces the hourly cap.

pub mod compact;
pub mod counter;
pub mod history;

pub use counter::SessionToolCounter;
pub use history::{session_key, ContextStore, HistoryEntry};
