//! Compaction helpers — pure functions; the LLM call itself belongs to the
//! orchestrator, which summarizes with the light tier.

use cg_domain::tool::{Message, Role};

/// Render a batch of history entries as labelled plain text for the
/// summarizer prompt. Long entries (tool results, pasted blobs) are
/// clipped head+tail to keep the prompt bounded.
pub fn render_batch(entries: &[Message]) -> String {
    let mut buf = String::new();
    for entry in entries {
        let label = match entry.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::ToolResult => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        let text = entry.content.extract_all_text();
        if text.len() > 2_000 {
            let head_end = floor_char_boundary(&text, 1_000);
            let tail_start = ceil_char_boundary(&text, text.len() - 500);
            buf.push_str(&text[..head_end]);
            buf.push_str(" [...] ");
            buf.push_str(&text[tail_start..]);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

/// The summarizer prompt for one compaction batch.
pub fn summary_prompt(entries: &[Message]) -> String {
    format!(
        "Summarize the following conversation history into a concise summary \
         that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\n\
         Be concise but preserve all actionable context. Write in present \
         tense. Omit greetings and pleasantries.\n\n\
         CONVERSATION:\n{}",
        render_batch(entries)
    )
}

/// Wrap a generated summary as the history entry that replaces the batch.
pub fn summary_entry(summary: &str) -> Message {
    Message::user(format!("[Summary of earlier conversation]\n{summary}"))
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
