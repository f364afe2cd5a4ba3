//! Session consolidation into long-term memory.
//!
//! When a session outgrows the memory window, the old messages are
//! summarized by a dedicated LLM call into a history entry plus an updated
//! long-term memory, then committed with a version CAS. If the session
//! advanced while the summary ran, the commit is a silent no-op and the
//! next trigger retries.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::llm::{ChatMessage, LlmClient};
use crate::memory::MemoryStore;
use crate::session::{Message, Session};

/// Run one consolidation pass. Returns whether a consolidation committed.
pub async fn maybe_consolidate_session<F, Fut>(
    workspace: &Path,
    session: &Session,
    memory_window: usize,
    summarize: F,
) -> Result<bool, String>
where
    F: FnOnce(String, String) -> Fut,
    Fut: Future<Output = Result<(String, String), String>>,
{
    let memory_window = if memory_window == 0 { 50 } else { memory_window };
    let Some((old_messages, keep, version)) = session.snapshot_for_consolidation(memory_window)
    else {
        return Ok(false);
    };

    let conversation = format_conversation(&old_messages);
    let store = MemoryStore::new(workspace);
    let current_memory = store.read_long_term();

    let (history_entry, memory_update) = summarize(current_memory.clone(), conversation).await?;

    if !session.apply_consolidation(version, keep) {
        debug!(key = session.key(), "session advanced during consolidation, skipping commit");
        return Ok(false);
    }

    if !history_entry.trim().is_empty() {
        store
            .append_history(history_entry.trim())
            .map_err(|e| format!("append history: {e}"))?;
    }
    let memory_update = memory_update.trim();
    if !memory_update.is_empty() && memory_update != current_memory.trim() {
        store
            .write_long_term(&format!("{memory_update}\n"))
            .map_err(|e| format!("write memory: {e}"))?;
    }
    Ok(true)
}

/// Summarize via the LLM, expecting strict JSON
/// `{history_entry, memory_update}` (markdown fences tolerated).
pub async fn summarize_with_llm(
    llm: Arc<dyn LlmClient>,
    current_memory: String,
    conversation: String,
) -> Result<(String, String), String> {
    let prompt = build_consolidation_prompt(&current_memory, &conversation);
    let result = llm
        .chat(
            &[
                ChatMessage::system(
                    "You are a memory consolidation agent. Respond only with valid JSON.",
                ),
                ChatMessage::user(prompt),
            ],
            &[],
        )
        .await
        .map_err(|e| e.to_string())?;

    let text = strip_markdown_fences(result.content.trim());
    if text.is_empty() {
        return Err("empty consolidation response".into());
    }

    #[derive(Deserialize)]
    struct Consolidation {
        #[serde(default)]
        history_entry: String,
        #[serde(default)]
        memory_update: String,
    }
    let parsed: Consolidation =
        serde_json::from_str(&text).map_err(|e| format!("parse consolidation json: {e}"))?;
    Ok((
        parsed.history_entry.trim().to_string(),
        parsed.memory_update.trim().to_string(),
    ))
}

fn strip_markdown_fences(text: &str) -> String {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = match text.find('\n') {
            Some(i) => text[i + 1..].trim(),
            None => text,
        };
        text = text.trim_end_matches("```").trim();
    }
    text.to_string()
}

/// Render old messages as `[ts] ROLE [tools: ...]: content` lines.
pub fn format_conversation(msgs: &[Message]) -> String {
    let mut lines = Vec::with_capacity(msgs.len());
    for msg in msgs {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }
        let ts = msg.timestamp.trim();
        let ts = if ts.len() >= 16 { &ts[..16] } else { ts };
        let role = msg.role.as_str().to_uppercase();
        let tools = format_tools_label(&msg.tools_used);
        if ts.is_empty() {
            lines.push(format!("{role}{tools}: {content}"));
        } else {
            lines.push(format!("[{ts}] {role}{tools}: {content}"));
        }
    }
    lines.join("\n")
}

fn format_tools_label(names: &[String]) -> String {
    let tools: Vec<&str> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if tools.is_empty() {
        String::new()
    } else {
        format!(" [tools: {}]", tools.join(", "))
    }
}

fn build_consolidation_prompt(current_memory: &str, conversation: &str) -> String {
    let current_memory = if current_memory.trim().is_empty() {
        "(empty)"
    } else {
        current_memory
    };
    format!(
        r#"You are a memory consolidation agent. Process this conversation and return a JSON object with exactly two keys:

1. "history_entry": A paragraph (2-5 sentences) summarizing key events, decisions, and topics. Start with a timestamp like [YYYY-MM-DD HH:MM].
2. "memory_update": Updated long-term memory content. Add durable facts (preferences, profile, project context, decisions). If nothing new, return existing content unchanged.

## Current Long-term Memory
{current_memory}

## Conversation to Process
{conversation}

Respond with ONLY valid JSON, no markdown fences."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use std::fs;

    #[tokio::test]
    async fn no_op_under_window() {
        let ws = tempfile::tempdir().unwrap();
        let session = Session::new("cli:test");
        for _ in 0..6 {
            session.add(Role::User, "msg");
            session.add(Role::Assistant, "reply");
        }
        let done = maybe_consolidate_session(ws.path(), &session, 20, |_, _| async {
            panic!("summarizer must not run under the window")
        })
        .await
        .unwrap();
        assert!(!done);
        assert_eq!(session.message_count(), 12);
    }

    #[tokio::test]
    async fn trims_and_archives() {
        let ws = tempfile::tempdir().unwrap();
        let session = Session::new("cli:test");
        for _ in 0..15 {
            session.add(Role::User, "question");
            session.add_with_tools(
                Role::Assistant,
                "answer",
                &["read_file".into(), "exec".into()],
            );
        }

        let done = maybe_consolidate_session(ws.path(), &session, 20, |_, conversation| async move {
            assert!(conversation.contains("USER: question"));
            assert!(conversation.contains("ASSISTANT [tools: read_file, exec]: answer"));
            Ok((
                "[2026-02-13 23:20] archived summary".to_string(),
                "# Long-term Memory\n\n- prefers concise answers".to_string(),
            ))
        })
        .await
        .unwrap();
        assert!(done);

        // keep = min(10, max(2, 20/2)) = 10
        assert_eq!(session.message_count(), 10);

        let history = fs::read_to_string(ws.path().join("memory/HISTORY.md")).unwrap();
        assert!(history.contains("# Session History"));
        assert!(history.contains("archived summary"));

        let memory = fs::read_to_string(ws.path().join("memory/MEMORY.md")).unwrap();
        assert!(memory.contains("prefers concise answers"));
    }

    #[tokio::test]
    async fn summarize_error_leaves_session_intact() {
        let ws = tempfile::tempdir().unwrap();
        let session = Session::new("cli:test");
        for _ in 0..15 {
            session.add(Role::User, "question");
            session.add(Role::Assistant, "answer");
        }
        let result = maybe_consolidate_session(ws.path(), &session, 20, |_, _| async {
            Err("deadline exceeded".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(session.message_count(), 30);
    }

    #[tokio::test]
    async fn stale_version_skips_commit() {
        let ws = tempfile::tempdir().unwrap();
        let session = Session::new("cli:test");
        for _ in 0..30 {
            session.add(Role::User, "m");
        }
        let done = maybe_consolidate_session(ws.path(), &session, 20, |_, _| async {
            // The session advances while the summary runs.
            session.add(Role::User, "late arrival");
            Ok(("entry".to_string(), String::new()))
        })
        .await
        .unwrap();
        assert!(!done);
        assert_eq!(session.message_count(), 31);
        assert!(!ws.path().join("memory/HISTORY.md").exists());
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(
            strip_markdown_fences("```json\n{\"a\":1}\n```"),
            "{\"a\":1}"
        );
        assert_eq!(strip_markdown_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn conversation_formatting_skips_empty() {
        let mut msg = Message::new(Role::User, "  ");
        msg.timestamp = String::new();
        let msgs = vec![msg, Message::new(Role::Assistant, "hello")];
        let out = format_conversation(&msgs);
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("ASSISTANT: hello"));
    }
}
