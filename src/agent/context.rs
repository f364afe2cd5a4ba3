//! System prompt assembly from workspace files.
//!
//! The prompt is the concatenation of whichever of the well-known workspace
//! files exist (each capped at 64 KiB) plus the memory context. Missing
//! files are simply skipped; an empty workspace yields just the base
//! identity line.

use std::fs;
use std::path::Path;

use crate::memory::MemoryStore;

const SECTION_MAX: usize = 64 << 10;

/// Workspace files injected into the system prompt, in order.
const CONTEXT_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "IDENTITY.md", "TOOLS.md"];

pub fn build_system_prompt(workspace: &Path) -> String {
    let mut parts = vec![
        "You are a personal AI assistant reachable over chat. Use the available tools to get things done; reply concisely.".to_string(),
    ];

    for name in CONTEXT_FILES {
        let Ok(content) = fs::read_to_string(workspace.join(name)) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        parts.push(truncate(content, SECTION_MAX));
    }

    let memory = MemoryStore::new(workspace).context();
    if !memory.is_empty() {
        parts.push(memory);
    }

    parts.join("\n\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n(truncated)", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_workspace_has_base_prompt() {
        let ws = tempfile::tempdir().unwrap();
        let prompt = build_system_prompt(ws.path());
        assert!(prompt.contains("personal AI assistant"));
    }

    #[test]
    fn workspace_files_are_included_in_order() {
        let ws = tempfile::tempdir().unwrap();
        fs::write(ws.path().join("SOUL.md"), "Be kind.").unwrap();
        fs::write(ws.path().join("USER.md"), "The user is Ada.").unwrap();
        fs::write(ws.path().join("IGNORED.md"), "not a context file").unwrap();

        let prompt = build_system_prompt(ws.path());
        let soul = prompt.find("Be kind.").unwrap();
        let user = prompt.find("The user is Ada.").unwrap();
        assert!(soul < user);
        assert!(!prompt.contains("not a context file"));
    }

    #[test]
    fn memory_context_is_appended() {
        let ws = tempfile::tempdir().unwrap();
        MemoryStore::new(ws.path())
            .write_long_term("# Long-term Memory\n\n- speaks French\n")
            .unwrap();
        let prompt = build_system_prompt(ws.path());
        assert!(prompt.contains("speaks French"));
    }

    #[test]
    fn oversized_sections_are_capped() {
        let ws = tempfile::tempdir().unwrap();
        fs::write(ws.path().join("AGENTS.md"), "x".repeat(SECTION_MAX + 50)).unwrap();
        let prompt = build_system_prompt(ws.path());
        assert!(prompt.contains("(truncated)"));
    }
}
