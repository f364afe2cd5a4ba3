//! Long-term memory files under `<workspace>/memory/`.
//!
//! `MEMORY.md` holds durable facts, `HISTORY.md` accumulates consolidation
//! summaries, and `YYYY-MM-DD.md` holds the day's notes. All reads are
//! tolerant of missing files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

const CONTEXT_SECTION_MAX: usize = 64 << 10;

/// File-backed memory store rooted at a workspace directory.
pub struct MemoryStore {
    dir: PathBuf,
    long_term: PathBuf,
    history: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        let dir = workspace.join("memory");
        Self {
            long_term: dir.join("MEMORY.md"),
            history: dir.join("HISTORY.md"),
            dir,
        }
    }

    pub fn today_date() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    pub fn today_path(&self) -> PathBuf {
        self.dir.join(format!("{}.md", Self::today_date()))
    }

    fn ensure_initialized(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        if !self.long_term.exists() {
            let _ = fs::write(&self.long_term, "# Long-term Memory\n\n");
        }
        Ok(())
    }

    pub fn read_long_term(&self) -> String {
        let _ = self.ensure_initialized();
        fs::read_to_string(&self.long_term).unwrap_or_default()
    }

    pub fn read_today(&self) -> String {
        let _ = self.ensure_initialized();
        fs::read_to_string(self.today_path()).unwrap_or_default()
    }

    /// Replace the long-term memory contents.
    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        self.ensure_initialized()?;
        fs::write(&self.long_term, content)
    }

    /// Append one consolidation summary to `HISTORY.md`, creating the file
    /// with its header on first use.
    pub fn append_history(&self, entry: &str) -> std::io::Result<()> {
        self.ensure_initialized()?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history)?;
        if f.metadata()?.len() == 0 {
            f.write_all(b"# Session History\n\n")?;
        }
        f.write_all(entry.trim_end().as_bytes())?;
        f.write_all(b"\n\n")?;
        Ok(())
    }

    /// Memory context injected into the system prompt: long-term memory plus
    /// today's notes, each capped at 64 KiB.
    pub fn context(&self) -> String {
        let long_term = self.read_long_term().trim().to_string();
        let today = self.read_today().trim().to_string();

        let mut parts = Vec::new();
        if !long_term.is_empty() {
            parts.push(format!(
                "## Long-term Memory\n{}",
                truncate(&long_term, CONTEXT_SECTION_MAX)
            ));
        }
        if !today.is_empty() {
            parts.push(format!(
                "## Today's Notes\n{}",
                truncate(&today, CONTEXT_SECTION_MAX)
            ));
        }
        parts.join("\n\n")
    }
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
    fn history_gets_header_once() {
        let ws = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(ws.path());
        store.append_history("[2026-01-01 10:00] first").unwrap();
        store.append_history("[2026-01-02 10:00] second").unwrap();

        let content = fs::read_to_string(ws.path().join("memory/HISTORY.md")).unwrap();
        assert_eq!(content.matches("# Session History").count(), 1);
        assert!(content.contains("first"));
        assert!(content.contains("second"));
    }

    #[test]
    fn context_includes_long_term() {
        let ws = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(ws.path());
        store.write_long_term("# Long-term Memory\n\n- likes rust\n").unwrap();
        let ctx = store.context();
        assert!(ctx.contains("## Long-term Memory"));
        assert!(ctx.contains("likes rust"));
        assert!(!ctx.contains("Today's Notes"));
    }

    #[test]
    fn empty_workspace_has_default_memory() {
        let ws = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(ws.path());
        assert!(store.read_long_term().contains("# Long-term Memory"));
        assert_eq!(store.read_today(), "");
    }
}
