//! Filesystem tools and the path safety policy behind them.
//!
//! Every path from the model goes through [`ToolRegistry::resolve_path`]:
//! reject traversal (plain and percent-encoded), expand `~/`, absolutize,
//! deny the config-sensitive directories, and, when workspace restriction
//! is on, resolve symlinks and re-apply every check against the resolved
//! path. Writes additionally refuse a symlinked target.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::ToolError;
use crate::paths;
use crate::tools::ToolRegistry;

const MAX_READ_BYTES: usize = 512 << 10;
const DEFAULT_LIST_ENTRIES: usize = 200;

fn has_parent_traversal(path: &str) -> bool {
    path.replace('\\', "/")
        .split('/')
        .any(|part| part == "..")
}

fn is_same_or_child(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Lexically normalize a path: drop `.` components, resolve nothing else.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn blocked_sensitive_paths() -> Vec<PathBuf> {
    let Ok(cfg_dir) = paths::config_dir() else {
        return Vec::new();
    };
    paths::SENSITIVE_DIR_NAMES
        .iter()
        .map(|name| clean_path(&cfg_dir.join(name)))
        .collect()
}

/// Deny the filesystem root and the config-sensitive directories.
pub(crate) fn ensure_path_allowed_by_policy(abs: &Path) -> Result<(), ToolError> {
    let abs = clean_path(abs);
    if abs == Path::new("/") {
        return Err(ToolError::Blocked("path is blocked by safety policy: /".into()));
    }
    for blocked in blocked_sensitive_paths() {
        if is_same_or_child(&abs, &blocked) {
            return Err(ToolError::Blocked(format!(
                "path is blocked by safety policy: {}",
                abs.display()
            )));
        }
    }
    Ok(())
}

pub(crate) fn expand_home_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl ToolRegistry {
    pub(crate) fn workspace_abs(&self) -> Result<PathBuf, ToolError> {
        let ws = std::path::absolute(&self.workspace_dir)
            .map_err(|e| ToolError::ExecutionFailed(format!("resolve workspace: {e}")))?;
        let ws = clean_path(&ws);
        if ws == Path::new("/") {
            return Err(ToolError::Blocked(
                "workspace root '/' is not allowed when tools are restricted".into(),
            ));
        }
        Ok(ws)
    }

    /// Resolve a model-supplied path to an absolute, policy-checked path.
    pub(crate) fn resolve_path(&self, p: &str) -> Result<PathBuf, ToolError> {
        if p.trim().is_empty() {
            return Err(ToolError::InvalidParameters("path is empty".into()));
        }
        if p.contains('\0') {
            return Err(ToolError::Blocked("path contains null byte".into()));
        }
        if has_parent_traversal(p) {
            return Err(ToolError::Blocked("path traversal is not allowed".into()));
        }
        let lower = p.to_ascii_lowercase();
        if lower.contains("..%2f") || lower.contains("%2f..") || lower.contains("%2e%2e") {
            return Err(ToolError::Blocked(
                "encoded path traversal is not allowed".into(),
            ));
        }

        let expanded = if p == "~" || p.starts_with("~/") {
            expand_home_path(p)
        } else {
            PathBuf::from(p)
        };

        let abs = if expanded.is_absolute() {
            clean_path(&expanded)
        } else {
            clean_path(&self.workspace_dir.join(&expanded))
        };
        let abs = std::path::absolute(&abs)
            .map_err(|e| ToolError::ExecutionFailed(format!("resolve path: {e}")))?;
        ensure_path_allowed_by_policy(&abs)?;

        if !self.restrict_to_workspace {
            return Ok(abs);
        }

        let ws_abs = self.workspace_abs()?;
        if abs == ws_abs {
            return Ok(abs);
        }
        if !is_same_or_child(&abs, &ws_abs) {
            return Err(ToolError::Blocked(format!(
                "path is outside workspace: {}",
                abs.display()
            )));
        }

        // Symlinks could escape the lexical check; resolve and re-verify.
        let resolved = match fs::canonicalize(&abs) {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(abs),
            Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
        };
        let resolved = clean_path(&resolved);
        ensure_path_allowed_by_policy(&resolved)?;
        let ws_resolved = fs::canonicalize(&ws_abs)
            .map(|p| clean_path(&p))
            .unwrap_or(ws_abs);
        if !is_same_or_child(&resolved, &ws_resolved) {
            return Err(ToolError::Blocked(format!(
                "path is outside workspace: {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    pub(crate) fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let abs = self.resolve_path(path)?;
        let bytes = fs::read(&abs)?;
        if bytes.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while end > 0 && bytes[end - 1] & 0xC0 == 0x80 {
                end -= 1;
            }
            let text = String::from_utf8_lossy(&bytes[..end]);
            return Ok(format!("{}\n\n(truncated)", text));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn write_file(&self, path: &str, content: &str) -> Result<String, ToolError> {
        let abs = self.resolve_path(path)?;
        let parent = abs
            .parent()
            .ok_or_else(|| ToolError::InvalidParameters("path has no parent".into()))?;
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o755));
        }

        let parent_resolved = fs::canonicalize(parent).map(|p| clean_path(&p))?;
        if self.restrict_to_workspace {
            let ws_abs = self.workspace_abs()?;
            let ws_resolved = fs::canonicalize(&ws_abs)
                .map(|p| clean_path(&p))
                .unwrap_or(ws_abs);
            if !is_same_or_child(&parent_resolved, &ws_resolved) {
                return Err(ToolError::Blocked(format!(
                    "path is outside workspace: {}",
                    parent_resolved.display()
                )));
            }
        }
        let file_name = abs
            .file_name()
            .ok_or_else(|| ToolError::InvalidParameters("path has no file name".into()))?;
        let target = parent_resolved.join(file_name);
        ensure_path_allowed_by_policy(&target)?;
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() {
                return Err(ToolError::Blocked(format!(
                    "refusing to write through symlink: {}",
                    target.display()
                )));
            }
        }
        write_mode_0644(&target, content)?;
        Ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            target.display()
        ))
    }

    pub(crate) fn edit_file(
        &self,
        path: &str,
        start_line: i64,
        end_line: i64,
        new_text: &str,
    ) -> Result<String, ToolError> {
        let abs = self.resolve_path(path)?;
        let content = fs::read_to_string(&abs)?;
        // Split keeps a trailing empty element when the file ends in '\n',
        // so joining reproduces the original trailing newline.
        let lines: Vec<&str> = content.split('\n').collect();

        if start_line <= 0 {
            return Err(ToolError::InvalidParameters("startLine must be >= 1".into()));
        }
        if end_line < 0 {
            return Err(ToolError::InvalidParameters("endLine must be >= 0".into()));
        }
        let start = start_line as usize;
        let end = end_line as usize;
        if start > lines.len() + 1 {
            return Err(ToolError::InvalidParameters(format!(
                "startLine out of range: {} (max {})",
                start,
                lines.len() + 1
            )));
        }
        if end > lines.len() {
            return Err(ToolError::InvalidParameters(format!(
                "endLine out of range: {} (max {})",
                end,
                lines.len()
            )));
        }

        let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 8);
        let i = start - 1;
        if end_line < start_line {
            // Insert before startLine.
            out.extend_from_slice(&lines[..i]);
            out.extend(new_text.split('\n'));
            out.extend_from_slice(&lines[i..]);
        } else {
            // Replace [start..end] inclusive.
            out.extend_from_slice(&lines[..i]);
            out.extend(new_text.split('\n'));
            out.extend_from_slice(&lines[end..]);
        }
        write_mode_0644(&abs, &out.join("\n"))?;
        Ok(format!("edited {}", abs.display()))
    }

    pub(crate) fn edit_file_replace(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<String, ToolError> {
        let abs = self.resolve_path(path)?;
        if old_text.trim().is_empty() {
            return Err(ToolError::InvalidParameters("old_text is empty".into()));
        }
        let content = fs::read_to_string(&abs)?;
        let count = content.matches(old_text).count();
        if count == 0 {
            return Err(ToolError::InvalidParameters(
                "old_text not found in file".into(),
            ));
        }
        if count > 1 {
            return Err(ToolError::InvalidParameters(format!(
                "old_text appears {count} times; make it unique"
            )));
        }
        let updated = content.replacen(old_text, new_text, 1);
        write_mode_0644(&abs, &updated)?;
        Ok(format!("edited {}", abs.display()))
    }

    pub(crate) fn list_dir(
        &self,
        path: &str,
        recursive: bool,
        max_entries: usize,
    ) -> Result<String, ToolError> {
        let max_entries = if max_entries == 0 {
            DEFAULT_LIST_ENTRIES
        } else {
            max_entries
        };
        let abs = self.resolve_path(path)?;
        let mut entries: Vec<String> = Vec::new();

        if !recursive {
            let mut names: Vec<String> = fs::read_dir(&abs)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            for name in names {
                entries.push(name);
                if entries.len() >= max_entries {
                    break;
                }
            }
        } else {
            walk_dir(&abs, &abs, max_entries, &mut entries)?;
        }

        serde_json::to_string(&entries)
            .map_err(|e| ToolError::ExecutionFailed(format!("serialize listing: {e}")))
    }
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    max_entries: usize,
    entries: &mut Vec<String>,
) -> Result<(), ToolError> {
    let Ok(read) = fs::read_dir(dir) else {
        return Ok(());
    };
    let mut children: Vec<_> = read.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());
    for child in children {
        if entries.len() >= max_entries {
            return Ok(());
        }
        let path = child.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let is_dir = child.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            entries.push(format!("{}/", rel));
            if entries.len() >= max_entries {
                return Ok(());
            }
            walk_dir(root, &path, max_entries, entries)?;
        } else {
            entries.push(rel);
        }
    }
    Ok(())
}

fn write_mode_0644(path: &Path, content: &str) -> Result<(), ToolError> {
    use std::io::Write;
    let mut opts = fs::OpenOptions::new();
    opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    let mut f = opts.open(path)?;
    f.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ws: &Path, restrict: bool) -> ToolRegistry {
        ToolRegistry::new(ws.to_path_buf(), restrict)
    }

    #[test]
    fn rejects_traversal_and_nul() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        assert!(r.resolve_path("../x").is_err());
        assert!(r.resolve_path("a/../../x").is_err());
        assert!(r.resolve_path("a\0b").is_err());
        assert!(r.resolve_path("").is_err());
        assert!(r.resolve_path("a/..%2fescape").is_err());
        assert!(r.resolve_path("%2e%2e/escape").is_err());
    }

    #[test]
    fn restricted_rejects_outside_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        assert!(r.resolve_path("/etc/hosts").is_err());
        assert!(r.resolve_path("notes.txt").is_ok());
    }

    #[test]
    fn unrestricted_allows_absolute_but_not_sensitive() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), false);
        assert!(r.resolve_path("/etc/hosts").is_ok());
        if let Ok(cfg) = crate::paths::config_dir() {
            let auth = cfg.join("auth").join("token.json");
            assert!(r.resolve_path(auth.to_str().unwrap()).is_err());
        }
    }

    #[test]
    fn read_truncates_large_files() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        let big = "x".repeat(MAX_READ_BYTES + 100);
        fs::write(ws.path().join("big.txt"), &big).unwrap();
        let out = r.read_file("big.txt").unwrap();
        assert!(out.ends_with("(truncated)"));
        assert!(out.len() < big.len() + 32);
    }

    #[test]
    fn write_and_read_roundtrip() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        let msg = r.write_file("sub/dir/hello.txt", "hi there").unwrap();
        assert!(msg.contains("8 bytes"));
        assert_eq!(r.read_file("sub/dir/hello.txt").unwrap(), "hi there");
    }

    #[cfg(unix)]
    #[test]
    fn refuses_to_write_through_symlink() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        fs::write(ws.path().join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink(ws.path().join("real.txt"), ws.path().join("link.txt"))
            .unwrap();
        assert!(r.write_file("link.txt", "y").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_workspace_is_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            ws.path().join("alias.txt"),
        )
        .unwrap();
        let r = registry(ws.path(), true);
        assert!(r.read_file("alias.txt").is_err());
    }

    #[test]
    fn edit_file_insert_and_replace() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        fs::write(ws.path().join("f.txt"), "a\nb\nc\n").unwrap();

        // endLine < startLine inserts before startLine.
        r.edit_file("f.txt", 2, 0, "x").unwrap();
        assert_eq!(r.read_file("f.txt").unwrap(), "a\nx\nb\nc\n");

        // Inclusive replace.
        r.edit_file("f.txt", 2, 3, "y").unwrap();
        assert_eq!(r.read_file("f.txt").unwrap(), "a\ny\nc\n");

        assert!(r.edit_file("f.txt", 0, 1, "z").is_err());
        assert!(r.edit_file("f.txt", 1, 99, "z").is_err());
    }

    #[test]
    fn edit_file_replace_requires_unique_match() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        fs::write(ws.path().join("f.txt"), "one two one").unwrap();
        assert!(r.edit_file_replace("f.txt", "one", "1").is_err());
        assert!(r.edit_file_replace("f.txt", "missing", "1").is_err());
        r.edit_file_replace("f.txt", "two", "2").unwrap();
        assert_eq!(r.read_file("f.txt").unwrap(), "one 2 one");
    }

    #[test]
    fn list_dir_recursive_marks_directories() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        fs::create_dir_all(ws.path().join("a/b")).unwrap();
        fs::write(ws.path().join("a/b/f.txt"), "x").unwrap();
        fs::write(ws.path().join("top.txt"), "x").unwrap();

        let out = r.list_dir(".", true, 0).unwrap();
        let entries: Vec<String> = serde_json::from_str(&out).unwrap();
        assert!(entries.contains(&"a/".to_string()));
        assert!(entries.contains(&"a/b/f.txt".to_string()));
        assert!(entries.contains(&"top.txt".to_string()));
    }

    #[test]
    fn list_dir_stops_at_cap() {
        let ws = tempfile::tempdir().unwrap();
        let r = registry(ws.path(), true);
        for i in 0..10 {
            fs::write(ws.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let out = r.list_dir(".", false, 3).unwrap();
        let entries: Vec<String> = serde_json::from_str(&out).unwrap();
        assert_eq!(entries.len(), 3);
    }
}
