//! Shell execution tool and its safety guard.
//!
//! The guard runs before anything is spawned: structural constructs that
//! defeat inspection (substitution, chaining, redirection, tee) are always
//! rejected, dangerous commands match a deny list, and any absolute path in
//! the command line is checked against the sensitive-path policy and, when
//! restriction is on, the workspace bound. A blocked command is reported
//! as tool output so the model can adjust, not as an execution failure.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::fs_ops::{ensure_path_allowed_by_policy, expand_home_path};
use crate::tools::ToolRegistry;

const MAX_STREAM_BYTES: usize = 64 << 10;

/// Environment variables forwarded into the child process; everything else
/// is dropped.
const SAFE_EXEC_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "TERM", "LANG", "LC_ALL", "LC_CTYPE", "USER", "SHELL", "TMPDIR",
];

static EXEC_DENY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\brm\s+-[a-z]*r[a-z]*f?[a-z]*\b",   // rm -r, rm -rf, rm -fr
        r"\bdel\s+/[fq]\b",                   // del /f, del /q
        r"\brmdir\s+/s\b",                    // rmdir /s
        r"\b(format|mkfs|diskpart)\b",        // disk operations
        r"\bdd\s+if=",                        // dd
        r">\s*/dev/sd",                       // write to disk
        r"\b(shutdown|reboot|poweroff)\b",    // system power
        r":\(\)\s*\{.*\};\s*:",               // fork bomb
    ]
    .iter()
    .map(|p| Regex::new(p).expect("exec deny pattern"))
    .collect()
});

static RE_HOME_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)~(/|\s|$)").expect("home token pattern"));
static RE_POSIX_ABS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s"'(=,:><])(/[^ \t\r\n"'`]*)"#).expect("posix abs pattern")
});
static RE_HOME_ABS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"~/[^ \t\r\n"'`]+"#).expect("home abs pattern"));
static RE_WIN_ABS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[A-Za-z]:\\[^\\"'\s]+"#).expect("win abs pattern"));

fn contains_single_ampersand(s: &str) -> bool {
    let b = s.as_bytes();
    for (i, &c) in b.iter().enumerate() {
        if c != b'&' {
            continue;
        }
        let prev = i > 0 && b[i - 1] == b'&';
        let next = i + 1 < b.len() && b[i + 1] == b'&';
        if !prev && !next {
            return true;
        }
    }
    false
}

fn has_token(command: &str, token: &str) -> bool {
    command
        .split_whitespace()
        .any(|field| field == token || field.ends_with(&format!("/{token}")))
}

/// Pre-check a command. Returns `Some(message)` when the command must not
/// run; the message becomes the tool output.
pub fn guard_exec_command(command: &str, workspace_dir: &std::path::Path, restrict: bool) -> Option<String> {
    let cmd = command.trim();
    if cmd.is_empty() {
        return None;
    }
    let lower = cmd.to_lowercase();

    if cmd.contains('`')
        || cmd.contains("$(")
        || cmd.contains("${")
        || cmd.contains("<(")
        || cmd.contains(">(")
    {
        return Some(
            "Error: Command blocked by safety guard (unsafe shell expansion detected)".into(),
        );
    }
    if cmd.contains(';') || cmd.contains('\n') {
        return Some("Error: Command blocked by safety guard (command chaining detected)".into());
    }
    if cmd.contains('>') {
        return Some("Error: Command blocked by safety guard (redirection is not allowed)".into());
    }
    if contains_single_ampersand(cmd) {
        return Some(
            "Error: Command blocked by safety guard (background chaining detected)".into(),
        );
    }
    if has_token(cmd, "tee") {
        return Some("Error: Command blocked by safety guard (tee is not allowed)".into());
    }
    for re in EXEC_DENY_PATTERNS.iter() {
        if re.is_match(&lower) {
            return Some(
                "Error: Command blocked by safety guard (dangerous pattern detected)".into(),
            );
        }
    }

    let ws_abs = if restrict {
        if cmd.contains("../") || cmd.contains(r"..\") {
            return Some(
                "Error: Command blocked by safety guard (path traversal detected)".into(),
            );
        }
        if RE_HOME_TOKEN.is_match(cmd) {
            return Some("Error: Command blocked by safety guard (path outside workspace)".into());
        }
        Some(
            std::path::absolute(workspace_dir)
                .unwrap_or_else(|_| workspace_dir.to_path_buf()),
        )
    } else {
        None
    };

    let mut raw_paths: Vec<String> = Vec::new();
    for m in RE_WIN_ABS.find_iter(cmd) {
        raw_paths.push(m.as_str().to_string());
    }
    for caps in RE_POSIX_ABS.captures_iter(cmd) {
        if let Some(m) = caps.get(2) {
            raw_paths.push(m.as_str().to_string());
        }
    }
    for m in RE_HOME_ABS.find_iter(cmd) {
        raw_paths.push(m.as_str().to_string());
    }

    for raw in raw_paths {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let path = expand_home_path(raw);
        if ensure_path_allowed_by_policy(&path).is_err() {
            return Some(
                "Error: Command blocked by safety guard (sensitive path is not allowed)".into(),
            );
        }
        let Some(ws) = &ws_abs else { continue };
        if path == *ws || path.starts_with(ws) {
            continue;
        }
        return Some("Error: Command blocked by safety guard (path outside workspace)".into());
    }

    None
}

impl ToolRegistry {
    pub(crate) async fn exec(&self, command: &str) -> Result<String, ToolError> {
        if command.trim().is_empty() {
            return Err(ToolError::InvalidParameters("command is empty".into()));
        }
        if let Some(msg) =
            guard_exec_command(command, &self.workspace_dir, self.restrict_to_workspace)
        {
            return Ok(msg);
        }
        let timeout = if self.exec_timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            self.exec_timeout
        };

        // Login shell for PATH parity with the user's environment.
        let mut cmd = Command::new("sh");
        cmd.arg("-lc")
            .arg(command)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for key in SAFE_EXEC_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!("spawn: {e}")));
            }
            Err(_) => {
                return Ok(format!("exit=-1\nerror: timeout after {}s", timeout.as_secs()));
            }
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout), MAX_STREAM_BYTES);
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr), MAX_STREAM_BYTES);
        let exit = output.status.code().unwrap_or(-1);

        let mut res = format!("exit={exit}\n");
        if !stdout.is_empty() {
            res.push_str("stdout:\n");
            res.push_str(&stdout);
            res.push('\n');
        }
        if !stderr.is_empty() {
            res.push_str("stderr:\n");
            res.push_str(&stderr);
            res.push('\n');
        }
        // Output is returned even on non-zero exit; the model decides the
        // next step.
        Ok(res.trim_end_matches('\n').to_string())
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
    format!("{}\n(truncated)", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ws() -> &'static Path {
        Path::new("/tmp/ws")
    }

    #[test]
    fn deny_patterns_block() {
        for cmd in [
            "rm -rf /",
            "rm -r ./foo",
            "shutdown now",
            "dd if=/dev/zero of=/dev/null",
            "mkfs.ext4 /dev/sda1",
        ] {
            assert!(guard_exec_command(cmd, ws(), true).is_some(), "{cmd}");
        }
    }

    #[test]
    fn structural_constructs_block_even_unrestricted() {
        for cmd in [
            "echo $(whoami)",
            "echo `whoami`",
            "echo ${HOME}",
            "echo hi > out.txt",
            "echo hi; whoami",
            "echo hi & whoami",
            "echo hi | tee out.txt",
            "cat <(ls)",
        ] {
            assert!(guard_exec_command(cmd, ws(), false).is_some(), "{cmd}");
        }
        // && chains are not the single-& background case.
        assert!(guard_exec_command("true && false", ws(), false).is_none());
    }

    #[test]
    fn restricted_blocks_paths_outside_workspace() {
        assert!(guard_exec_command("cat /etc/hosts", ws(), true).is_some());
        assert!(guard_exec_command("cat ../secrets.txt", ws(), true).is_some());
        assert!(guard_exec_command("cat ~/notes.txt", ws(), true).is_some());
        assert!(guard_exec_command("cat ./hello.txt", ws(), true).is_none());
        assert!(guard_exec_command("cargo test --workspace", ws(), true).is_none());
        assert!(guard_exec_command("cat /tmp/ws/notes.txt", ws(), true).is_none());
    }

    #[test]
    fn unrestricted_allows_absolute_paths() {
        assert!(guard_exec_command("cat /etc/hosts", ws(), false).is_none());
    }

    #[test]
    fn sensitive_paths_block_even_unrestricted() {
        if let Ok(cfg) = crate::paths::config_dir() {
            let cmd = format!("cat {}", cfg.join("auth/token.json").display());
            assert!(guard_exec_command(&cmd, ws(), false).is_some());
        }
    }

    #[tokio::test]
    async fn exec_runs_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let r = ToolRegistry::new(dir.path().to_path_buf(), false);
        let out = r.exec("echo hello").await.unwrap();
        assert!(out.starts_with("exit=0"));
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn exec_env_is_pruned() {
        // A secret in the parent env must not leak into the child.
        std::env::set_var("CLAWGATE_EXEC_TEST_SECRET", "super-secret");
        let dir = tempfile::tempdir().unwrap();
        let r = ToolRegistry::new(dir.path().to_path_buf(), false);
        let out = r.exec("env").await.unwrap();
        assert!(!out.contains("CLAWGATE_EXEC_TEST_SECRET=super-secret"));
        assert!(out.contains("PATH="));
        std::env::remove_var("CLAWGATE_EXEC_TEST_SECRET");
    }

    #[tokio::test]
    async fn exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = ToolRegistry::new(dir.path().to_path_buf(), false);
        r.exec_timeout = Duration::from_millis(100);
        let out = r.exec("sleep 5").await.unwrap();
        assert!(out.contains("timeout"));
    }

    #[tokio::test]
    async fn blocked_command_is_tool_output_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = ToolRegistry::new(dir.path().to_path_buf(), true);
        let out = r.exec("rm -rf /").await.unwrap();
        assert!(out.starts_with("Error: Command blocked"));
    }
}
