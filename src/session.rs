//! Per-conversation session log persisted as append-mostly JSONL.
//!
//! Each session lives in one file: a metadata line (`"_type":"metadata"`)
//! followed by message lines. Saves normally append a fresh metadata line
//! plus the not-yet-persisted messages; once enough appends, metadata lines
//! or bytes accumulate (or a truncating mutation happened) the file is
//! compacted to exactly one metadata line plus all messages via an atomic
//! temp-file rename.
//!
//! Consolidation uses optimistic concurrency: `snapshot_for_consolidation`
//! captures the old messages plus the session version, the (slow) summary
//! runs off-lock, and `apply_consolidation` commits only if the version is
//! unchanged.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SessionError;

/// Speaker of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: Value,
}

/// One message in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    /// Names of tools invoked during this turn, deduplicated and trimmed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    /// Present on assistant turns that requested tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on tool-role replies, referencing the call they answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_rfc3339(),
            tools_used: Vec::new(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Deduplicate, trim and drop empty tool names, preserving first-seen order.
fn normalize_tool_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for raw in names {
        let name = raw.trim();
        if name.is_empty() || out.iter().any(|n| n == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    kind: String,
    created_at: String,
    updated_at: String,
    metadata: serde_json::Map<String, Value>,
}

#[derive(Debug)]
struct SessionInner {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    metadata: serde_json::Map<String, Value>,
    /// Strictly increases on every append, truncate or metadata change.
    version: u64,
    /// How many leading messages are already on disk.
    persisted_messages: usize,
    /// Appending saves since the last compaction.
    append_saves: u32,
    /// Metadata lines currently in the on-disk file.
    metadata_line_count: u32,
    /// Set by truncating mutations; forces the next save to compact.
    needs_compaction: bool,
}

/// A single conversation: key, ordered messages, metadata, version counter.
///
/// All mutation goes through the internal lock; handles are shared as
/// `Arc<Session>`.
pub struct Session {
    key: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            inner: Mutex::new(SessionInner {
                created_at: now,
                updated_at: now,
                messages: Vec::new(),
                metadata: serde_json::Map::new(),
                version: 0,
                persisted_messages: 0,
                append_saves: 0,
                metadata_line_count: 0,
                needs_compaction: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a plain message.
    pub fn add(&self, role: Role, content: impl Into<String>) {
        self.push(Message::new(role, content));
    }

    /// Append a message annotated with the tools used during the turn.
    pub fn add_with_tools(&self, role: Role, content: impl Into<String>, tools: &[String]) {
        let mut msg = Message::new(role, content);
        msg.tools_used = normalize_tool_names(tools);
        self.push(msg);
    }

    /// Append an assistant turn carrying tool calls.
    pub fn add_assistant_with_calls(
        &self,
        content: impl Into<String>,
        calls: Vec<ToolCall>,
        tools: &[String],
    ) {
        let mut msg = Message::new(Role::Assistant, content);
        msg.tools_used = normalize_tool_names(tools);
        msg.tool_calls = Some(calls);
        self.push(msg);
    }

    /// Append a tool-role reply referencing the call it answers.
    pub fn add_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) {
        let mut msg = Message::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(name.into());
        self.push(msg);
    }

    fn push(&self, msg: Message) {
        let mut inner = self.lock();
        inner.messages.push(msg);
        inner.updated_at = Utc::now();
        inner.version += 1;
    }

    /// Bounded tail copy of the message log. `max == 0` means all.
    pub fn history(&self, max: usize) -> Vec<Message> {
        let inner = self.lock();
        let msgs = &inner.messages;
        let start = if max > 0 && msgs.len() > max {
            msgs.len() - max
        } else {
            0
        };
        msgs[start..].to_vec()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Drop all messages, keeping key and metadata. The truncation is
    /// realized on disk by the compaction the next save performs.
    pub fn clear_messages(&self) {
        let mut inner = self.lock();
        inner.messages.clear();
        inner.updated_at = Utc::now();
        inner.version += 1;
        inner.needs_compaction = true;
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.lock();
        inner.metadata.insert(key.into(), value);
        inner.updated_at = Utc::now();
        inner.version += 1;
    }

    pub fn metadata(&self) -> serde_json::Map<String, Value> {
        self.lock().metadata.clone()
    }

    pub fn needs_consolidation(&self, window: usize) -> bool {
        let window = if window == 0 { 50 } else { window };
        self.lock().messages.len() > window
    }

    /// Capture the messages to summarize plus the version to CAS against.
    ///
    /// Returns `(old_messages, keep, version)`, or `None` when the session
    /// is not over the window. `keep = min(10, max(2, window / 2))`.
    pub fn snapshot_for_consolidation(&self, window: usize) -> Option<(Vec<Message>, usize, u64)> {
        let window = if window == 0 { 50 } else { window };
        let inner = self.lock();
        let n = inner.messages.len();
        if n <= window {
            return None;
        }
        let keep = (window / 2).clamp(2, 10);
        if n <= keep {
            return None;
        }
        let old = inner.messages[..n - keep].to_vec();
        Some((old, keep, inner.version))
    }

    /// Commit a consolidation: replace messages with the last `keep` iff the
    /// version still matches the snapshot. Stale versions are a no-op.
    pub fn apply_consolidation(&self, version: u64, keep: usize) -> bool {
        let mut inner = self.lock();
        if inner.version != version {
            return false;
        }
        let n = inner.messages.len();
        if keep < n {
            inner.messages = inner.messages[n - keep..].to_vec();
        }
        inner.updated_at = Utc::now();
        inner.version += 1;
        inner.needs_compaction = true;
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Knobs deciding when an appending save turns into a compaction.
#[derive(Debug, Clone, Copy)]
pub struct SaveLimits {
    /// Compact after this many appending saves.
    pub every_n: u32,
    /// Compact once the on-disk file reaches this size.
    pub max_bytes: u64,
    /// Compact once this many metadata lines accumulate.
    pub max_meta: u32,
}

impl Default for SaveLimits {
    fn default() -> Self {
        Self {
            every_n: 100,
            max_bytes: 4 << 20,
            max_meta: 200,
        }
    }
}

/// Store of sessions keyed by arbitrary strings, cached in memory and
/// persisted one JSONL file per session.
pub struct SessionStore {
    dir: PathBuf,
    limits: SaveLimits,
    cache: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_limits(dir, SaveLimits::default())
    }

    pub fn with_limits(dir: impl Into<PathBuf>, limits: SaveLimits) -> Self {
        Self {
            dir: dir.into(),
            limits,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a session, loading it from disk on first use.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(sess) = self.cached(key) {
            return Ok(sess);
        }
        let sess = Arc::new(match self.load(key)? {
            Some(sess) => sess,
            None => Session::new(key),
        });
        let mut cache = self.lock_cache();
        // Another task may have raced us here; first insert wins.
        Ok(Arc::clone(
            cache.entry(key.to_string()).or_insert(sess),
        ))
    }

    fn cached(&self, key: &str) -> Option<Arc<Session>> {
        self.lock_cache().get(key).cloned()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", safe_filename(&key.replace(':', "_"))))
    }

    /// Load a session from disk. Unparseable lines are skipped; the last
    /// metadata line wins for timestamps and metadata.
    fn load(&self, key: &str) -> Result<Option<Session>, SessionError> {
        let path = self.session_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };

        let mut created_at = None;
        let mut updated_at = None;
        let mut metadata = serde_json::Map::new();
        let mut messages = Vec::new();
        let mut metadata_lines = 0u32;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if value.get("_type").and_then(Value::as_str) == Some("metadata") {
                metadata_lines += 1;
                if let Ok(ml) = serde_json::from_value::<MetadataLine>(value) {
                    if let Ok(t) = DateTime::parse_from_rfc3339(&ml.created_at) {
                        created_at = Some(t.with_timezone(&Utc));
                    }
                    if let Ok(t) = DateTime::parse_from_rfc3339(&ml.updated_at) {
                        updated_at = Some(t.with_timezone(&Utc));
                    }
                    metadata = ml.metadata;
                }
                continue;
            }
            if let Ok(msg) = serde_json::from_value::<Message>(value) {
                messages.push(msg);
            }
        }

        let now = Utc::now();
        let persisted = messages.len();
        let sess = Session {
            key: key.to_string(),
            inner: Mutex::new(SessionInner {
                created_at: created_at.unwrap_or(now),
                updated_at: updated_at.unwrap_or(now),
                messages,
                metadata,
                version: 0,
                persisted_messages: persisted,
                append_saves: 0,
                metadata_line_count: metadata_lines,
                needs_compaction: false,
            }),
        };
        Ok(Some(sess))
    }

    /// Persist a session, appending when possible and compacting when the
    /// policy demands it.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700));
        }

        let path = self.session_path(session.key());
        let mut inner = session.lock();

        let disk_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let compact = inner.needs_compaction
            || inner.append_saves >= self.limits.every_n
            || inner.metadata_line_count >= self.limits.max_meta
            || disk_size >= self.limits.max_bytes
            || inner.persisted_messages > inner.messages.len();

        if compact {
            self.write_compact(&path, &inner)?;
            inner.append_saves = 0;
            inner.metadata_line_count = 1;
            inner.persisted_messages = inner.messages.len();
            inner.needs_compaction = false;
        } else {
            self.write_append(&path, &inner)?;
            inner.append_saves += 1;
            inner.metadata_line_count += 1;
            inner.persisted_messages = inner.messages.len();
        }
        Ok(())
    }

    fn write_compact(&self, path: &Path, inner: &SessionInner) -> Result<(), SessionError> {
        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = Vec::new();
        append_metadata_line(&mut buf, inner)?;
        for msg in &inner.messages {
            serde_json::to_writer(&mut buf, msg)?;
            buf.push(b'\n');
        }
        write_owner_only(&tmp, &buf).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }

    fn write_append(&self, path: &Path, inner: &SessionInner) -> Result<(), SessionError> {
        let mut buf = Vec::new();
        append_metadata_line(&mut buf, inner)?;
        for msg in &inner.messages[inner.persisted_messages..] {
            serde_json::to_writer(&mut buf, msg)?;
            buf.push(b'\n');
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts.open(path).map_err(|e| io_err(path, e))?;
        f.write_all(&buf).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

fn append_metadata_line(buf: &mut Vec<u8>, inner: &SessionInner) -> Result<(), SessionError> {
    let meta = MetadataLine {
        kind: "metadata".into(),
        created_at: inner
            .created_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        updated_at: inner
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        metadata: inner.metadata.clone(),
    };
    serde_json::to_writer(&mut *buf, &meta)?;
    buf.push(b'\n');
    Ok(())
}

fn write_owner_only(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(buf)
}

fn io_err(path: &Path, source: std::io::Error) -> SessionError {
    warn!(path = %path.display(), error = %source, "session io error");
    SessionError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Map a session key to a filesystem-safe base name.
pub fn safe_filename(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    let replaced: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stripped = replaced.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if stripped.is_empty() {
        "default".to_string()
    } else {
        stripped.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, every_n: u32, max_bytes: u64, max_meta: u32) -> SessionStore {
        SessionStore::with_limits(
            dir,
            SaveLimits {
                every_n,
                max_bytes,
                max_meta,
            },
        )
    }

    fn count_metadata_lines(path: &Path) -> usize {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| l.contains(r#""_type":"metadata""#))
            .count()
    }

    #[test]
    fn safe_filename_mapping() {
        assert_eq!(safe_filename("telegram_12345"), "telegram_12345");
        assert_eq!(safe_filename("a/b c"), "a_b_c");
        assert_eq!(safe_filename(""), "default");
        assert_eq!(safe_filename("..."), "default");
        assert_eq!(safe_filename("._-x-_."), "x");
    }

    #[test]
    fn append_preserves_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1000, 1 << 30, 1000);
        let sess = store.get_or_create("cli:test").unwrap();
        sess.add(Role::User, "u1");
        sess.add_with_tools(Role::Assistant, "a1", &["read_file".into()]);
        store.save(&sess).unwrap();
        sess.add(Role::User, "u2");
        sess.add_with_tools(Role::Assistant, "a2", &["exec".into()]);
        store.save(&sess).unwrap();

        let fresh = store.load("cli:test").unwrap().unwrap();
        let msgs = fresh.history(0);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].tools_used, vec!["read_file"]);
        assert_eq!(msgs[3].tools_used, vec!["exec"]);
    }

    #[test]
    fn compacts_after_append_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1, 1 << 30, 1000);
        let sess = store.get_or_create("cli:test").unwrap();
        sess.add(Role::User, "u1");
        store.save(&sess).unwrap();
        sess.add(Role::Assistant, "a1");
        store.save(&sess).unwrap();

        let path = store.session_path("cli:test");
        assert_eq!(count_metadata_lines(&path), 1);
        let fresh = store.load("cli:test").unwrap().unwrap();
        let msgs = fresh.history(0);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
    }

    #[test]
    fn compacts_after_consolidation_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1000, 1 << 30, 1000);
        let sess = store.get_or_create("cli:test").unwrap();
        for _ in 0..16 {
            sess.add(Role::User, "q");
        }
        store.save(&sess).unwrap();

        let (old, keep, ver) = sess.snapshot_for_consolidation(4).unwrap();
        assert_eq!(keep, 2);
        assert_eq!(old.len(), 14);
        assert!(sess.apply_consolidation(ver, keep));
        store.save(&sess).unwrap();

        let path = store.session_path("cli:test");
        assert_eq!(count_metadata_lines(&path), 1);
        let fresh = store.load("cli:test").unwrap().unwrap();
        assert_eq!(fresh.history(0).len(), 2);
    }

    #[test]
    fn apply_consolidation_is_version_checked() {
        let sess = Session::new("cli:test");
        for _ in 0..12 {
            sess.add(Role::User, "m");
        }
        let (_, keep, ver) = sess.snapshot_for_consolidation(4).unwrap();
        // Session advances between snapshot and commit.
        sess.add(Role::Assistant, "late");
        assert!(!sess.apply_consolidation(ver, keep));
        assert_eq!(sess.message_count(), 13);

        let (_, keep, ver) = sess.snapshot_for_consolidation(4).unwrap();
        assert!(sess.apply_consolidation(ver, keep));
        assert_eq!(sess.message_count(), keep);
        // The kept messages are the tail of the pre-call session.
        let msgs = sess.history(0);
        assert_eq!(msgs.last().unwrap().content, "late");
    }

    #[test]
    fn snapshot_none_under_window() {
        let sess = Session::new("cli:test");
        for _ in 0..12 {
            sess.add(Role::User, "m");
        }
        assert!(sess.snapshot_for_consolidation(20).is_none());
        assert!(!sess.needs_consolidation(20));
        assert!(sess.needs_consolidation(5));
    }

    #[test]
    fn clear_messages_truncates_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1000, 1 << 30, 1000);
        let sess = store.get_or_create("cli:test").unwrap();
        sess.add(Role::User, "hello");
        sess.set_metadata("lang", serde_json::json!("en"));
        store.save(&sess).unwrap();

        sess.clear_messages();
        store.save(&sess).unwrap();

        let fresh = store.load("cli:test").unwrap().unwrap();
        assert_eq!(fresh.history(0).len(), 0);
        // Metadata survives /new.
        assert_eq!(fresh.metadata().get("lang"), Some(&serde_json::json!("en")));
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1000, 1 << 30, 1000);
        let sess = store.get_or_create("cli:test").unwrap();
        sess.add(Role::User, "ok");
        store.save(&sess).unwrap();

        let path = store.session_path("cli:test");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n");
        fs::write(&path, raw).unwrap();

        let fresh = store.load("cli:test").unwrap().unwrap();
        assert_eq!(fresh.history(0).len(), 1);
    }

    #[test]
    fn history_is_bounded_tail() {
        let sess = Session::new("cli:test");
        for i in 0..10 {
            sess.add(Role::User, format!("m{i}"));
        }
        let tail = sess.history(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "m7");
        assert_eq!(sess.history(0).len(), 10);
    }

    #[test]
    fn tool_names_are_normalized() {
        let sess = Session::new("cli:test");
        sess.add_with_tools(
            Role::Assistant,
            "a",
            &[
                " exec ".into(),
                "exec".into(),
                "".into(),
                "read_file".into(),
            ],
        );
        let msgs = sess.history(0);
        assert_eq!(msgs[0].tools_used, vec!["exec", "read_file"]);
    }

    #[test]
    fn save_load_roundtrip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1000, 1 << 30, 1000);
        let sess = store.get_or_create("roundtrip").unwrap();
        sess.add(Role::User, "one");
        sess.add_assistant_with_calls(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "exec".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
            &["exec".into()],
        );
        sess.add_tool_result("call_1", "exec", "exit=0");
        store.save(&sess).unwrap();

        let first = store.load("roundtrip").unwrap().unwrap();
        let store2 = store_from(&store, dir.path());
        store2.save(&first).unwrap();
        let second = store2.load("roundtrip").unwrap().unwrap();

        let a = first.history(0);
        let b = second.history(0);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.role, y.role);
            assert_eq!(x.content, y.content);
            assert_eq!(x.tool_call_id, y.tool_call_id);
        }
    }

    fn store_from(orig: &SessionStore, dir: &Path) -> SessionStore {
        SessionStore::with_limits(dir, orig.limits)
    }
}
