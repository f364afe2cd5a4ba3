//! Heartbeat: periodic self-prompted agent turns.
//!
//! Every interval the service reads `HEARTBEAT.md` from the workspace. If
//! the file is missing or reduces to checklist boilerplate, the cycle is
//! skipped; otherwise a direct agent turn runs with a fixed prompt. A
//! response containing `HEARTBEAT_OK` (case, whitespace and underscores
//! ignored) means nothing needed attention.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md in your workspace and work through its checklist. \
     If nothing needs attention, reply with exactly HEARTBEAT_OK.";

/// Callback running one heartbeat agent turn.
pub type HeartbeatFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub struct Heartbeat {
    workspace: PathBuf,
    enabled: bool,
    interval: Duration,
    on_heartbeat: HeartbeatFn,
}

impl Heartbeat {
    pub fn new(
        workspace: PathBuf,
        enabled: bool,
        interval_sec: u64,
        on_heartbeat: HeartbeatFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            workspace,
            enabled,
            interval: Duration::from_secs(interval_sec.max(60)),
            on_heartbeat,
        })
    }

    /// Start the timer task; no-op when disabled.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        if !self.enabled {
            info!("heartbeat disabled");
            return;
        }
        info!(interval = ?self.interval, "heartbeat started");
        let hb = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(hb.interval);
            // The immediate first tick is skipped; the first real beat
            // happens one interval after startup.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = token.cancelled() => {
                        debug!("heartbeat stopped");
                        return;
                    }
                }
                hb.beat().await;
            }
        });
    }

    async fn beat(&self) {
        let content = fs::read_to_string(self.workspace.join("HEARTBEAT.md")).unwrap_or_default();
        if is_empty(&content) {
            debug!("heartbeat skipped: no actionable checklist");
            return;
        }
        match (self.on_heartbeat)(HEARTBEAT_PROMPT.to_string()).await {
            Ok(reply) if is_heartbeat_ok(&reply) => {
                debug!("heartbeat ok");
            }
            Ok(_) => {
                info!("heartbeat produced activity");
            }
            Err(e) => {
                warn!(error = %e, "heartbeat turn failed");
            }
        }
    }
}

/// Whether a response is the no-op sentinel. Case-insensitive, tolerant
/// of whitespace and underscores anywhere.
pub fn is_heartbeat_ok(response: &str) -> bool {
    let normalized: String = response
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_uppercase();
    normalized.contains("HEARTBEATOK")
}

/// Whether checklist content reduces to boilerplate: blank lines, headings,
/// HTML comments and empty check items.
pub fn is_empty(content: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("<!--") && line.ends_with("-->") {
            continue;
        }
        if line == "- [ ]" || line == "- [x]" || line == "- [X]" {
            continue;
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_ok_detection() {
        let cases = [
            ("HEARTBEAT_OK", true),
            ("heartbeat_ok", true),
            ("Heartbeat OK", true),
            (" HEARTBEAT_OK\n", true),
            ("HEARTBEATOK", true),
            ("ok", false),
            ("", false),
            ("nothing to do: HEARTBEAT_OK", true),
        ];
        for (input, want) in cases {
            assert_eq!(is_heartbeat_ok(input), want, "{input:?}");
        }
    }

    #[test]
    fn empty_detection() {
        let cases = [
            ("", true),
            ("\n\n", true),
            ("# Heartbeat Tasks\n\n- [ ]\n", true),
            ("- [ ]\n", true),
            ("- [x]\n", true),
            ("<!-- comment -->\n", true),
            ("- [ ] do something\n", false),
            ("Check something\n", false),
        ];
        for (input, want) in cases {
            assert_eq!(is_empty(input), want, "{input:?}");
        }
    }

    #[tokio::test]
    async fn beat_skips_without_checklist() {
        let ws = tempfile::tempdir().unwrap();
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let hb = Heartbeat::new(
            ws.path().to_path_buf(),
            true,
            3600,
            Arc::new(move |_| {
                let called = Arc::clone(&called_clone);
                Box::pin(async move {
                    called.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok("HEARTBEAT_OK".to_string())
                })
            }),
        );

        hb.beat().await;
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

        fs::write(ws.path().join("HEARTBEAT.md"), "- [ ] water the plants\n").unwrap();
        hb.beat().await;
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
