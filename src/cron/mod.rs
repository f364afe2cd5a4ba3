//! Persistent cron service.
//!
//! Jobs live in a JSON document (`{ "jobs": [...] }`) and are evaluated by a
//! 1-second tick loop. Three schedule kinds: `every` (fixed interval),
//! `cron` (5-field expression) and `at` (absolute one-shot, disabled after
//! firing). Runs of the same job never overlap; distinct jobs run
//! concurrently. Trigger failures increment the failure count but the
//! schedule still advances.

mod expr;

pub use expr::CronExpr;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CronError;

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    /// "every", "cron" or "at".
    pub kind: String,
    #[serde(rename = "everyMS")]
    pub every_ms: i64,
    pub expr: String,
    #[serde(rename = "atMS")]
    pub at_ms: i64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            kind: String::new(),
            every_ms: 0,
            expr: String::new(),
            at_ms: 0,
        }
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    /// Currently always "agent_turn".
    pub kind: String,
    pub message: String,
    /// Deliver the result to `channel`/`to` instead of running silently.
    pub deliver: bool,
    pub channel: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobState {
    #[serde(rename = "nextRunAtMS")]
    pub next_run_at_ms: i64,
    #[serde(rename = "lastRunAtMS")]
    pub last_run_at_ms: i64,
    pub run_count: u64,
    pub failure_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    pub state: JobState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    jobs: Vec<Job>,
}

/// Callback invoked when a job fires.
pub type TriggerFn =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub struct CronService {
    path: PathBuf,
    jobs: Mutex<Vec<Job>>,
    trigger: Option<TriggerFn>,
    /// Per-job run locks; a held lock means a run is in flight.
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl CronService {
    /// Load the service from its store file. One-shot `at` jobs whose time
    /// already passed are disabled on load.
    pub fn new(path: impl Into<PathBuf>, trigger: Option<TriggerFn>) -> Self {
        let path = path.into();
        let mut jobs = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<StoreDoc>(&raw)
                .map(|doc| doc.jobs)
                .unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "cron store unreadable, starting empty");
                    Vec::new()
                }),
            Err(_) => Vec::new(),
        };
        let now = now_ms();
        for job in &mut jobs {
            if job.enabled && job.schedule.kind == "at" && job.schedule.at_ms < now {
                info!(id = %job.id, name = %job.name, "disabling stale one-shot job");
                job.enabled = false;
            }
        }
        Self {
            path,
            jobs: Mutex::new(jobs),
            trigger,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and insert a new job, computing its first fire time.
    pub fn add(&self, name: &str, schedule: Schedule, payload: Payload) -> Result<Job, CronError> {
        let now = now_ms();
        let next = first_run_at(&schedule, now)?;
        let channel_empty = payload.channel.trim().is_empty();
        let to_empty = payload.to.trim().is_empty();
        if channel_empty != to_empty {
            return Err(CronError::InvalidPayload(
                "channel and to must both be set or both be empty".into(),
            ));
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            enabled: true,
            schedule,
            payload,
            state: JobState {
                next_run_at_ms: next,
                ..Default::default()
            },
        };
        let mut jobs = self.lock_jobs();
        jobs.push(job.clone());
        self.persist(&jobs)?;
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Result<bool, CronError> {
        let mut jobs = self.lock_jobs();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    pub fn toggle(&self, id: &str, disable: bool) -> Result<bool, CronError> {
        let mut jobs = self.lock_jobs();
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        job.enabled = !disable;
        if job.enabled {
            // Recompute so a re-enabled job doesn't fire on stale state.
            if let Ok(next) = first_run_at(&job.schedule, now_ms()) {
                job.state.next_run_at_ms = next;
            }
        }
        self.persist(&jobs)?;
        Ok(true)
    }

    pub fn list(&self, include_disabled: bool) -> Vec<Job> {
        self.lock_jobs()
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock_jobs().iter().find(|j| j.id == id).cloned()
    }

    /// Run a job immediately. Without `force` the job must be due.
    pub async fn run_now(&self, id: &str, force: bool) -> Result<bool, CronError> {
        let Some(job) = self.get(id) else {
            return Err(CronError::NotFound(id.to_string()));
        };
        if !force && (!job.enabled || job.state.next_run_at_ms > now_ms()) {
            return Ok(false);
        }
        self.run_job(job).await;
        Ok(true)
    }

    /// Start the tick loop. Returns immediately; the loop stops when the
    /// token fires.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = token.cancelled() => {
                        debug!("cron tick loop stopped");
                        return;
                    }
                }
                let now = now_ms();
                let due: Vec<Job> = svc
                    .lock_jobs()
                    .iter()
                    .filter(|j| j.enabled && j.state.next_run_at_ms > 0 && j.state.next_run_at_ms <= now)
                    .cloned()
                    .collect();
                for job in due {
                    let svc = Arc::clone(&svc);
                    tokio::spawn(async move {
                        // Spread concurrent fires a little.
                        let jitter = rand::thread_rng().gen_range(0..250);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                        svc.run_job(job).await;
                    });
                }
            }
        });
    }

    /// Execute one job run: trigger, record the outcome, advance the
    /// schedule. Guarded so runs of the same job never overlap.
    async fn run_job(&self, job: Job) {
        let lock = self.run_lock(&job.id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(id = %job.id, "previous run still in flight, skipping");
            return;
        };

        let started = now_ms();
        let result = match &self.trigger {
            Some(trigger) => trigger(job.clone()).await,
            None => Ok(String::new()),
        };
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(id = %job.id, name = %job.name, error = %e, "cron trigger failed");
        }

        let mut jobs = self.lock_jobs();
        if let Some(stored) = jobs.iter_mut().find(|j| j.id == job.id) {
            stored.state.last_run_at_ms = started;
            stored.state.run_count += 1;
            if failed {
                stored.state.failure_count += 1;
            }
            advance_schedule(stored, started);
        }
        if let Err(e) = self.persist(&jobs) {
            warn!(error = %e, "persist cron store after run");
        }
    }

    fn run_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.run_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<Job>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, jobs: &[Job]) -> Result<(), CronError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let doc = StoreDoc {
            jobs: jobs.to_vec(),
        };
        let raw = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> CronError {
    CronError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// First fire time for a fresh (or re-enabled) schedule. Errors double as
/// add-time validation.
fn first_run_at(schedule: &Schedule, now: i64) -> Result<i64, CronError> {
    match schedule.kind.as_str() {
        "every" => {
            if schedule.every_ms <= 0 {
                return Err(CronError::InvalidSchedule("everyMS must be positive".into()));
            }
            Ok(now + schedule.every_ms)
        }
        "cron" => {
            let expr = CronExpr::parse(&schedule.expr).map_err(CronError::InvalidSchedule)?;
            expr.next_after_ms(now)
                .ok_or_else(|| CronError::InvalidSchedule("expression never fires".into()))
        }
        "at" => {
            if schedule.at_ms <= now {
                return Err(CronError::InvalidSchedule("atMS must be in the future".into()));
            }
            Ok(schedule.at_ms)
        }
        other => Err(CronError::InvalidSchedule(format!(
            "unknown schedule kind: {other:?}"
        ))),
    }
}

/// Advance a job's next-run after a completed run.
fn advance_schedule(job: &mut Job, ran_at: i64) {
    match job.schedule.kind.as_str() {
        "every" => {
            job.state.next_run_at_ms = now_ms() + job.schedule.every_ms;
        }
        "cron" => {
            if let Ok(expr) = CronExpr::parse(&job.schedule.expr) {
                job.state.next_run_at_ms = expr.next_after_ms(ran_at.max(now_ms())).unwrap_or(0);
            }
        }
        "at" => {
            // One-shot: fired once, never again.
            job.enabled = false;
        }
        _ => {}
    }
}
