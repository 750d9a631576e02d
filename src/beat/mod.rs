//! # Beat scheduler (§4.13)
//!
//! Maintains a [`Schedule`] keyed by entry name and fires each entry's
//! [`TaskSignature`] when its `next_run` comes due. Cron expressions are
//! parsed by the `cron` crate; interval entries just add a fixed
//! `Duration` to `now`. Persistence (`PersistState`) snapshots the whole
//! schedule to a JSON file after every firing and on graceful shutdown.
//!
//! Firing submits through a [`Client`] rather than publishing straight to
//! the broker, so a beat-fired message gets the same `Pending`-state write
//! and task-name routing any other `Client::send` caller gets (§4.13,
//! dataflow note in §2).

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, SendOptions};
use crate::error::BeatError;
use crate::model::{ScheduleEntry, ScheduleKind};

/// Computes the next fire time for a [`ScheduleKind`] after `after`.
pub fn compute_next(kind: &ScheduleKind, after: DateTime<Utc>) -> Result<DateTime<Utc>, BeatError> {
    match kind {
        ScheduleKind::Cron(expr) => {
            let schedule = cron::Schedule::from_str(expr)
                .map_err(|e| BeatError::InvalidCron(expr.clone(), e.to_string()))?;
            schedule
                .after(&after)
                .next()
                .ok_or_else(|| BeatError::InvalidCron(expr.clone(), "cron expression has no future occurrences".to_string()))
        }
        ScheduleKind::Interval(interval) => {
            let delta = chrono::Duration::from_std(*interval).unwrap_or(chrono::Duration::zero());
            Ok(after + delta)
        }
    }
}

/// How a just-loaded entry whose `next_run` is already in the past behaves
/// on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedPolicy {
    /// Fire once immediately to catch up, then resume the normal cadence.
    RunOnce,
    /// Skip the missed occurrence(s) and reschedule forward from now.
    RescheduleForward,
}

#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub tick: Duration,
    /// Uniform random jitter added to each tick, to avoid every beat
    /// process in a fleet waking in lockstep.
    pub jitter: Duration,
    pub persist_state: bool,
    pub state_path: Option<PathBuf>,
    pub missed_policy: MissedPolicy,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            jitter: Duration::ZERO,
            persist_state: false,
            state_path: None,
            missed_policy: MissedPolicy::RescheduleForward,
        }
    }
}

/// The in-memory schedule, keyed by entry name.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: RwLock<HashMap<String, ScheduleEntry>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: ScheduleEntry) {
        self.entries.write().await.insert(entry.name.clone(), entry);
    }

    pub async fn remove(&self, name: &str) -> Option<ScheduleEntry> {
        self.entries.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<ScheduleEntry> {
        self.entries.read().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ScheduleEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    async fn load_snapshot(&self, entries: Vec<ScheduleEntry>) {
        let mut guard = self.entries.write().await;
        guard.clear();
        for entry in entries {
            guard.insert(entry.name.clone(), entry);
        }
    }
}

/// Fires due [`ScheduleEntry`]s through a [`Client`].
pub struct BeatScheduler {
    config: BeatConfig,
    schedule: Arc<Schedule>,
    client: Arc<Client>,
}

impl std::fmt::Debug for BeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatScheduler").field("config", &self.config).field("schedule", &self.schedule).finish()
    }
}

impl BeatScheduler {
    pub fn new(config: BeatConfig, client: Arc<Client>) -> Self {
        Self {
            config,
            schedule: Arc::new(Schedule::new()),
            client,
        }
    }

    pub fn schedule(&self) -> Arc<Schedule> {
        self.schedule.clone()
    }

    /// Loads persisted state from `state_path` (if `persist_state` is set
    /// and the file exists), applying `missed_policy` to any entry whose
    /// `next_run` is already behind `now`.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<(), BeatError> {
        let Some(path) = self.state_path() else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path).map_err(|e| BeatError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut entries: Vec<ScheduleEntry> = serde_json::from_slice(&bytes).map_err(|e| BeatError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        for entry in &mut entries {
            if entry.next_run <= now && self.config.missed_policy == MissedPolicy::RescheduleForward {
                entry.next_run = compute_next(&entry.kind, now)?;
            }
        }
        self.schedule.load_snapshot(entries).await;
        Ok(())
    }

    /// Persists the current schedule to `state_path`, a no-op unless
    /// `persist_state` is set.
    pub async fn persist(&self) -> Result<(), BeatError> {
        let Some(path) = self.state_path() else { return Ok(()) };
        let snapshot = self.schedule.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| BeatError::PersistFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&path, bytes).map_err(|e| BeatError::PersistFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn state_path(&self) -> Option<PathBuf> {
        if self.config.persist_state {
            self.config.state_path.clone()
        } else {
            None
        }
    }

    /// Submits every due entry, advancing `last_run`/`next_run` on each.
    /// Returns the names of entries that fired.
    #[tracing::instrument(name = "beat_tick", skip(self), fields(now = %now, fired_count = tracing::field::Empty))]
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<Vec<String>, BeatError> {
        let due_names: Vec<String> = {
            let entries = self.schedule.entries.read().await;
            entries.values().filter(|e| e.should_run(now)).map(|e| e.name.clone()).collect()
        };

        let mut fired = Vec::with_capacity(due_names.len());
        for name in due_names {
            let mut entries = self.schedule.entries.write().await;
            let Some(entry) = entries.get_mut(&name) else { continue };
            if !entry.should_run(now) {
                continue;
            }
            let task = entry.signature.task.clone();
            let args = entry.signature.args.clone();
            let content_type = entry.signature.content_type.clone();
            let mut options = SendOptions {
                queue: entry.options.queue.clone(),
                priority: entry.options.priority,
                ..Default::default()
            };
            if let Some(expires_in) = entry.options.expires_in {
                options.expires = Some(now + chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::zero()));
            }
            drop(entries);

            self.client
                .send_raw(&task, args, &content_type, options)
                .await
                .map_err(|e| BeatError::Client(Box::new(e)))?;

            let mut entries = self.schedule.entries.write().await;
            if let Some(entry) = entries.get_mut(&name) {
                entry.last_run = Some(now);
                entry.next_run = compute_next(&entry.kind, now)?;
            }
            tracing::info!(entry_name = %name, "beat entry fired");
            fired.push(name);
        }
        tracing::Span::current().record("fired_count", fired.len());
        Ok(fired)
    }

    /// Runs the tick loop until `shutdown` is cancelled, persisting state
    /// (if enabled) after every firing batch and once more on exit.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BeatError> {
        loop {
            let jittered = if self.config.jitter.is_zero() {
                self.config.tick
            } else {
                self.config.tick + Duration::from_secs_f64(fastrand::f64() * self.config.jitter.as_secs_f64())
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered) => {}
            }
            let fired = self.tick_once(Utc::now()).await?;
            if !fired.is_empty() && self.config.persist_state {
                self.persist().await?;
            }
        }
        if self.config.persist_state {
            self.persist().await?;
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<(), BeatError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
