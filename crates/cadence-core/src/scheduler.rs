//! Drift-corrected driver for the agent pipeline.
//!
//! Cycles start at absolute ticks `start + n * interval`. Each agent runs
//! under a watchdog and a panic guard, so one misbehaving agent never takes
//! the rest of the cycle down with it. After every cycle the summary is
//! written to the store and the store is flushed to a backup.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::agent::PipelineStage;
use crate::clock::Clock;
use crate::context::{paths, BackupStore, ContextStore};
use crate::error::{ContextError, SchedulerError};

pub const NAME: &str = "scheduler";

const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Summary of one pipeline pass, stored at `scheduler.last_cycle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub agent_results: Vec<AgentResult>,
}

impl CycleRecord {
    pub fn is_clean(&self) -> bool {
        self.agent_results.iter().all(|r| r.status == AgentStatus::Ok)
    }
}

/// Published at `scheduler.state` after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub cycle_id: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub runs_completed: u64,
}

/// Returned by [`SchedulerAgent::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub cycles_completed: u64,
    pub skipped_ticks: u64,
    pub first_cycle_id: Option<u64>,
    pub last_cycle_id: Option<u64>,
    /// True when the run ended because of [`SchedulerHandle::stop`].
    pub stopped: bool,
}

#[derive(Default)]
struct Status {
    current_cycle_id: Option<u64>,
    next_run_at: Option<DateTime<Utc>>,
    last_cycle: Option<CycleRecord>,
}

struct Shared {
    stop: watch::Sender<bool>,
    status: Mutex<Status>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Cloneable control surface for a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Ask the scheduler to stop. The agent currently running finishes (or
    /// times out); the rest of the cycle is skipped. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.shared.stop.send_replace(true) {
            info!("Scheduler stop requested");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// The cycle in progress, or the most recent one.
    pub fn current_cycle_id(&self) -> Option<u64> {
        self.shared.status().current_cycle_id
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.shared.status().next_run_at
    }

    pub fn last_cycle_summary(&self) -> Option<CycleRecord> {
        self.shared.status().last_cycle.clone()
    }
}

/// Runs the pipeline stages in order on a fixed schedule.
pub struct SchedulerAgent {
    stages: Vec<Box<dyn PipelineStage>>,
    store: Arc<ContextStore>,
    clock: Arc<dyn Clock>,
    backups: Option<BackupStore>,
    agent_timeout: Duration,
    history_limit: usize,
    runs_completed: u64,
    shared: Arc<Shared>,
}

impl SchedulerAgent {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>, store: Arc<ContextStore>, clock: Arc<dyn Clock>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stages,
            store,
            clock,
            backups: None,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            runs_completed: 0,
            shared: Arc::new(Shared {
                stop,
                status: Mutex::new(Status::default()),
            }),
        }
    }

    /// Flush the store to `backups` after every cycle.
    pub fn with_backups(mut self, backups: BackupStore) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Run cycles every `interval` until stopped, or until `max_duration`
    /// has elapsed. A tick is only started when its whole slot fits inside
    /// the run window.
    pub async fn run(
        &mut self,
        interval: Duration,
        max_duration: Option<Duration>,
    ) -> Result<RunSummary, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::Configuration(
                "scheduler interval must be greater than zero".into(),
            ));
        }
        if self.agent_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "agent timeout must be greater than zero".into(),
            ));
        }

        let mut stop_rx = self.shared.stop.subscribe();
        let start = Instant::now();
        let deadline = max_duration.map(|d| start + d);
        let mut cycle_id = self.resume_cycle_id()?;
        let mut tick = start;
        let mut summary = RunSummary::default();

        info!(
            interval_secs = interval.as_secs_f64(),
            max_duration_secs = ?max_duration.map(|d| d.as_secs_f64()),
            first_cycle = cycle_id,
            stages = self.stages.len(),
            "Scheduler started"
        );

        loop {
            if self.shared.stop_requested() {
                summary.stopped = true;
                break;
            }
            if let Some(deadline) = deadline {
                if tick + interval > deadline {
                    self.publish_next_run(None);
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = stopped(&mut stop_rx) => summary.stopped = true,
                    }
                    break;
                }
            }

            self.publish_next_run(Some(tick));
            tokio::select! {
                _ = sleep_until(tick) => {}
                _ = stopped(&mut stop_rx) => {
                    summary.stopped = true;
                    break;
                }
            }

            let record = self.run_cycle(cycle_id).await;
            self.runs_completed += 1;
            summary.cycles_completed += 1;
            summary.first_cycle_id.get_or_insert(cycle_id);
            summary.last_cycle_id = Some(cycle_id);

            tick += interval;
            let now = Instant::now();
            if tick < now {
                let skipped = ticks_behind(now - tick, interval);
                warn!(
                    cycle_id,
                    skipped,
                    "Cycle overran its slot, skipping {skipped} tick(s)"
                );
                summary.skipped_ticks += skipped;
                tick += interval * skipped as u32;
            }

            let next_run_at = if self.shared.stop_requested() {
                None
            } else {
                Some(self.wall_time_of(tick))
            };
            self.persist_cycle(&record, next_run_at);
            self.flush_backup();
            cycle_id += 1;
        }

        self.publish_next_run(None);
        info!(
            cycles = summary.cycles_completed,
            skipped_ticks = summary.skipped_ticks,
            stopped = summary.stopped,
            "Scheduler finished"
        );
        Ok(summary)
    }

    /// Continue numbering after the last persisted cycle.
    fn resume_cycle_id(&self) -> Result<u64, SchedulerError> {
        match self.store.get_as::<CycleRecord>(paths::SCHEDULER_LAST_CYCLE) {
            Ok(Some(last)) => Ok(last.cycle_id + 1),
            Ok(None) => Ok(0),
            Err(ContextError::Serialization(e)) => {
                warn!("Ignoring unreadable {}: {e}", paths::SCHEDULER_LAST_CYCLE);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_cycle(&mut self, cycle_id: u64) -> CycleRecord {
        self.shared.status().current_cycle_id = Some(cycle_id);
        let started_at = self.clock.now_utc();
        debug!(cycle_id, "Cycle started");

        let mut agent_results = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter_mut() {
            if self.shared.stop_requested() {
                info!(cycle_id, "Stop requested, skipping remaining agents");
                break;
            }
            let result = run_stage(stage.as_mut(), &self.store, self.agent_timeout).await;
            agent_results.push(result);
        }

        let record = CycleRecord {
            cycle_id,
            started_at,
            ended_at: self.clock.now_utc(),
            agent_results,
        };
        let failed = record
            .agent_results
            .iter()
            .filter(|r| r.status != AgentStatus::Ok)
            .count();
        info!(cycle_id, agents = record.agent_results.len(), failed, "Cycle finished");
        record
    }

    fn persist_cycle(&self, record: &CycleRecord, next_run_at: Option<DateTime<Utc>>) {
        {
            let mut status = self.shared.status();
            status.last_cycle = Some(record.clone());
            status.next_run_at = next_run_at;
        }

        if let Err(e) = self.store.set(paths::SCHEDULER_LAST_CYCLE, record, NAME) {
            error!(cycle_id = record.cycle_id, "Failed to write cycle record: {e}");
        }

        let limit = self.history_limit;
        let appended = serde_json::to_value(record).map_err(ContextError::from).and_then(|value| {
            self.store.update(paths::SCHEDULER_HISTORY, NAME, |current| {
                let mut history = current
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                history.push(value);
                let excess = history.len().saturating_sub(limit);
                history.drain(..excess);
                Some(serde_json::Value::Array(history))
            })
        });
        if let Err(e) = appended {
            error!(cycle_id = record.cycle_id, "Failed to append cycle history: {e}");
        }

        let state = SchedulerState {
            cycle_id: Some(record.cycle_id),
            next_run_at,
            runs_completed: self.runs_completed,
        };
        if let Err(e) = self.store.set(paths::SCHEDULER_STATE, &state, NAME) {
            error!(cycle_id = record.cycle_id, "Failed to write scheduler state: {e}");
        }
    }

    fn flush_backup(&self) {
        if let Some(backups) = &self.backups {
            if let Err(e) = backups.export(&self.store) {
                error!(dir = %backups.dir().display(), "Context backup failed: {e}");
            }
        }
    }

    fn publish_next_run(&self, tick: Option<Instant>) {
        let next = tick.map(|t| self.wall_time_of(t));
        self.shared.status().next_run_at = next;
    }

    fn wall_time_of(&self, tick: Instant) -> DateTime<Utc> {
        let until = tick.saturating_duration_since(Instant::now());
        let until = chrono::Duration::from_std(until).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.now_utc() + until
    }
}

/// Number of whole ticks that fell strictly before `now`, given it is
/// `behind` past the next planned tick.
fn ticks_behind(behind: Duration, interval: Duration) -> u64 {
    let behind = behind.as_nanos();
    let interval = interval.as_nanos();
    behind.div_ceil(interval) as u64
}

/// Resolves once the stop flag is set.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_stage(stage: &mut dyn PipelineStage, store: &ContextStore, limit: Duration) -> AgentResult {
    let agent = stage.name().to_string();
    let started = Instant::now();
    let outcome = tokio::time::timeout(limit, AssertUnwindSafe(stage.step(store)).catch_unwind()).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (status, error_detail) = match outcome {
        Ok(Ok(Ok(()))) => (AgentStatus::Ok, None),
        Ok(Ok(Err(e))) => {
            error!(agent = %agent, "Agent failed: {e}");
            (AgentStatus::Error, Some(e.to_string()))
        }
        Ok(Err(panic)) => {
            let detail = panic_message(panic.as_ref());
            error!(agent = %agent, "Agent panicked: {detail}");
            (AgentStatus::Error, Some(format!("panic: {detail}")))
        }
        Err(_) => {
            warn!(agent = %agent, "Agent timed out after {limit:?}");
            (AgentStatus::Timeout, Some(format!("timed out after {limit:?}")))
        }
    };
    AgentResult {
        agent,
        status,
        error_detail,
        elapsed_ms,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
