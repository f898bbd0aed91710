//! Assembles the store, collaborators, agents and scheduler from a [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cadence_config::{resolve_path, Config, EngineKind};
use tracing::{info, warn};

use crate::agent::{ContextAgent, DeliveryAgent, FocusMonitorAgent, NudgeAgent, PipelineStage, ResponseHandle};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    ActivitySource, BreakHistory, CalendarSource, EmptyCalendar, LocalCalendarSource,
    LogNotificationSink, NotificationSink, OllamaSuggestionEngine, SimulatedActivitySource,
    SqliteBreakHistory, SuggestionEngine, TemplateSuggestionEngine,
};
use crate::context::{BackupStore, ContextStore, QueuedResponse, ResponseInbox};
use crate::scheduler::{RunSummary, SchedulerAgent, SchedulerHandle};
use crate::suggestion::{load_active, SuggestionRecord};

const BACKUP_DIR: &str = "backups";
const INBOX_DIR: &str = "inbox";
const HISTORY_DB: &str = "breaks.db";
const RUN_LOCK: &str = "run.lock";

/// The external systems the pipeline talks to.
pub struct Collaborators {
    pub activity: Arc<dyn ActivitySource>,
    pub calendar: Arc<dyn CalendarSource>,
    pub engine: Arc<dyn SuggestionEngine>,
    pub sink: Arc<dyn NotificationSink>,
    pub history: Arc<dyn BreakHistory>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators described by `config`, with the break history stored under `data_dir`.
    pub fn from_config(config: &Config, data_dir: &Path) -> Result<Self> {
        let activity = SimulatedActivitySource::profile(&config.activity.profile)
            .context("Invalid activity profile")?;

        let calendar: Arc<dyn CalendarSource> = match &config.context.calendar_file {
            Some(file) => Arc::new(LocalCalendarSource::new(resolve_path(file))),
            None => Arc::new(EmptyCalendar),
        };

        let nudge = &config.nudge;
        let engine: Arc<dyn SuggestionEngine> = match nudge.engine.kind {
            EngineKind::Template => Arc::new(TemplateSuggestionEngine),
            EngineKind::Ollama => Arc::new(OllamaSuggestionEngine::new(
                &nudge.engine.api_base,
                &nudge.engine.model,
                Duration::from_secs(nudge.suggestion_timeout_secs),
            )),
        };

        let history = SqliteBreakHistory::open(&data_dir.join(HISTORY_DB))
            .context("Failed to open break history")?;

        Ok(Self {
            activity: Arc::new(activity),
            calendar,
            engine,
            sink: Arc::new(LogNotificationSink),
            history: Arc::new(history),
            clock: Arc::new(SystemClock::with_offset_minutes(config.context.utc_offset_minutes)),
        })
    }
}

/// Marks a data directory as driven by a running pipeline. Removed on drop.
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir '{}'", data_dir.display()))?;
        let path = data_dir.join(RUN_LOCK);
        if path.exists() {
            warn!(path = %path.display(), "Run lock already present, taking it over");
        }
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("failed to write run lock '{}'", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove run lock: {e}");
        }
    }
}

/// How [`Runtime::respond`] handled an answer.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Applied to this runtime's store and written to a new backup.
    Applied(SuggestionRecord),
    /// Left in the inbox for the pipeline running on the same data directory.
    Queued(PathBuf),
}

/// A fully wired pipeline, ready to run.
pub struct Runtime {
    data_dir: PathBuf,
    store: Arc<ContextStore>,
    backups: BackupStore,
    inbox: ResponseInbox,
    scheduler: SchedulerAgent,
    responses: ResponseHandle,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Runtime {
    /// Build from `config`, restoring the store from the newest valid backup.
    pub fn from_config(config: &Config) -> Result<Self> {
        let data_dir = resolve_path(&config.store.data_dir);
        let collaborators = Collaborators::from_config(config, &data_dir)?;
        Self::with_collaborators(config, data_dir, collaborators)
    }

    pub fn with_collaborators(config: &Config, data_dir: PathBuf, c: Collaborators) -> Result<Self> {
        config.validate()?;

        let store = ContextStore::shared(config.store.notify_queue_capacity);
        let backups = BackupStore::new(data_dir.join(BACKUP_DIR), config.store.backup_keep);
        match backups.restore_latest(&store) {
            Ok(true) => info!(entries = store.len(), "Context restored"),
            Ok(false) => {}
            Err(e) => warn!("Could not restore context, starting empty: {e}"),
        }

        let history_limit = config.nudge.history_limit;
        let inbox = ResponseInbox::new(data_dir.join(INBOX_DIR));
        let responses = ResponseHandle::new(store.clone(), c.history.clone(), c.clock.clone(), history_limit)
            .with_history_timeout(Duration::from_secs(config.nudge.history_timeout_secs));

        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(FocusMonitorAgent::new(
                config.focus.clone(),
                c.activity,
                c.clock.clone(),
                Duration::from_secs(config.activity.sample_timeout_secs),
            )),
            Box::new(ContextAgent::new(config.context.clone(), c.calendar, c.clock.clone())),
            Box::new(NudgeAgent::new(
                config.nudge.clone(),
                c.engine,
                c.history.clone(),
                c.clock.clone(),
            )),
            Box::new(
                DeliveryAgent::new(config.delivery.clone(), history_limit, c.sink, c.clock.clone())
                    .with_inbox(inbox.clone(), &responses),
            ),
        ];

        let scheduler = SchedulerAgent::new(stages, store.clone(), c.clock.clone())
            .with_backups(backups.clone())
            .with_agent_timeout(Duration::from_secs(config.scheduler.agent_timeout_secs))
            .with_history_limit(config.scheduler.history_limit);

        Ok(Self {
            data_dir,
            store,
            backups,
            inbox,
            scheduler,
            responses,
            clock: c.clock,
            interval: Duration::from_secs(config.scheduler.interval_secs),
        })
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Accept/ignore path for the active suggestion.
    pub fn responses(&self) -> ResponseHandle {
        self.responses.clone()
    }

    pub fn inbox(&self) -> &ResponseInbox {
        &self.inbox
    }

    /// True while some process is running the pipeline on this data directory.
    pub fn is_live(&self) -> bool {
        self.data_dir.join(RUN_LOCK).exists()
    }

    /// Answer suggestion `id` from outside the pipeline.
    ///
    /// With a live run on the same data directory the answer is queued for
    /// its delivery agent, which applies it on the next cycle. Otherwise it
    /// is applied to the restored store and flushed to a new backup.
    pub async fn respond(&self, id: &str, accepted: bool) -> Result<ResponseOutcome> {
        if !self.is_live() {
            let record = self.responses.record_response(id, accepted).await?;
            self.shutdown();
            return Ok(ResponseOutcome::Applied(record));
        }

        if !load_active(&self.store)?.is_some_and(|r| r.id == id) {
            bail!("suggestion {id} is not the active suggestion");
        }
        let path = self.inbox.submit(&QueuedResponse {
            suggestion_id: id.to_string(),
            accepted,
            submitted_at: self.clock.now_utc(),
        })?;
        info!(id, path = %path.display(), "Response queued for the running pipeline");
        Ok(ResponseOutcome::Queued(path))
    }

    /// Run the scheduler at the configured interval, then write a final backup.
    ///
    /// Holds the data directory's run lock for the duration. Responses queued
    /// after the last cycle stay in the inbox for the next run.
    pub async fn run(&mut self, max_duration: Option<Duration>) -> Result<RunSummary> {
        let _lock = RunLock::acquire(&self.data_dir)?;
        let outcome = self.scheduler.run(self.interval, max_duration).await;
        self.shutdown();
        Ok(outcome?)
    }

    /// Flush the store one last time.
    pub fn shutdown(&self) {
        match self.backups.export(&self.store) {
            Ok(path) => info!(path = %path.display(), "Final context backup written"),
            Err(e) => warn!("Final context backup failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::paths;
    use crate::scheduler::CycleRecord;
    use crate::suggestion::{load_history, SuggestionStatus};
    use crate::testing::{CountingEngine, FailingSink};
    use chrono::{DateTime, FixedOffset};

    fn collaborators(clock: ManualClock) -> Collaborators {
        Collaborators {
            activity: Arc::new(SimulatedActivitySource::profile("deep_work").unwrap()),
            calendar: Arc::new(EmptyCalendar),
            engine: Arc::new(CountingEngine::default()),
            sink: Arc::new(FailingSink),
            history: Arc::new(SqliteBreakHistory::open_in_memory().unwrap()),
            clock: Arc::new(clock),
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.scheduler.interval_secs = 5;
        config
    }

    fn start() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-02T10:00:00+00:00").unwrap()
    }

    /// Idle user, working sink: the first cycle delivers a suggestion.
    fn suggesting_collaborators(clock: &ManualClock) -> Collaborators {
        Collaborators {
            activity: Arc::new(SimulatedActivitySource::profile("idle").unwrap()),
            calendar: Arc::new(EmptyCalendar),
            engine: Arc::new(TemplateSuggestionEngine),
            sink: Arc::new(LogNotificationSink),
            history: Arc::new(SqliteBreakHistory::open_in_memory().unwrap()),
            clock: Arc::new(clock.clone()),
        }
    }

    fn suggesting_config() -> Config {
        let mut config = config();
        config.nudge.work_session_minutes = 0;
        config
    }

    fn latest_state(dir: &Path) -> ContextStore {
        let backups = BackupStore::new(dir.join(BACKUP_DIR), 5);
        let store = ContextStore::new();
        store
            .restore_snapshot(backups.load_latest_valid().unwrap().unwrap().snapshot)
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn runs_full_pipeline_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(DateTime::parse_from_rfc3339("2026-03-02T10:00:00+00:00").unwrap());

        let mut runtime =
            Runtime::with_collaborators(&config(), dir.path().to_path_buf(), collaborators(clock.clone()))
                .unwrap();
        let summary = runtime.run(Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(summary.cycles_completed, 2);

        let store = runtime.store();
        assert!(store.get(paths::FOCUS_CURRENT).is_ok());
        assert!(store.get(paths::ENVIRONMENT_CURRENT).is_ok());
        let record: CycleRecord = store.get_as(paths::SCHEDULER_LAST_CYCLE).unwrap().unwrap();
        assert_eq!(record.agent_results.len(), 4);
        assert!(record.is_clean());
        assert!(!runtime.backups().list().unwrap().is_empty());

        let restored =
            Runtime::with_collaborators(&config(), dir.path().to_path_buf(), collaborators(clock)).unwrap();
        let record: CycleRecord = restored
            .store()
            .get_as(paths::SCHEDULER_LAST_CYCLE)
            .unwrap()
            .unwrap();
        assert_eq!(record.cycle_id, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(DateTime::parse_from_rfc3339("2026-03-02T10:00:00+00:00").unwrap());
        let mut config = config();
        config.scheduler.interval_secs = 0;
        let err = Runtime::with_collaborators(&config, dir.path().to_path_buf(), collaborators(clock));
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn response_from_second_runtime_survives_live_run() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = suggesting_config();
        let mut daemon =
            Runtime::with_collaborators(&config, dir.path().to_path_buf(), suggesting_collaborators(&clock))
                .unwrap();

        let answer = async {
            // After the first cycle delivered a suggestion, before the next tick.
            tokio::time::sleep(Duration::from_secs(6)).await;
            let other =
                Runtime::with_collaborators(&config, dir.path().to_path_buf(), suggesting_collaborators(&clock))
                    .unwrap();
            assert!(other.is_live());
            let active = load_active(other.store()).unwrap().unwrap();
            assert_eq!(active.status, SuggestionStatus::Delivered);
            let outcome = other.respond(&active.id, true).await.unwrap();
            assert!(matches!(outcome, ResponseOutcome::Queued(_)));
            active.id
        };
        let (summary, id) = tokio::join!(daemon.run(Some(Duration::from_secs(15))), answer);
        assert_eq!(summary.unwrap().cycles_completed, 3);

        assert!(!dir.path().join(RUN_LOCK).exists());
        assert!(daemon.inbox().is_empty().unwrap());
        let durable = latest_state(dir.path());
        assert!(load_active(&durable).unwrap().is_none());
        let answered = load_history(&durable).unwrap();
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].id, id);
        assert_eq!(answered[0].status, SuggestionStatus::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_live_run_is_applied_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let config = suggesting_config();
        let mut first =
            Runtime::with_collaborators(&config, dir.path().to_path_buf(), suggesting_collaborators(&clock))
                .unwrap();
        first.run(Some(Duration::from_secs(5))).await.unwrap();

        let offline =
            Runtime::with_collaborators(&config, dir.path().to_path_buf(), suggesting_collaborators(&clock))
                .unwrap();
        assert!(!offline.is_live());
        let id = load_active(offline.store()).unwrap().unwrap().id;
        match offline.respond(&id, false).await.unwrap() {
            ResponseOutcome::Applied(record) => assert_eq!(record.status, SuggestionStatus::Ignored),
            other => panic!("expected an applied response, got {other:?}"),
        }

        let durable = latest_state(dir.path());
        assert!(load_active(&durable).unwrap().is_none());
        assert_eq!(load_history(&durable).unwrap()[0].status, SuggestionStatus::Ignored);
    }

    #[tokio::test]
    async fn queued_response_must_name_active_suggestion() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let runtime =
            Runtime::with_collaborators(&config(), dir.path().to_path_buf(), suggesting_collaborators(&clock))
                .unwrap();
        let _lock = RunLock::acquire(dir.path()).unwrap();

        assert!(runtime.respond("no-such-id", true).await.is_err());
        assert!(runtime.inbox().is_empty().unwrap());
    }
}
