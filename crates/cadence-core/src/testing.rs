//! Fake collaborators and pipeline stages for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agent::PipelineStage;
use crate::collaborators::{
    AcceptanceStat, ActivitySample, ActivitySource, BreakHistory, BreakOutcome, CalendarEvent,
    CalendarSource, DeliveryAck, Notification, NotificationSink, SuggestedBreak, SuggestionEngine,
    SuggestionRequest,
};
use crate::context::ContextStore;
use crate::error::{AgentError, CollaboratorError};
use crate::suggestion::BreakType;

async fn hang() {
    std::future::pending::<()>().await;
}

pub struct FailingActivity;

#[async_trait]
impl ActivitySource for FailingActivity {
    async fn sample(&self) -> Result<ActivitySample, CollaboratorError> {
        Err(CollaboratorError::unavailable("activity source", "sensor offline"))
    }
}

pub struct FixedCalendar(pub Vec<CalendarEvent>);

#[async_trait]
impl CalendarSource for FixedCalendar {
    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        Ok(self
            .0
            .iter()
            .filter(|e| e.start < end && e.end > start)
            .cloned()
            .collect())
    }
}

pub struct HangingCalendar;

#[async_trait]
impl CalendarSource for HangingCalendar {
    async fn events_between(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        hang().await;
        Ok(Vec::new())
    }
}

/// Always suggests a walk and counts calls.
#[derive(Default)]
pub struct CountingEngine {
    calls: AtomicUsize,
}

impl CountingEngine {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SuggestionEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    async fn suggest(&self, _request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SuggestedBreak {
            break_type: BreakType::Walk,
            message: "walk it off".into(),
        })
    }
}

pub struct HangingEngine;

#[async_trait]
impl SuggestionEngine for HangingEngine {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn suggest(&self, _request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError> {
        hang().await;
        Err(CollaboratorError::unavailable("hanging", "unreachable"))
    }
}

pub struct FailingEngine;

#[async_trait]
impl SuggestionEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn suggest(&self, _request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError> {
        Err(CollaboratorError::unavailable("failing", "model not loaded"))
    }
}

pub struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _notification: &Notification) -> Result<DeliveryAck, CollaboratorError> {
        Err(CollaboratorError::unavailable("notification sink", "display locked"))
    }
}

pub struct HangingSink;

#[async_trait]
impl NotificationSink for HangingSink {
    async fn deliver(&self, _notification: &Notification) -> Result<DeliveryAck, CollaboratorError> {
        hang().await;
        Err(CollaboratorError::unavailable("notification sink", "unreachable"))
    }
}

/// Break history whose storage never answers.
pub struct HangingHistory;

#[async_trait]
impl BreakHistory for HangingHistory {
    async fn append(&self, _outcome: &BreakOutcome) -> Result<(), CollaboratorError> {
        hang().await;
        Ok(())
    }

    async fn acceptance_stats(&self) -> Result<Vec<AcceptanceStat>, CollaboratorError> {
        hang().await;
        Ok(Vec::new())
    }
}

/// What a [`ScriptedStage`] does when stepped.
#[derive(Clone, Copy, Debug)]
pub enum StageBehavior {
    Succeed,
    Fail,
    Panic,
    /// Sleep on the tokio clock before succeeding.
    Sleep(Duration),
}

/// Pipeline stage that logs each step into a shared journal.
pub struct ScriptedStage {
    name: String,
    behavior: StageBehavior,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStage {
    pub fn new(name: &str, behavior: StageBehavior, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            journal,
        }
    }
}

#[async_trait]
impl PipelineStage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self, store: &ContextStore) -> Result<(), AgentError> {
        self.journal.lock().unwrap().push(self.name.clone());
        match self.behavior {
            StageBehavior::Succeed => {}
            StageBehavior::Fail => return Err(AgentError::execution(&self.name, "scripted failure")),
            StageBehavior::Panic => panic!("scripted panic in {}", self.name),
            StageBehavior::Sleep(d) => tokio::time::sleep(d).await,
        }
        store.set(&format!("stages.{}", self.name), true, &self.name)?;
        Ok(())
    }
}
