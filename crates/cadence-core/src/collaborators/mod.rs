//! External systems the agents depend on. Every call is bounded by the
//! calling agent and its failure is absorbed there.

pub mod activity;
pub mod calendar;
pub mod engine;
pub mod history;
pub mod sink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use activity::SimulatedActivitySource;
pub use calendar::{EmptyCalendar, LocalCalendarSource};
pub use engine::{OllamaSuggestionEngine, TemplateSuggestionEngine};
pub use history::SqliteBreakHistory;
pub use sink::LogNotificationSink;

use crate::agent::{FocusLevel, FocusMode, TimeOfDay};
use crate::error::CollaboratorError;
use crate::suggestion::{BreakType, SuggestionSource};

/// One reading of the user's machine activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub idle_seconds: u64,
    pub active_app: String,
    /// Application switches per minute.
    pub switch_rate: f64,
}

#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn sample(&self) -> Result<ActivitySample, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events overlapping `[start, end)`, in start order.
    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError>;
}

/// Everything an engine may use to tailor a suggestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    pub focus_level: FocusLevel,
    pub focus_mode: FocusMode,
    pub time_of_day: TimeOfDay,
    pub minutes_worked: i64,
    pub in_meeting: bool,
    pub minutes_to_next_meeting: Option<i64>,
    pub previous_break: Option<BreakType>,
    pub acceptance: Vec<AcceptanceStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedBreak {
    pub break_type: BreakType,
    pub message: String,
}

#[async_trait]
pub trait SuggestionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn suggest(&self, request: &SuggestionRequest) -> Result<SuggestedBreak, CollaboratorError>;
}

/// What the sink is asked to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub suggestion_id: String,
    pub break_type: BreakType,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub channel: String,
    pub delivered_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<DeliveryAck, CollaboratorError>;
}

/// A finished suggestion, as recorded in the break history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakOutcome {
    pub suggestion_id: String,
    pub break_type: BreakType,
    pub source: SuggestionSource,
    pub accepted: bool,
    pub responded_at: DateTime<Utc>,
}

/// Per break type: how often it was offered and accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptanceStat {
    pub break_type: BreakType,
    pub offered: u64,
    pub accepted: u64,
}

impl AcceptanceStat {
    pub fn rate(&self) -> f64 {
        if self.offered == 0 {
            0.0
        } else {
            self.accepted as f64 / self.offered as f64
        }
    }
}

/// Durable record of answered breaks.
#[async_trait]
pub trait BreakHistory: Send + Sync {
    async fn append(&self, outcome: &BreakOutcome) -> Result<(), CollaboratorError>;

    async fn acceptance_stats(&self) -> Result<Vec<AcceptanceStat>, CollaboratorError>;
}
