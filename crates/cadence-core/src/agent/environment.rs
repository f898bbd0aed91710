use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_config::ContextConfig;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{bounded, Agent};
use crate::clock::Clock;
use crate::collaborators::{CalendarEvent, CalendarSource};
use crate::context::{paths, ContextStore};
use crate::error::{AgentError, CollaboratorError};

pub const NAME: &str = "context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    /// Morning is 05:00–11:59, afternoon until 16:59, evening otherwise.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            _ => TimeOfDay::Evening,
        }
    }
}

/// Time and calendar context, stored at `environment.current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSnapshot {
    pub now: DateTime<FixedOffset>,
    pub in_meeting: bool,
    pub minutes_to_next_meeting: Option<i64>,
    pub events: Vec<CalendarEvent>,
    pub calendar_unavailable: bool,
    pub is_working_hours: bool,
    pub time_of_day: TimeOfDay,
}

pub struct EnvironmentPerception {
    now: DateTime<FixedOffset>,
    events: Result<Vec<CalendarEvent>, CollaboratorError>,
}

/// Enriches the store with time-of-day and calendar context.
pub struct ContextAgent {
    config: ContextConfig,
    calendar: Arc<dyn CalendarSource>,
    clock: Arc<dyn Clock>,
}

impl ContextAgent {
    pub fn new(config: ContextConfig, calendar: Arc<dyn CalendarSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            calendar,
            clock,
        }
    }

    fn is_working_hours(&self, now: &DateTime<FixedOffset>) -> bool {
        let weekday = !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        weekday && (self.config.work_start_hour..self.config.work_end_hour).contains(&now.hour())
    }
}

#[async_trait]
impl Agent for ContextAgent {
    type Perception = EnvironmentPerception;
    type Decision = EnvironmentSnapshot;

    fn name(&self) -> &str {
        NAME
    }

    async fn perceive(&mut self, _store: &ContextStore) -> Result<EnvironmentPerception, AgentError> {
        let now = self.clock.now();
        let start = self.clock.now_utc();
        let end = start + chrono::Duration::minutes(self.config.lookahead_minutes as i64);
        let events = bounded(
            "calendar",
            Duration::from_secs(self.config.calendar_timeout_secs),
            self.calendar.events_between(start, end),
        )
        .await;
        Ok(EnvironmentPerception { now, events })
    }

    fn reason(&mut self, perception: EnvironmentPerception) -> Result<EnvironmentSnapshot, AgentError> {
        let EnvironmentPerception { now, events } = perception;
        let (events, calendar_unavailable) = match events {
            Ok(events) => (events, false),
            Err(e) => {
                warn!("Calendar unavailable, continuing without events: {e}");
                (Vec::new(), true)
            }
        };

        let now_utc = now.with_timezone(&Utc);
        let in_meeting = events.iter().any(|e| e.start <= now_utc && now_utc < e.end);
        let minutes_to_next_meeting = events
            .iter()
            .filter(|e| e.start > now_utc)
            .map(|e| (e.start - now_utc).num_minutes())
            .min();

        let snapshot = EnvironmentSnapshot {
            now,
            in_meeting,
            minutes_to_next_meeting,
            is_working_hours: self.is_working_hours(&now),
            time_of_day: TimeOfDay::from_hour(now.hour()),
            events,
            calendar_unavailable,
        };
        debug!(
            in_meeting,
            next_meeting = ?snapshot.minutes_to_next_meeting,
            working_hours = snapshot.is_working_hours,
            "Environment updated"
        );
        Ok(snapshot)
    }

    async fn act(&mut self, store: &ContextStore, snapshot: EnvironmentSnapshot) -> Result<(), AgentError> {
        store.set(paths::ENVIRONMENT_CURRENT, &snapshot, NAME)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PipelineStage;
    use crate::clock::ManualClock;
    use crate::collaborators::EmptyCalendar;
    use crate::testing::{FixedCalendar, HangingCalendar};

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn event(start: &str, end: &str, summary: &str) -> CalendarEvent {
        CalendarEvent {
            start: at(start).with_timezone(&Utc),
            end: at(end).with_timezone(&Utc),
            summary: summary.into(),
            location: None,
        }
    }

    fn agent(now: &str, calendar: Arc<dyn CalendarSource>) -> ContextAgent {
        let config = ContextConfig {
            calendar_timeout_secs: 1,
            ..ContextConfig::default()
        };
        ContextAgent::new(config, calendar, Arc::new(ManualClock::new(at(now))))
    }

    #[test]
    fn time_of_day_boundaries() {
        assert_eq!(TimeOfDay::from_hour(4), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(17), TimeOfDay::Evening);
    }

    #[tokio::test]
    async fn detects_meetings() {
        let calendar = FixedCalendar(vec![
            event("2026-03-02T10:00:00Z", "2026-03-02T10:30:00Z", "Standup"),
            event("2026-03-02T11:00:00Z", "2026-03-02T12:00:00Z", "Review"),
        ]);
        let store = ContextStore::new();
        let mut agent = agent("2026-03-02T10:15:00+00:00", Arc::new(calendar));
        agent.step(&store).await.unwrap();

        let env: EnvironmentSnapshot = store.get_as(paths::ENVIRONMENT_CURRENT).unwrap().unwrap();
        assert!(env.in_meeting);
        assert_eq!(env.minutes_to_next_meeting, Some(45));
        assert!(env.is_working_hours);
        assert_eq!(env.time_of_day, TimeOfDay::Morning);
        assert!(!env.calendar_unavailable);
    }

    #[tokio::test]
    async fn weekend_is_outside_working_hours() {
        let store = ContextStore::new();
        let mut agent = agent("2026-03-07T10:00:00+00:00", Arc::new(EmptyCalendar));
        agent.step(&store).await.unwrap();
        assert_eq!(
            store.get("environment.current.isWorkingHours").unwrap(),
            serde_json::json!(false)
        );
        assert_eq!(store.get("environment.current.inMeeting").unwrap(), serde_json::json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn calendar_timeout_degrades() {
        let store = ContextStore::new();
        let mut agent = agent("2026-03-02T10:15:00+00:00", Arc::new(HangingCalendar));
        agent.step(&store).await.unwrap();

        let env: EnvironmentSnapshot = store.get_as(paths::ENVIRONMENT_CURRENT).unwrap().unwrap();
        assert!(env.calendar_unavailable);
        assert!(env.events.is_empty());
        assert!(!env.in_meeting);
        assert_eq!(env.minutes_to_next_meeting, None);
    }
}
