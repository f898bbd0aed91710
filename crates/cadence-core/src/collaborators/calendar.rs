use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{CalendarEvent, CalendarSource};
use crate::error::CollaboratorError;

const NAME: &str = "calendar";

/// No calendar configured: never any events.
pub struct EmptyCalendar;

#[async_trait]
impl CalendarSource for EmptyCalendar {
    async fn events_between(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    events: Vec<FileEvent>,
}

#[derive(Debug, Deserialize)]
struct FileEvent {
    #[serde(default = "untitled", alias = "title")]
    summary: String,
    #[serde(alias = "start_time")]
    start: DateTime<Utc>,
    #[serde(alias = "end_time")]
    end: DateTime<Utc>,
    #[serde(default)]
    location: Option<String>,
}

fn untitled() -> String {
    "Untitled Event".into()
}

/// Events read from a JSON file of the form `{"events": [{summary, start, end, location?}]}`.
///
/// Timestamps are RFC 3339. The file is re-read on every query so edits
/// show up on the next cycle. A missing file means an empty calendar.
pub struct LocalCalendarSource {
    path: PathBuf,
}

impl LocalCalendarSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CalendarSource for LocalCalendarSource {
    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CollaboratorError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Calendar file missing, no events");
                return Ok(Vec::new());
            }
            Err(e) => return Err(CollaboratorError::unavailable(NAME, e)),
        };
        let file: CalendarFile = serde_json::from_str(&raw).map_err(|e| {
            CollaboratorError::unavailable(NAME, format!("{}: {e}", self.path.display()))
        })?;

        let mut events: Vec<CalendarEvent> = file
            .events
            .into_iter()
            .filter(|e| e.start < end && e.end > start)
            .map(|e| CalendarEvent {
                start: e.start,
                end: e.end,
                summary: e.summary,
                location: e.location.filter(|l| !l.is_empty()),
            })
            .collect();
        events.sort_by_key(|e| e.start);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn reads_overlapping_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        std::fs::write(
            &path,
            r#"{"events": [
                {"summary": "Lunch", "start_time": "2026-03-02T12:00:00Z", "end_time": "2026-03-02T13:00:00Z", "location": ""},
                {"summary": "Standup", "start": "2026-03-02T09:50:00Z", "end": "2026-03-02T10:15:00Z"},
                {"title": "Tomorrow", "start": "2026-03-03T09:00:00Z", "end": "2026-03-03T10:00:00Z"}
            ]}"#,
        )
        .unwrap();

        let source = LocalCalendarSource::new(&path);
        let now = at("2026-03-02T10:00:00Z");
        let events = source.events_between(now, now + Duration::hours(3)).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(names, ["Standup", "Lunch"]);
        assert_eq!(events[1].location, None);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let source = LocalCalendarSource::new("/definitely/not/here.json");
        let now = Utc::now();
        assert!(source.events_between(now, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, "{\"events\": [{\"summary\": 1}]}").unwrap();
        let now = Utc::now();
        let err = LocalCalendarSource::new(&path)
            .events_between(now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable { .. }));
    }
}
