use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{paths, ContextStore};
use crate::error::ContextError;

/// Kind of break a suggestion proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakType {
    Eye,
    Stretch,
    Walk,
    Hydration,
    Posture,
    Breathing,
    Mindfulness,
    Creative,
}

impl BreakType {
    /// Fixed order used by the fallback rotation.
    pub const ALL: [BreakType; 8] = [
        BreakType::Eye,
        BreakType::Stretch,
        BreakType::Walk,
        BreakType::Hydration,
        BreakType::Posture,
        BreakType::Breathing,
        BreakType::Mindfulness,
        BreakType::Creative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakType::Eye => "eye",
            BreakType::Stretch => "stretch",
            BreakType::Walk => "walk",
            BreakType::Hydration => "hydration",
            BreakType::Posture => "posture",
            BreakType::Breathing => "breathing",
            BreakType::Mindfulness => "mindfulness",
            BreakType::Creative => "creative",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let s = s.strip_suffix("_break").unwrap_or(&s);
        Self::ALL.into_iter().find(|b| b.as_str() == s)
    }

    pub fn title(&self) -> &'static str {
        match self {
            BreakType::Eye => "Eye Care Break",
            BreakType::Stretch => "Quick Stretch",
            BreakType::Walk => "Walking Break",
            BreakType::Hydration => "Hydration Break",
            BreakType::Posture => "Posture Check",
            BreakType::Breathing => "Breathing Break",
            BreakType::Mindfulness => "Mindful Minute",
            BreakType::Creative => "Creative Pause",
        }
    }

    /// Message used when no engine text is available.
    pub fn default_message(&self) -> &'static str {
        match self {
            BreakType::Eye => "Look at something 20 feet away for 20 seconds.",
            BreakType::Stretch => "Stand up and stretch your arms overhead.",
            BreakType::Walk => "Take a short walk around your space.",
            BreakType::Hydration => "Time for a glass of water!",
            BreakType::Posture => "Roll your shoulders back and sit tall.",
            BreakType::Breathing => "Take five slow, deep breaths.",
            BreakType::Mindfulness => "Pause for a minute and notice how you feel.",
            BreakType::Creative => "Doodle or jot down a stray idea for a minute.",
        }
    }
}

impl fmt::Display for BreakType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round-robin position of the fallback rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub next_index: usize,
}

impl Rotation {
    /// Next break type in the fixed order, never repeating `previous`.
    pub fn pick(&mut self, previous: Option<BreakType>) -> BreakType {
        let len = BreakType::ALL.len();
        let mut index = self.next_index % len;
        if Some(BreakType::ALL[index]) == previous {
            index = (index + 1) % len;
        }
        self.next_index = (index + 1) % len;
        BreakType::ALL[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    Engine,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Delivered,
    Accepted,
    Ignored,
    Expired,
}

impl SuggestionStatus {
    /// Pending and delivered records occupy the active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, SuggestionStatus::Pending | SuggestionStatus::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Delivered => "delivered",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Ignored => "ignored",
            SuggestionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A break suggestion and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRecord {
    pub id: String,
    pub break_type: BreakType,
    pub message: String,
    pub source: SuggestionSource,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    pub status: SuggestionStatus,
}

impl SuggestionRecord {
    pub fn pending(
        break_type: BreakType,
        message: String,
        source: SuggestionSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            break_type,
            message,
            source,
            created_at: now,
            delivered_at: None,
            responded_at: None,
            status: SuggestionStatus::Pending,
        }
    }

    /// Start of the expiry window: delivery time, or creation while pending.
    pub fn expiry_anchor(&self) -> DateTime<Utc> {
        self.delivered_at.unwrap_or(self.created_at)
    }
}

/// The record in the active slot, if any. An emptied slot holds `null`.
pub fn load_active(store: &ContextStore) -> Result<Option<SuggestionRecord>, ContextError> {
    Ok(store
        .get_as::<Option<SuggestionRecord>>(paths::SUGGESTIONS_ACTIVE)?
        .flatten()
        .filter(|r| r.status.is_active()))
}

/// Finished records, oldest first.
pub fn load_history(store: &ContextStore) -> Result<Vec<SuggestionRecord>, ContextError> {
    Ok(store
        .get_as::<Vec<SuggestionRecord>>(paths::SUGGESTIONS_HISTORY)?
        .unwrap_or_default())
}

/// What a guarded transition of the active slot found.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `f` produced a new record; it is active or was archived.
    Applied(SuggestionRecord),
    /// The record exists but `f` declined to change it.
    Declined(SuggestionRecord),
    /// No active record with that id.
    Missing,
}

/// Atomically replace the active record `id` with `f(record)`.
///
/// Finished results empty the slot and are appended to the history,
/// which keeps at most `history_limit` records.
pub fn transition_active<F>(
    store: &ContextStore,
    writer: &str,
    id: &str,
    history_limit: usize,
    f: F,
) -> Result<Transition, ContextError>
where
    F: FnOnce(&SuggestionRecord) -> Option<SuggestionRecord>,
{
    let mut outcome = Transition::Missing;
    store.update(paths::SUGGESTIONS_ACTIVE, writer, |current| {
        let record = current
            .and_then(|v| serde_json::from_value::<Option<SuggestionRecord>>(v.clone()).ok())
            .flatten()
            .filter(|r| r.id == id && r.status.is_active())?;
        match f(&record) {
            Some(next) => {
                let value = if next.status.is_active() {
                    serde_json::to_value(&next).ok()?
                } else {
                    Value::Null
                };
                outcome = Transition::Applied(next);
                Some(value)
            }
            None => {
                outcome = Transition::Declined(record);
                None
            }
        }
    })?;

    if let Transition::Applied(record) = &outcome {
        if !record.status.is_active() {
            archive(store, writer, record, history_limit)?;
        }
    }
    Ok(outcome)
}

/// Append a finished record to the bounded history.
pub fn archive(
    store: &ContextStore,
    writer: &str,
    record: &SuggestionRecord,
    history_limit: usize,
) -> Result<(), ContextError> {
    let entry = serde_json::to_value(record)?;
    store.update(paths::SUGGESTIONS_HISTORY, writer, |current| {
        let mut list = match current {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        list.push(entry);
        let excess = list.len().saturating_sub(history_limit.max(1));
        list.drain(..excess);
        Some(Value::Array(list))
    })?;
    Ok(())
}
