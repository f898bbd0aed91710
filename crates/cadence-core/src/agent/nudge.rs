use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_config::NudgeConfig;
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::environment::{EnvironmentSnapshot, TimeOfDay};
use super::focus::{FocusLevel, FocusMode, FocusState};
use super::{bounded, Agent};
use crate::clock::Clock;
use crate::collaborators::{AcceptanceStat, BreakHistory, SuggestionEngine, SuggestionRequest};
use crate::context::{paths, ContextStore};
use crate::error::AgentError;
use crate::suggestion::{
    load_active, load_history, BreakType, Rotation, SuggestionRecord, SuggestionSource,
};

pub const NAME: &str = "nudge";

/// Outcome of the due check, stored at `nudge.state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeState {
    pub due: bool,
    pub reason: String,
    pub minutes_since_break: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

pub struct NudgePerception {
    now: DateTime<FixedOffset>,
    focus: Option<FocusState>,
    environment: Option<EnvironmentSnapshot>,
    active: Option<SuggestionRecord>,
    last_break_at: Option<DateTime<Utc>>,
    previous_break: Option<BreakType>,
    session_started_at: Option<DateTime<Utc>>,
    rotation: Rotation,
    acceptance: Vec<AcceptanceStat>,
}

pub struct NudgeDecision {
    state: NudgeState,
    start_session: Option<DateTime<Utc>>,
    request: Option<SuggestionRequest>,
    rotation: Rotation,
}

/// Decides when a break is due and obtains a suggestion for it.
pub struct NudgeAgent {
    config: NudgeConfig,
    ceiling: FocusLevel,
    engine: Arc<dyn SuggestionEngine>,
    history: Arc<dyn BreakHistory>,
    clock: Arc<dyn Clock>,
}

/// Read a typed value, treating an unreadable one as absent.
fn read<T: serde::de::DeserializeOwned>(store: &ContextStore, path: &str) -> Option<T> {
    match store.get_as::<T>(path) {
        Ok(value) => value,
        Err(e) => {
            warn!(path, "Ignoring unreadable context value: {e}");
            None
        }
    }
}

impl NudgeAgent {
    pub fn new(
        config: NudgeConfig,
        engine: Arc<dyn SuggestionEngine>,
        history: Arc<dyn BreakHistory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Validated config only names known levels.
        let ceiling = FocusLevel::from_str(&config.focus_ceiling).unwrap_or(FocusLevel::DeepFocus);
        Self {
            config,
            ceiling,
            engine,
            history,
            clock,
        }
    }

    fn suggestion_timeout(&self) -> Duration {
        Duration::from_secs(self.config.suggestion_timeout_secs)
    }

    fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.config.history_timeout_secs)
    }
}

#[async_trait]
impl Agent for NudgeAgent {
    type Perception = NudgePerception;
    type Decision = NudgeDecision;

    fn name(&self) -> &str {
        NAME
    }

    async fn perceive(&mut self, store: &ContextStore) -> Result<NudgePerception, AgentError> {
        let acceptance = bounded("break history", self.history_timeout(), self.history.acceptance_stats())
            .await
            .unwrap_or_else(|e| {
                warn!("Break history unavailable: {e}");
                Vec::new()
            });
        let history = load_history(store).unwrap_or_else(|e| {
            warn!("Ignoring unreadable suggestion history: {e}");
            Vec::new()
        });
        let active = load_active(store).unwrap_or_else(|e| {
            warn!("Ignoring unreadable active suggestion: {e}");
            None
        });
        let last_break_type: Option<BreakType> = read(store, paths::SUGGESTIONS_LAST_BREAK_TYPE);

        Ok(NudgePerception {
            now: self.clock.now(),
            focus: read(store, paths::FOCUS_CURRENT),
            environment: read(store, paths::ENVIRONMENT_CURRENT),
            active,
            last_break_at: read(store, paths::SUGGESTIONS_LAST_BREAK_AT),
            previous_break: history.last().map(|r| r.break_type).or(last_break_type),
            session_started_at: read(store, paths::NUDGE_SESSION_STARTED_AT),
            rotation: read(store, paths::SUGGESTIONS_ROTATION).unwrap_or_default(),
            acceptance,
        })
    }

    fn reason(&mut self, p: NudgePerception) -> Result<NudgeDecision, AgentError> {
        let now_utc = p.now.with_timezone(&Utc);
        let start_session = p.session_started_at.is_none().then_some(now_utc);
        let since = p.last_break_at.or(p.session_started_at).unwrap_or(now_utc);
        let minutes_since_break = (now_utc - since).num_minutes();

        // Readings the monitor stopped refreshing no longer suppress anything.
        let max_age = chrono::Duration::seconds(self.config.focus_max_age_secs as i64);
        let focus = p.focus.filter(|f| {
            let fresh = now_utc - f.computed_at <= max_age;
            if !fresh {
                debug!(computed_at = %f.computed_at, "Ignoring stale focus reading");
            }
            fresh
        });

        let level = focus.as_ref().map(|f| f.level);
        let in_meeting = p.environment.as_ref().is_some_and(|e| e.in_meeting);
        let active = p.active;

        let (due, reason) = if minutes_since_break < self.config.work_session_minutes as i64 {
            (
                false,
                format!(
                    "{minutes_since_break} of {} work minutes elapsed",
                    self.config.work_session_minutes
                ),
            )
        } else if level.is_some_and(|l| l >= self.ceiling) {
            (false, format!("focus at or above {}", self.ceiling))
        } else if in_meeting {
            (false, "in a meeting".to_string())
        } else if let Some(active) = &active {
            (true, format!("suggestion {} already {}", active.id, active.status))
        } else {
            (true, format!("{minutes_since_break} minutes without a break"))
        };

        let request = (due && active.is_none()).then(|| SuggestionRequest {
            focus_level: level.unwrap_or(FocusLevel::Minimal),
            focus_mode: focus.as_ref().map(|f| f.mode).unwrap_or(FocusMode::Casual),
            time_of_day: p
                .environment
                .as_ref()
                .map(|e| e.time_of_day)
                .unwrap_or_else(|| TimeOfDay::from_hour(p.now.hour())),
            minutes_worked: minutes_since_break,
            in_meeting,
            minutes_to_next_meeting: p.environment.as_ref().and_then(|e| e.minutes_to_next_meeting),
            previous_break: p.previous_break,
            acceptance: p.acceptance,
        });

        debug!(due, %reason, "Nudge evaluated");
        Ok(NudgeDecision {
            state: NudgeState {
                due,
                reason,
                minutes_since_break,
                suggestion_id: active.map(|r| r.id),
                evaluated_at: now_utc,
            },
            start_session,
            request,
            rotation: p.rotation,
        })
    }

    async fn act(&mut self, store: &ContextStore, decision: NudgeDecision) -> Result<(), AgentError> {
        let NudgeDecision {
            mut state,
            start_session,
            request,
            mut rotation,
        } = decision;

        if let Some(at) = start_session {
            store.set(paths::NUDGE_SESSION_STARTED_AT, at, NAME)?;
        }

        if let Some(request) = request {
            let (break_type, message, source) =
                match bounded("suggestion engine", self.suggestion_timeout(), self.engine.suggest(&request)).await {
                    Ok(suggested) => (suggested.break_type, suggested.message, SuggestionSource::Engine),
                    Err(e) => {
                        warn!(engine = self.engine.name(), "Suggestion engine failed, using fallback: {e}");
                        let break_type = rotation.pick(request.previous_break);
                        store.set(paths::SUGGESTIONS_ROTATION, rotation, NAME)?;
                        (break_type, break_type.default_message().to_string(), SuggestionSource::Fallback)
                    }
                };

            let record = SuggestionRecord::pending(break_type, message, source, self.clock.now_utc());
            let candidate = serde_json::to_value(&record).map_err(crate::error::ContextError::from)?;
            let claimed = store.update(paths::SUGGESTIONS_ACTIVE, NAME, |current| {
                let occupied = current
                    .and_then(|v| serde_json::from_value::<SuggestionRecord>(v.clone()).ok())
                    .is_some_and(|r| r.status.is_active());
                (!occupied).then_some(candidate)
            })?;

            if claimed.is_some() {
                info!(id = %record.id, break_type = %record.break_type, source = ?record.source, "Break suggested");
                state.suggestion_id = Some(record.id);
            } else {
                debug!("Active suggestion slot taken, dropping new suggestion");
                state.reason = "suggestion slot already taken".into();
            }
        }

        store.set(paths::NUDGE_STATE, &state, NAME)?;
        Ok(())
    }
}
