use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_config::DeliveryConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{bounded, Agent};
use crate::clock::Clock;
use crate::collaborators::{BreakHistory, BreakOutcome, Notification, NotificationSink};
use crate::context::{paths, ContextStore, ResponseInbox};
use crate::error::{AgentError, SuggestionError};
use crate::suggestion::{
    load_active, load_history, transition_active, SuggestionRecord, SuggestionStatus, Transition,
};

pub const NAME: &str = "delivery";

const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery bookkeeping, stored at `delivery.state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryState {
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_delivered_id: Option<String>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

pub struct DeliveryPerception {
    now: DateTime<Utc>,
    active: Option<SuggestionRecord>,
}

pub enum DeliveryDecision {
    Idle,
    Expire(SuggestionRecord),
    Deliver(SuggestionRecord),
    /// Delivered and still inside its expiry window.
    AwaitResponse(SuggestionRecord),
}

/// Shows pending suggestions to the user and expires stale ones.
pub struct DeliveryAgent {
    config: DeliveryConfig,
    history_limit: usize,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    inbox: Option<(ResponseInbox, Responder)>,
}

impl DeliveryAgent {
    pub fn new(
        config: DeliveryConfig,
        history_limit: usize,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            history_limit,
            sink,
            clock,
            inbox: None,
        }
    }

    /// Apply responses queued in `inbox` at the start of every step.
    pub fn with_inbox(mut self, inbox: ResponseInbox, responses: &ResponseHandle) -> Self {
        self.inbox = Some((inbox, responses.responder.clone()));
        self
    }

    async fn drain_inbox(&self, store: &ContextStore) {
        let Some((inbox, responder)) = &self.inbox else {
            return;
        };
        let queued = match inbox.take() {
            Ok(queued) => queued,
            Err(e) => {
                warn!(dir = %inbox.dir().display(), "Could not read response inbox: {e}");
                return;
            }
        };
        for response in queued {
            let id = &response.suggestion_id;
            match responder.apply(store, id, response.accepted, response.submitted_at).await {
                Ok(record) => info!(id = %record.id, status = %record.status, "Queued response applied"),
                Err(e) => warn!(id = %id, "Queued response rejected: {e}"),
            }
        }
    }

    fn update_state(
        &self,
        store: &ContextStore,
        f: impl FnOnce(&mut DeliveryState),
    ) -> Result<(), AgentError> {
        store.update(paths::DELIVERY_STATE, NAME, |current| {
            let mut state: DeliveryState = current
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            f(&mut state);
            serde_json::to_value(&state).ok()
        })?;
        Ok(())
    }

    async fn deliver(&self, store: &ContextStore, record: SuggestionRecord) -> Result<(), AgentError> {
        let notification = Notification {
            suggestion_id: record.id.clone(),
            break_type: record.break_type,
            title: record.break_type.title().to_string(),
            message: record.message.clone(),
        };
        let timeout = Duration::from_secs(self.config.delivery_timeout_secs);

        match bounded("notification sink", timeout, self.sink.deliver(&notification)).await {
            Ok(ack) => {
                let delivered_at = self.clock.now_utc();
                let outcome = transition_active(store, NAME, &record.id, self.history_limit, |current| {
                    (current.status == SuggestionStatus::Pending).then(|| {
                        let mut next = current.clone();
                        next.status = SuggestionStatus::Delivered;
                        next.delivered_at = Some(delivered_at);
                        next
                    })
                })?;
                match outcome {
                    Transition::Applied(_) => {
                        info!(id = %record.id, channel = %ack.channel, "Suggestion delivered");
                        self.update_state(store, |s| {
                            s.consecutive_failures = 0;
                            s.last_delivered_id = Some(record.id.clone());
                            s.last_delivered_at = Some(delivered_at);
                        })?;
                    }
                    _ => debug!(id = %record.id, "Suggestion changed during delivery, ack ignored"),
                }
            }
            Err(e) => {
                warn!(id = %record.id, "Delivery failed, will retry next cycle: {e}");
                self.update_state(store, |s| {
                    s.failures += 1;
                    s.consecutive_failures += 1;
                    s.last_error = Some(e.to_string());
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for DeliveryAgent {
    type Perception = DeliveryPerception;
    type Decision = DeliveryDecision;

    fn name(&self) -> &str {
        NAME
    }

    async fn perceive(&mut self, store: &ContextStore) -> Result<DeliveryPerception, AgentError> {
        // Answers given from another process land before the active record is read.
        self.drain_inbox(store).await;
        Ok(DeliveryPerception {
            now: self.clock.now_utc(),
            active: load_active(store)?,
        })
    }

    fn reason(&mut self, p: DeliveryPerception) -> Result<DeliveryDecision, AgentError> {
        let Some(record) = p.active else {
            return Ok(DeliveryDecision::Idle);
        };
        let window = chrono::Duration::minutes(self.config.expiry_minutes as i64);
        let decision = if p.now - record.expiry_anchor() >= window {
            DeliveryDecision::Expire(record)
        } else if record.status == SuggestionStatus::Pending {
            DeliveryDecision::Deliver(record)
        } else {
            DeliveryDecision::AwaitResponse(record)
        };
        Ok(decision)
    }

    async fn act(&mut self, store: &ContextStore, decision: DeliveryDecision) -> Result<(), AgentError> {
        match decision {
            DeliveryDecision::Idle => {}
            DeliveryDecision::AwaitResponse(record) => {
                debug!(id = %record.id, "Awaiting response");
            }
            DeliveryDecision::Expire(record) => {
                let now = self.clock.now_utc();
                let outcome = transition_active(store, NAME, &record.id, self.history_limit, |current| {
                    let mut next = current.clone();
                    next.status = SuggestionStatus::Expired;
                    next.responded_at = Some(now);
                    Some(next)
                })?;
                if let Transition::Applied(_) = outcome {
                    info!(id = %record.id, break_type = %record.break_type, "Suggestion expired");
                }
            }
            DeliveryDecision::Deliver(record) => self.deliver(store, record).await?,
        }
        Ok(())
    }
}

/// Applies a user's answer to the active suggestion.
#[derive(Clone)]
struct Responder {
    history: Arc<dyn BreakHistory>,
    history_limit: usize,
    history_timeout: Duration,
}

impl Responder {
    async fn apply(
        &self,
        store: &ContextStore,
        id: &str,
        accepted: bool,
        at: DateTime<Utc>,
    ) -> Result<SuggestionRecord, SuggestionError> {
        let target = if accepted {
            SuggestionStatus::Accepted
        } else {
            SuggestionStatus::Ignored
        };

        let outcome = transition_active(store, "response", id, self.history_limit, |current| {
            let mut next = current.clone();
            next.status = target;
            next.responded_at = Some(at);
            Some(next)
        })?;

        let record = match outcome {
            Transition::Applied(record) => record,
            Transition::Declined(_) | Transition::Missing => {
                let finished = load_history(store)?.into_iter().rev().find(|r| r.id == id);
                return Err(match finished {
                    Some(finished) => SuggestionError::InvalidTransition {
                        id: id.to_string(),
                        status: finished.status.to_string(),
                        target: target.to_string(),
                    },
                    None => SuggestionError::NotFound(id.to_string()),
                });
            }
        };

        store.set(paths::SUGGESTIONS_LAST_BREAK_AT, at, "response")?;
        store.set(paths::SUGGESTIONS_LAST_BREAK_TYPE, record.break_type, "response")?;

        let outcome = BreakOutcome {
            suggestion_id: record.id.clone(),
            break_type: record.break_type,
            source: record.source,
            accepted,
            responded_at: at,
        };
        if let Err(e) = bounded("break history", self.history_timeout, self.history.append(&outcome)).await {
            warn!(id = %record.id, "Failed to record break outcome: {e}");
        }
        info!(id = %record.id, status = %record.status, "Suggestion answered");
        Ok(record)
    }
}

/// Records the user's answer to a suggestion. Cheap to clone; usable from
/// any task while the scheduler runs.
#[derive(Clone)]
pub struct ResponseHandle {
    store: Arc<ContextStore>,
    clock: Arc<dyn Clock>,
    responder: Responder,
}

impl ResponseHandle {
    pub fn new(
        store: Arc<ContextStore>,
        history: Arc<dyn BreakHistory>,
        clock: Arc<dyn Clock>,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            clock,
            responder: Responder {
                history,
                history_limit,
                history_timeout: DEFAULT_HISTORY_TIMEOUT,
            },
        }
    }

    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.responder.history_timeout = timeout;
        self
    }

    /// Mark suggestion `id` accepted or ignored and archive it.
    pub async fn record_response(&self, id: &str, accepted: bool) -> Result<SuggestionRecord, SuggestionError> {
        let now = self.clock.now_utc();
        self.responder.apply(&self.store, id, accepted, now).await
    }
}
