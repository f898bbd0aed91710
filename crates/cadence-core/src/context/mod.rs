//! Shared, path-addressed state for the agent pipeline.

pub mod backup;
pub mod inbox;
mod notify;
pub mod path;
pub mod store;

pub use backup::{Backup, BackupInfo, BackupStore};
pub use inbox::{QueuedResponse, ResponseInbox};
pub use notify::{ContextEvent, SubscriptionId};
pub use path::{ContextPath, PathPattern};
pub use store::{ContextEntry, ContextStore, Snapshot};

/// Reserved paths written by the pipeline.
pub mod paths {
    pub const FOCUS_CURRENT: &str = "focus.current";
    pub const FOCUS_METRICS: &str = "focus.metrics";
    pub const FOCUS_PROFILE: &str = "focus.profile";
    pub const ENVIRONMENT_CURRENT: &str = "environment.current";
    pub const SUGGESTIONS_ACTIVE: &str = "suggestions.active";
    pub const SUGGESTIONS_HISTORY: &str = "suggestions.history";
    pub const SUGGESTIONS_LAST_BREAK_AT: &str = "suggestions.last_break_at";
    pub const SUGGESTIONS_LAST_BREAK_TYPE: &str = "suggestions.last_break_type";
    pub const SUGGESTIONS_ROTATION: &str = "suggestions.rotation";
    pub const NUDGE_STATE: &str = "nudge.state";
    pub const NUDGE_SESSION_STARTED_AT: &str = "nudge.session_started_at";
    pub const DELIVERY_STATE: &str = "delivery.state";
    pub const SCHEDULER_LAST_CYCLE: &str = "scheduler.last_cycle";
    pub const SCHEDULER_HISTORY: &str = "scheduler.history";
    pub const SCHEDULER_STATE: &str = "scheduler.state";
}
