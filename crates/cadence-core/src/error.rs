//! Error types for the context store, agents and scheduler.

use std::time::Duration;

/// Errors raised by the shared context store and its persistence.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Malformed context path. Always a caller bug.
    #[error("invalid context path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Nothing stored at (or under) the path.
    #[error("context path not found: {0}")]
    NotFound(String),

    /// A persisted snapshot or backup could not be trusted.
    #[error("state corruption in {source_name}: {detail}")]
    StateCorruption { source_name: String, detail: String },

    /// The store lock was poisoned by a panicking writer.
    #[error("context lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of an external collaborator (calendar, suggestion engine,
/// notification sink, activity source, break history).
///
/// Always handled at the agent boundary with a fallback.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {detail}")]
    Unavailable {
        collaborator: &'static str,
        detail: String,
    },

    #[error("{collaborator} timed out after {after:?}")]
    Timeout {
        collaborator: &'static str,
        after: Duration,
    },

    #[error("{collaborator} rejected the request: {detail}")]
    Rejected {
        collaborator: &'static str,
        detail: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(collaborator: &'static str, detail: impl ToString) -> Self {
        Self::Unavailable {
            collaborator,
            detail: detail.to_string(),
        }
    }
}

/// Unhandled failure inside an agent's perceive/reason/act.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{agent}: {detail}")]
    Execution { agent: String, detail: String },

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl AgentError {
    pub fn execution(agent: &str, detail: impl ToString) -> Self {
        Self::Execution {
            agent: agent.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Errors from the suggestion response path.
#[derive(Debug, thiserror::Error)]
pub enum SuggestionError {
    #[error("no active suggestion with id {0}")]
    NotFound(String),

    #[error("suggestion {id} is {status}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        status: String,
        target: String,
    },

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Errors that stop the scheduler from running at all.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}
