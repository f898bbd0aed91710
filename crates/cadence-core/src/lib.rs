pub mod agent;
pub mod clock;
pub mod collaborators;
pub mod context;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod suggestion;

#[cfg(test)]
mod testing;

// Re-export key types
pub use agent::{Agent, PipelineStage, ResponseHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{BackupStore, ContextStore};
pub use error::{AgentError, CollaboratorError, ContextError, SchedulerError, SuggestionError};
pub use runtime::{Collaborators, ResponseOutcome, Runtime};
pub use scheduler::{CycleRecord, RunSummary, SchedulerAgent, SchedulerHandle};
pub use suggestion::{BreakType, SuggestionRecord, SuggestionStatus};
