pub mod delivery;
pub mod environment;
pub mod focus;
pub mod nudge;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use delivery::{DeliveryAgent, ResponseHandle};
pub use environment::{ContextAgent, EnvironmentSnapshot, TimeOfDay};
pub use focus::{FocusLevel, FocusMode, FocusMonitorAgent, FocusState};
pub use nudge::NudgeAgent;

use crate::context::ContextStore;
use crate::error::{AgentError, CollaboratorError};

/// One participant in the perceive → reason → act pipeline.
///
/// Each phase gets the shared store; `perceive` gathers inputs (store reads
/// and collaborator calls), `reason` is pure, `act` writes results back.
#[async_trait]
pub trait Agent: Send {
    type Perception: Send;
    type Decision: Send;

    fn name(&self) -> &str;

    async fn perceive(&mut self, store: &ContextStore) -> Result<Self::Perception, AgentError>;

    fn reason(&mut self, perception: Self::Perception) -> Result<Self::Decision, AgentError>;

    async fn act(&mut self, store: &ContextStore, decision: Self::Decision) -> Result<(), AgentError>;
}

/// Object-safe view of an [`Agent`] the scheduler can hold in a list.
#[async_trait]
pub trait PipelineStage: Send {
    fn name(&self) -> &str;

    async fn step(&mut self, store: &ContextStore) -> Result<(), AgentError>;
}

#[async_trait]
impl<A: Agent> PipelineStage for A {
    fn name(&self) -> &str {
        Agent::name(self)
    }

    async fn step(&mut self, store: &ContextStore) -> Result<(), AgentError> {
        let perception = self.perceive(store).await?;
        let decision = self.reason(perception)?;
        self.act(store, decision).await
    }
}

/// Bound a collaborator call, folding an elapsed timer into `CollaboratorError::Timeout`.
pub(crate) async fn bounded<T, F>(
    collaborator: &'static str,
    after: Duration,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            collaborator,
            after,
        }),
    }
}
