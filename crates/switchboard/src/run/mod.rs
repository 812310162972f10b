//! Agent runs: coordination, queue policy, stream processing.

pub mod chunker;
mod coordinator;
mod events;
mod queue;
mod runner;
mod subscriber;

pub use coordinator::{
    DeliverTarget, RunCoordinator, RunHandle, RunOptions, RunSummary, Submission,
};
pub use events::{AgentEvent, RunRequest, RunnerInput, sanitize_tool_result};
pub use queue::{RunInput, SessionQueues, SubmitOutcome};
pub use runner::{
    AgentEventStream, AgentRunner, RunnerError, RunningAgent, SubprocessRunner, event_stream,
};
pub use subscriber::{EventSubscriber, ReplyEvent, RunOutcome, RunState};
