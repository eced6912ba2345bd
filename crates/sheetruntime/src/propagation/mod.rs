//! Schema propagation from source nodes to the nodes they feed.

mod cooldown;
mod queue;
mod task;

pub use cooldown::Cooldown;
pub use queue::{PropagationQueue, StepOutcome};
pub use task::{EnqueueOutcome, PropagationKey, PropagationTask, TaskId, TaskStatus};
