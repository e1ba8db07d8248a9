/// Operations callers invoke on a world: publication, the generation queue,
/// one-shot generation and the worker loop that drives the queue.

pub mod engine;
pub mod oneshot;
pub mod publication;
pub mod snapshot;
pub mod worker;
pub mod workflow;

pub use engine::{WorldEngine, WorldEngineBuilder};
pub use publication::PublicationAnalysis;
pub use snapshot::{GenerationSnapshot, JobSnapshot};
pub use worker::{Worker, WorkerStats};
pub use workflow::QueueOutcome;
