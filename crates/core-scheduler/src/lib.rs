//! Scheduling policies and the decision models behind them.
//!
//! A scheduler observes the profiling iteration through the event store and,
//! at iteration boundaries, may publish a [`ScheduleEvents`] bundle for the
//! schedule executor to replay. The FIFO policy is the worked-out one;
//! `dependency` and `maxsize` are conforming placeholders kept selectable so
//! contexts written against them keep resolving.

pub mod fifo;
pub mod layout_model;
pub mod time_model;

pub use fifo::{FifoScheduler, TriggerMode};
pub use layout_model::{LayoutModel, DEFAULT_SMIN};
pub use time_model::{TimeModel, Timespan, TransferringModel};

use core_config::{Context, ContextError};
use core_events::{EventStore, MemoryEvent, ScheduleEvents};
use core_status::{MemoryInfo, MemoryStatus, StatusError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("dynamic library scheduler unsupported: {0}")]
    DynamicLibrary(String),
    #[error("synchronization label mismatch: expected {expected}, found {found}")]
    LabelMismatch { expected: String, found: String },
    #[error("tensor {0} exceeds device capacity; layout unplannable")]
    Unplannable(String),
    #[error("layout model not analyzed")]
    NotAnalyzed,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Contract every policy obeys: silent profiling at iteration 1, an optional
/// bundle afterwards, never a mid-iteration publication.
pub trait MemoryScheduler: Send + Sync {
    /// Device/host geometry, forwarded once the memory manager is known.
    fn set_memory_info(&self, _info: MemoryInfo) {}

    /// A memory event was recorded. Policies may accumulate state here.
    fn on_memory_event(&self, _event: &MemoryEvent) {}

    /// Explicit scheduling trigger between iterations.
    fn on_schedule(&self) {}

    /// An iteration boundary was crossed.
    fn on_new_iteration(&self) -> SchedulerResult<()>;

    /// The current decision, if one has been published.
    fn schedule_events(&self) -> Option<ScheduleEvents>;
}

/// Placeholder policy: profiles forever, never publishes. Used for the
/// `dependency` and `maxsize` context selections.
pub struct PassiveScheduler;

impl MemoryScheduler for PassiveScheduler {
    fn on_new_iteration(&self) -> SchedulerResult<()> {
        Ok(())
    }

    fn schedule_events(&self) -> Option<ScheduleEvents> {
        None
    }
}

/// Resolve the policy named by the context (`scheduler`, with
/// `scheduler.trigger_event` and optional `scheduler.smin` knobs).
pub fn make_scheduler(
    context: &Context,
    status: Arc<MemoryStatus>,
    events: Arc<EventStore>,
) -> SchedulerResult<Box<dyn MemoryScheduler>> {
    let trigger = match context.at("scheduler.trigger_event")? {
        "dependency" => TriggerMode::Dependency,
        "time" => TriggerMode::Time,
        _ => {
            return Err(SchedulerError::Context(ContextError::Invalid(
                "scheduler.trigger_event".to_string(),
            )))
        }
    };
    let smin = match context.get("scheduler.smin") {
        None => DEFAULT_SMIN,
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            SchedulerError::Context(ContextError::Invalid("scheduler.smin".to_string()))
        })?,
    };
    match context.at("scheduler")? {
        "fifo" => Ok(Box::new(FifoScheduler::new(status, events, trigger, smin))),
        "dependency" | "maxsize" => Ok(Box::new(PassiveScheduler)),
        other if other.starts_with("dylib://") => {
            Err(SchedulerError::DynamicLibrary(other.to_string()))
        }
        _ => Err(SchedulerError::Context(ContextError::Invalid(
            "scheduler".to_string(),
        ))),
    }
}
