//! Event records, the per-iteration event store, and exporter sinks.
//!
//! Memory events flow from the session into the store and out to the
//! exporters; the scheduler replays them through the store's query
//! sub-language at iteration boundaries. Schedule events travel the other
//! way: computed by the scheduler, bundled with the planner's memory map,
//! replayed by the schedule executor.

pub mod event;
pub mod export;
pub mod schedule;
pub mod store;

pub use event::{
    timestamp_now_us, ExecutionEvent, ExecutionEventKind, MemoryEvent, MemoryEventKind, Stage,
};
pub use export::{
    make_events_exporter, make_schedule_exporter, make_tensors_exporter, EmptyEventsExporter,
    EmptyScheduleExporter, EmptyTensorsExporter, EventsExporter, ExportError, ExportMethod,
    JsonEventsExporter, JsonScheduleExporter, JsonTensorsExporter, ScheduleExporter,
    TensorsExporter,
};
pub use schedule::{ScheduleEvent, ScheduleEventKind, ScheduleEvents, StageScheduleEvents};
pub use store::{EventQuery, EventSet, EventStore};

/// Event-store failures.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("iteration marker conflict: iteration {0} already recorded")]
    Conflict(u32),
}

pub type EventResult<T> = Result<T, EventError>;
