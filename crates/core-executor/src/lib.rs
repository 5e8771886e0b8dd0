//! Memory operation execution: the memory-manager interface, the per-tensor
//! operation executor, transient-block defragmentation, and the schedule
//! replay worker.

pub mod defrag;
pub mod manager;
pub mod operation;
pub mod schedule;

pub use defrag::MemoryDefragmentationExecutor;
pub use manager::MemoryManager;
pub use operation::{ExecutorError, ExecutorResult, MemoryOperationExecutor};
pub use schedule::{CallbackRegistry, ScheduleExecutor, TriggerMode};
