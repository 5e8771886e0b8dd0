//! The session layer: backend wiring, the per-iteration session API, and the
//! frontend handed to the DL framework.

pub mod backend;
pub mod frontend;
pub mod session;

pub use backend::{make_backend_handle, BackendHandle, BasicBackend};
pub use frontend::Frontend;
pub use session::{CallbackStage, MemorySession, Request};

use core_config::ContextError;
use core_events::{EventError, ExportError};
use core_layout::MemoryError;
use core_scheduler::SchedulerError;
use core_status::StatusError;

/// Session-level failures. Lifecycle and context faults abort init; status
/// and memory faults are fatal to the offending request with the session
/// still live; insufficience self-heals by swap before surfacing.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("frontend not initialized")]
    Uninited,
    #[error("frontend already initialized")]
    Inited,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Executor(#[from] core_executor::ExecutorError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("dynamic library backend unsupported: {0}")]
    DynamicLibrary(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
