//! The frontend: construction-time wiring and the registration surface.
//!
//! The DL framework holds exactly one `Frontend`. Construction resolves the
//! backend binding from the context; `set_memory_manager` supplies the
//! device geometry and brings up the layout, the schedule executor, and the
//! session; `init` → register → `start` fences the registration window; the
//! session then carries all per-iteration traffic.

use crate::backend::{make_backend_handle, BackendHandle};
use crate::session::MemorySession;
use crate::{SessionError, SessionResult};
use core_config::{Context, ContextError};
use core_executor::{CallbackRegistry, MemoryManager, ScheduleExecutor, TriggerMode};
use core_layout::MemoryLayout;
use core_status::{MemoryStatus, Operator, Tensor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub struct Frontend {
    context: Context,
    status: Arc<MemoryStatus>,
    backend: Arc<BackendHandle>,
    callbacks: Arc<CallbackRegistry>,
    manager: OnceLock<Arc<dyn MemoryManager>>,
    session: OnceLock<MemorySession>,
    inited: AtomicBool,
}

impl Frontend {
    pub fn new(context: Context) -> SessionResult<Self> {
        let status = Arc::new(MemoryStatus::new());
        let backend = Arc::new(make_backend_handle(&context, status.clone())?);
        Ok(Self {
            context,
            status,
            backend,
            callbacks: Arc::new(CallbackRegistry::default()),
            manager: OnceLock::new(),
            session: OnceLock::new(),
            inited: AtomicBool::new(false),
        })
    }

    /// Wire the memory manager in and bring up the executor and session.
    /// Must precede `init`.
    pub fn set_memory_manager(&self, manager: Arc<dyn MemoryManager>) -> SessionResult<()> {
        if self.inited.load(Ordering::Acquire) {
            return Err(SessionError::Inited);
        }
        if self.manager.set(manager.clone()).is_err() {
            return Err(SessionError::Inited);
        }
        let info = manager.memory_info();
        self.backend.backend().set_memory_info(info.clone());

        let layout = Arc::new(MemoryLayout::new(&info));
        let trigger = match self.context.at("scheduler.trigger_event")? {
            "time" => TriggerMode::Time,
            "dependency" => TriggerMode::Dependency,
            _ => {
                return Err(SessionError::Context(ContextError::Invalid(
                    "scheduler.trigger_event".to_string(),
                )))
            }
        };
        let executor = Arc::new(ScheduleExecutor::new(
            self.status.clone(),
            layout.clone(),
            manager.clone(),
            trigger,
            self.callbacks.clone(),
        ));
        let session = MemorySession::new(
            self.status.clone(),
            layout,
            manager,
            self.backend.clone(),
            executor,
            self.callbacks.clone(),
        );
        if self.session.set(session).is_err() {
            return Err(SessionError::Inited);
        }
        debug!(target: "session.frontend", "memory manager attached");
        Ok(())
    }

    pub fn init(&self) -> SessionResult<()> {
        if self.manager.get().is_none() {
            return Err(SessionError::Uninited);
        }
        if self.inited.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Inited);
        }
        self.backend.backend().init()?;
        info!(target: "session.frontend", "frontend inited");
        Ok(())
    }

    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    pub fn register_tensor(&self, tensor: Tensor) -> SessionResult<()> {
        self.backend.backend().ensure_registrable()?;
        debug!(target: "session.frontend", tensor = tensor.name(), "registering tensor");
        self.status.register_tensor(tensor)?;
        Ok(())
    }

    pub fn register_operator(&self, operator: Operator) -> SessionResult<()> {
        self.backend.backend().ensure_registrable()?;
        debug!(target: "session.frontend", operator = operator.name(), "registering operator");
        self.status.register_operator(operator)?;
        Ok(())
    }

    pub fn set_entry(&self, op: &str) -> SessionResult<()> {
        self.backend.backend().ensure_registrable()?;
        self.status.set_entry(op)?;
        Ok(())
    }

    pub fn unregister_tensor(&self, tensor: &str) -> SessionResult<()> {
        self.backend.backend().ensure_registrable()?;
        self.status.unregister_tensor(tensor)?;
        Ok(())
    }

    pub fn unregister_operator(&self, op: &str) -> SessionResult<()> {
        self.backend.backend().ensure_registrable()?;
        self.status.unregister_operator(op)?;
        Ok(())
    }

    /// Close the registration window and start the run.
    pub fn start(&self) -> SessionResult<()> {
        self.backend.backend().start()?;
        self.status.start();
        let session = self.session.get().ok_or(SessionError::Uninited)?;
        session.init()?;
        info!(target: "session.frontend", "run started");
        Ok(())
    }

    pub fn session(&self) -> SessionResult<&MemorySession> {
        let session = self.session.get().ok_or(SessionError::Uninited)?;
        if !session.is_inited() {
            return Err(SessionError::Uninited);
        }
        Ok(session)
    }

    /// The scheduler's current decision, if one has been published.
    pub fn schedule_events(&self) -> Option<core_events::ScheduleEvents> {
        self.backend.backend().schedule_events()
    }

    /// Pull the scheduler's current decision and hand it to the executor.
    /// The session's iteration boundary does this automatically; the
    /// explicit form exists for front-ends driving the schedule manually.
    pub fn update_schedule(&self) -> SessionResult<()> {
        let session = self.session()?;
        if let Some(bundle) = self.backend.backend().schedule_events() {
            session.adopt_schedule(bundle)?;
            debug!(target: "session.frontend", "schedule updated");
        }
        Ok(())
    }

    pub fn terminate(&self) -> SessionResult<()> {
        if !self.inited.swap(false, Ordering::AcqRel) {
            return Err(SessionError::Uninited);
        }
        if let Some(session) = self.session.get() {
            if session.is_inited() {
                session.terminate()?;
            }
        }
        let backend = self.backend.backend();
        backend.stop()?;
        backend.terminate()?;
        self.status.clear();
        info!(target: "session.frontend", "frontend terminated");
        Ok(())
    }
}
