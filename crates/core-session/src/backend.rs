//! The backend hub: event store, scheduler, and exporter wiring.
//!
//! The backend sits behind a handle resolved from the context's `path`
//! parameter. The integrated backend runs in-process; `dylib://` bindings
//! belong to the external plugin loader and are reported as unsupported
//! here. Everything the session emits funnels through `submit_event`, which
//! fans out to the store, the events exporter, and the scheduler in that
//! order.

use crate::{SessionError, SessionResult};
use core_config::{Context, PathScheme};
use core_events::{
    make_events_exporter, make_schedule_exporter, make_tensors_exporter, EventStore,
    EventsExporter, ExecutionEvent, MemoryEvent, ScheduleEvents, ScheduleExporter,
    TensorsExporter,
};
use core_scheduler::{make_scheduler, MemoryScheduler};
use core_status::{MemoryInfo, MemoryStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct BasicBackend {
    status: Arc<MemoryStatus>,
    events: Arc<EventStore>,
    scheduler: Box<dyn MemoryScheduler>,
    events_exporter: Box<dyn EventsExporter>,
    tensors_exporter: Box<dyn TensorsExporter>,
    schedule_exporter: Box<dyn ScheduleExporter>,
    inited: AtomicBool,
    started: AtomicBool,
}

impl BasicBackend {
    pub fn new(context: &Context, status: Arc<MemoryStatus>) -> SessionResult<Self> {
        let events = Arc::new(EventStore::new());
        let scheduler = make_scheduler(context, status.clone(), events.clone())?;
        let events_exporter = make_events_exporter(&context.view("exporters.events"))?;
        let tensors_exporter = make_tensors_exporter(&context.view("exporters.tensors"))?;
        let schedule_exporter = make_schedule_exporter(&context.view("exporters.schedule"))?;
        Ok(Self {
            status,
            events,
            scheduler,
            events_exporter,
            tensors_exporter,
            schedule_exporter,
            inited: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    fn ensure_inited(&self) -> SessionResult<()> {
        if !self.inited.load(Ordering::Acquire) {
            return Err(SessionError::Uninited);
        }
        Ok(())
    }

    fn ensure_started(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(SessionError::Uninited);
        }
        Ok(())
    }

    pub fn init(&self) -> SessionResult<()> {
        if self.inited.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Inited);
        }
        info!(target: "session.backend", "backend inited");
        Ok(())
    }

    /// Registration window check: after init, before start.
    pub fn ensure_registrable(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        if self.started.load(Ordering::Acquire) {
            return Err(SessionError::Inited);
        }
        Ok(())
    }

    pub fn start(&self) -> SessionResult<()> {
        self.ensure_registrable()?;
        self.started.store(true, Ordering::Release);
        self.tensors_exporter.on_tensors(&self.status);
        info!(target: "session.backend", "backend started");
        Ok(())
    }

    pub fn set_memory_info(&self, info: MemoryInfo) {
        self.scheduler.set_memory_info(info);
    }

    pub fn submit_event(&self, event: MemoryEvent) -> SessionResult<()> {
        self.ensure_started()?;
        self.events_exporter.on_memory_event(&event);
        self.scheduler.on_memory_event(&event);
        self.events.submit(event);
        Ok(())
    }

    pub fn submit_execution_event(&self, event: ExecutionEvent) -> SessionResult<()> {
        self.ensure_started()?;
        self.events_exporter.on_execution_event(&event);
        Ok(())
    }

    pub fn schedule_events(&self) -> Option<ScheduleEvents> {
        self.scheduler.schedule_events()
    }

    pub fn export_schedule(&self, bundle: &ScheduleEvents) {
        self.schedule_exporter.on_schedule_events(bundle);
    }

    pub fn iteration(&self) -> u32 {
        self.events.iteration()
    }

    /// Force the iteration counter (checkpoint-restore paths).
    pub fn set_iteration(&self, iteration: u32) -> SessionResult<()> {
        self.ensure_started()?;
        self.events.set_iteration(iteration)?;
        Ok(())
    }

    /// Advance the iteration marker and let the scheduler decide. Blocks
    /// until the scheduler has synchronized.
    pub fn new_iteration(&self) -> SessionResult<()> {
        self.ensure_started()?;
        let iteration = self.events.new_iteration();
        debug!(target: "session.backend", iteration, "new iteration");
        self.scheduler.on_new_iteration()?;
        Ok(())
    }

    pub fn half_iteration(&self) -> SessionResult<()> {
        self.ensure_started()
    }

    pub fn stop(&self) -> SessionResult<()> {
        self.ensure_started()?;
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    pub fn terminate(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        if self.started.load(Ordering::Acquire) {
            return Err(SessionError::Inited);
        }
        self.inited.store(false, Ordering::Release);
        info!(target: "session.backend", "backend terminated");
        Ok(())
    }
}

/// Handle over the backend binding selected by the context `path`.
pub enum BackendHandle {
    Integrated(BasicBackend),
}

impl BackendHandle {
    pub fn backend(&self) -> &BasicBackend {
        match self {
            BackendHandle::Integrated(backend) => backend,
        }
    }
}

pub fn make_backend_handle(
    context: &Context,
    status: Arc<MemoryStatus>,
) -> SessionResult<BackendHandle> {
    match context.signature()? {
        PathScheme::Integrated(_) => Ok(BackendHandle::Integrated(BasicBackend::new(
            context, status,
        )?)),
        PathScheme::Dylib(path) => Err(SessionError::DynamicLibrary(path)),
    }
}
