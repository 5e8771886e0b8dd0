//! The per-iteration session API and the scoped operator request.
//!
//! A [`MemorySession`] is the framework's runtime surface: allocate and free
//! tensor memory, open a [`Request`] around one operator execution, cross
//! iteration boundaries. A request holds the operator's exclusive presenter
//! for its whole scope and drops every presenter on release, whatever the
//! exit path.
//!
//! Ordering: events emitted here are in the store before the emitting call
//! returns, and the schedule executor is notified of an operator only on
//! `release`, so dependency-anchored schedule events fire strictly after the
//! operator's critical section.

use crate::backend::BackendHandle;
use crate::{SessionError, SessionResult};
use core_events::{
    ExecutionEvent, ExecutionEventKind, MemoryEvent, MemoryEventKind, ScheduleEvents, Stage,
};
use core_executor::{
    CallbackRegistry, ExecutorError, MemoryManager, MemoryOperationExecutor, ScheduleExecutor,
};
use core_layout::{MemoryError, MemoryLayout};
use core_status::{MemoryStatus, OperatorPres, SectionStatus};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Framework callback points around scheduled swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStage {
    PostSwapIn,
    PostSwapOut,
}

const ALLOCATE_RETRIES: usize = 2;

pub struct MemorySession {
    status: Arc<MemoryStatus>,
    layout: Arc<MemoryLayout>,
    backend: Arc<BackendHandle>,
    executor: Arc<ScheduleExecutor>,
    operations: MemoryOperationExecutor,
    callbacks: Arc<CallbackRegistry>,
    stage: AtomicU8,
    inited: AtomicBool,
}

impl MemorySession {
    pub(crate) fn new(
        status: Arc<MemoryStatus>,
        layout: Arc<MemoryLayout>,
        manager: Arc<dyn MemoryManager>,
        backend: Arc<BackendHandle>,
        executor: Arc<ScheduleExecutor>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let operations = MemoryOperationExecutor::new(layout.clone(), manager);
        Self {
            status,
            layout,
            backend,
            executor,
            operations,
            callbacks,
            stage: AtomicU8::new(0),
            inited: AtomicBool::new(false),
        }
    }

    pub(crate) fn init(&self) -> SessionResult<()> {
        if self.inited.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Inited);
        }
        Ok(())
    }

    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    fn ensure_inited(&self) -> SessionResult<()> {
        if self.is_inited() {
            Ok(())
        } else {
            Err(SessionError::Uninited)
        }
    }

    pub fn stage(&self) -> Stage {
        if self.stage.load(Ordering::Acquire) == 1 {
            Stage::Backward
        } else {
            Stage::Forward
        }
    }

    fn emit(&self, op: &str, tensor: &str, size: usize, kind: MemoryEventKind) -> SessionResult<()> {
        self.backend
            .backend()
            .submit_event(MemoryEvent::new(op, tensor, size, kind, self.stage()))
    }

    /// Record the emergency evictions `wait_memory` performed so the next
    /// scheduling decision can account for them.
    fn emit_evictions(&self, op: &str, evicted: &[(String, usize)]) {
        for (tensor, size) in evicted {
            if let Err(error) = self.emit(op, tensor, *size, MemoryEventKind::Swapout) {
                warn!(target: "session", %error, "eviction event dropped");
            }
        }
    }

    // ---- memory entry points -------------------------------------------

    /// Allocate device memory for `tensor`, retrying through emergency
    /// eviction on insufficience. Returns the device base address.
    pub fn allocate_memory(&self, op: &str, tensor: &str) -> SessionResult<usize> {
        self.ensure_inited()?;
        let mut pres = self.status.reference_tensor(tensor)?;
        if !pres.is_unlocated() {
            return Err(SessionError::Status(core_status::StatusError::TensorInvalid(
                format!("tensor {tensor} already holds memory"),
            )));
        }
        let size = pres.size();

        let mut attempt = 0;
        loop {
            match self.operations.allocate(&mut pres) {
                Ok(()) => break,
                Err(ExecutorError::Memory(MemoryError::DeviceInsufficient(_)))
                    if attempt < ALLOCATE_RETRIES =>
                {
                    attempt += 1;
                    if attempt == ALLOCATE_RETRIES {
                        let evicted = self.executor.wait_memory(size)?;
                        self.emit_evictions(op, &evicted);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
        let address = pres.first_section().device_address.unwrap_or_default();
        drop(pres);

        self.emit(op, tensor, size, MemoryEventKind::Allocate)?;
        debug!(target: "session", op, tensor, address, "memory allocated");
        Ok(address)
    }

    /// Free the tensor everywhere it resides.
    pub fn free_memory(&self, op: &str, tensor: &str) -> SessionResult<()> {
        self.ensure_inited()?;
        let mut pres = self.status.reference_tensor(tensor)?;
        if pres.is_unlocated() {
            return Err(SessionError::Status(core_status::StatusError::TensorInvalid(
                format!("tensor {tensor} holds no memory"),
            )));
        }
        let size = pres.size();
        self.operations.free(&mut pres, size)?;
        drop(pres);
        self.emit(op, tensor, size, MemoryEventKind::Free)
    }

    /// Emergency eviction entry point for framework-side allocators.
    pub fn wait_memory(&self, size: usize) -> SessionResult<()> {
        self.ensure_inited()?;
        let evicted = self.executor.wait_memory(size)?;
        self.emit_evictions("", &evicted);
        Ok(())
    }

    pub fn emit_event(
        &self,
        op: &str,
        tensor: &str,
        size: usize,
        kind: MemoryEventKind,
    ) -> SessionResult<()> {
        self.ensure_inited()?;
        self.emit(op, tensor, size, kind)
    }

    pub fn set_callback(
        &self,
        stage: CallbackStage,
        callback: Box<dyn Fn(&str, usize) + Send + Sync>,
    ) {
        match stage {
            CallbackStage::PostSwapIn => self.callbacks.set_post_swap_in(callback),
            CallbackStage::PostSwapOut => self.callbacks.set_post_swap_out(callback),
        }
    }

    // ---- iteration boundaries ------------------------------------------

    /// Close the running iteration: record the boundary, let the scheduler
    /// decide, adopt any new bundle, and rearm the executor. Synchronous.
    pub fn new_iteration(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        self.backend.backend().new_iteration()?;
        if let Some(bundle) = self.backend.backend().schedule_events() {
            self.adopt_schedule(bundle)?;
        }
        self.executor.new_iteration();
        self.stage.store(0, Ordering::Release);
        info!(target: "session", iteration = self.backend.backend().iteration(), "iteration started");
        Ok(())
    }

    /// Forward → backward transition.
    pub fn half_iteration(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        self.backend.backend().half_iteration()?;
        self.stage.store(1, Ordering::Release);
        self.executor.half_iteration();
        Ok(())
    }

    /// Stage a bundle on the executor and mirror its memory map onto the
    /// dormant tensors (section plans and fragment sizes).
    pub(crate) fn adopt_schedule(&self, bundle: ScheduleEvents) -> SessionResult<()> {
        for region in bundle.memory_map.regions_sorted() {
            let Ok(mut pres) = self.status.reference_tensor(&region.name) else {
                continue;
            };
            if !pres.is_unlocated() {
                continue;
            }
            // Section plans only make sense when the manager can address
            // sections; a single-section back end swaps whole tensors.
            if region.sections.len() > 1 && self.operations.is_sectioned() {
                if let Err(error) = pres.apply_section_plan(&region.sections) {
                    warn!(
                        target: "session",
                        tensor = region.name.as_str(),
                        %error,
                        "section plan rejected"
                    );
                    continue;
                }
            }
            pres.set_fragment_size(region.fragment_size);
        }
        self.backend.backend().export_schedule(&bundle);
        self.executor.update_schedule(bundle);
        Ok(())
    }

    // ---- requests ------------------------------------------------------

    /// Open a scoped access ticket for one operator execution.
    pub fn create_request(&self, op: &str) -> SessionResult<Request<'_>> {
        self.ensure_inited()?;
        let pres = self.status.reference_operator(op)?;
        self.backend
            .backend()
            .submit_execution_event(ExecutionEvent::new(
                op,
                ExecutionEventKind::Request,
                self.stage(),
            ))?;
        Ok(Request {
            session: self,
            op: op.to_string(),
            pres: Some(pres),
            released: false,
        })
    }

    pub(crate) fn terminate(&self) -> SessionResult<()> {
        self.ensure_inited()?;
        self.inited.store(false, Ordering::Release);
        self.executor.terminate()?;
        Ok(())
    }
}

/// A scoped access ticket for one operator execution. Holds the operator's
/// exclusive presenter; dropping the request releases it.
pub struct Request<'a> {
    session: &'a MemorySession,
    op: String,
    pres: Option<OperatorPres>,
    released: bool,
}

impl<'a> Request<'a> {
    pub fn operator(&self) -> &str {
        &self.op
    }

    /// Block until every section of `tensor` is on device, issuing copy-ins
    /// (and emergency evictions) as needed.
    pub fn wait_tensor(&mut self, tensor: &str) -> SessionResult<()> {
        let mut attempts = 0;
        loop {
            let mut pres = self.session.status.reference_tensor(tensor)?;
            if pres.is_device_all_located() {
                drop(pres);
                return self
                    .session
                    .emit(&self.op, tensor, 0, MemoryEventKind::Access);
            }
            let absent: usize = pres
                .sections()
                .iter()
                .filter(|s| !s.on_device())
                .map(|s| s.size)
                .sum();
            let swapped_in = pres
                .sections()
                .iter()
                .any(|s| s.status == SectionStatus::Host);
            let size = pres.size();
            match self.session.operations.swap_in(&mut pres, size) {
                Ok(()) => {
                    let address = pres.first_section().device_address.unwrap_or_default();
                    drop(pres);
                    if swapped_in {
                        self.session
                            .emit(&self.op, tensor, size, MemoryEventKind::Swapin)?;
                        self.session.callbacks.fire_swap_in(tensor, address);
                    }
                }
                Err(ExecutorError::Memory(MemoryError::DeviceInsufficient(_)))
                    if attempts < ALLOCATE_RETRIES =>
                {
                    attempts += 1;
                    drop(pres);
                    let evicted = self.session.executor.wait_memory(absent)?;
                    self.session.emit_evictions(&self.op, &evicted);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Record a framework-side device allocation.
    pub fn set_memory_data_allocated(&mut self, tensor: &str, address: usize) -> SessionResult<()> {
        let mut pres = self.session.status.reference_tensor(tensor)?;
        self.session
            .layout
            .record_alloc(address, pres.size(), tensor)?;
        for section in pres.sections() {
            pres.set_copied_in(section.offset, address + section.offset)?;
        }
        let mut offset = pres.first_section().offset;
        while pres.is_mergeable(offset) {
            offset = pres.merge(offset)?;
        }
        let size = pres.size();
        drop(pres);
        self.session
            .emit(&self.op, tensor, size, MemoryEventKind::Allocate)
    }

    /// `empty → device`: the framework wrote the tensor.
    pub fn set_memory_data_assigned(&mut self, tensor: &str) -> SessionResult<()> {
        let mut pres = self.session.status.reference_tensor(tensor)?;
        pres.set_assigned()?;
        let size = pres.size();
        drop(pres);
        self.session
            .emit(&self.op, tensor, size, MemoryEventKind::Write)
    }

    /// Reaffirm device residence for a read.
    pub fn set_memory_data_acquired(&mut self, tensor: &str) -> SessionResult<()> {
        let pres = self.session.status.reference_tensor(tensor)?;
        pres.set_acquired()?;
        let size = pres.size();
        drop(pres);
        self.session
            .emit(&self.op, tensor, size, MemoryEventKind::Read)
    }

    /// Release the tensor's memory after this operator's use.
    pub fn set_memory_data_freed(&mut self, tensor: &str) -> SessionResult<()> {
        let mut pres = self.session.status.reference_tensor(tensor)?;
        let size = pres.size();
        self.session.operations.free(&mut pres, size)?;
        drop(pres);
        self.session
            .emit(&self.op, tensor, size, MemoryEventKind::Free)
    }

    /// Mark the start of the operator's critical section.
    pub fn set_operation_started(&mut self) -> SessionResult<()> {
        self.session
            .backend
            .backend()
            .submit_execution_event(ExecutionEvent::new(
                &self.op,
                ExecutionEventKind::Execution,
                self.session.stage(),
            ))
    }

    /// Close the request: drop the presenter and advance the schedule.
    pub fn release(mut self) -> SessionResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> SessionResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        drop(self.pres.take());
        self.session
            .backend
            .backend()
            .submit_execution_event(ExecutionEvent::new(
                &self.op,
                ExecutionEventKind::Release,
                self.session.stage(),
            ))?;
        self.session.executor.on_next_operator(&self.op);
        Ok(())
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(error) = self.finish() {
                warn!(target: "session", op = self.op.as_str(), %error, "request release failed");
            }
        }
    }
}
