//! The schedule executor: a background worker replaying the active bundle.
//!
//! The worker owns a position over the bundle's timepoint lanes and fires
//! dependency-anchored events as operator notifications arrive. Bundle
//! updates are staged and applied only at `new_iteration`, so in-flight
//! events always complete against the bundle they were read from. Events
//! flagged `instant` run synchronously on the notifying thread; everything
//! else crosses the channel to the worker.
//!
//! Emergency handling lives here too: `wait_memory` walks the execution
//! order swapping out whole operators until the requested volume is free,
//! falling back to transient-block defragmentation when swaps alone cannot
//! pay.

use crate::{
    ExecutorResult, MemoryDefragmentationExecutor, MemoryManager, MemoryOperationExecutor,
};
use core_events::{ScheduleEvent, ScheduleEventKind, ScheduleEvents, Stage};
use core_layout::{MemoryError, MemoryLayout};
use core_status::{MemoryStatus, StatusError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How schedule positions advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// `on_next_operator` notifications drive dependency-anchored events.
    #[default]
    Dependency,
    /// Elapsed time against iteration start drives timepoint events.
    Time,
}

/// Framework notification hooks fired after scheduled swaps. Addresses are
/// the tensor's new first-section device address (swap-in) or zero
/// (swap-out).
type SwapCallback = Box<dyn Fn(&str, usize) + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    post_swap_in: Mutex<Option<SwapCallback>>,
    post_swap_out: Mutex<Option<SwapCallback>>,
}

impl CallbackRegistry {
    pub fn set_post_swap_in(&self, callback: SwapCallback) {
        *self
            .post_swap_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_post_swap_out(&self, callback: SwapCallback) {
        *self
            .post_swap_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn fire_swap_in(&self, tensor: &str, address: usize) {
        if let Some(callback) = self
            .post_swap_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            callback(tensor, address);
        }
    }

    pub fn fire_swap_out(&self, tensor: &str) {
        if let Some(callback) = self
            .post_swap_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            callback(tensor, 0);
        }
    }
}

enum Command {
    NextOperator(String),
    Terminate,
}

struct SharedState {
    bundle: Arc<ScheduleEvents>,
    pending: Option<Arc<ScheduleEvents>>,
    stage_started: Instant,
    timepoint_cursor: usize,
}

struct Inner {
    status: Arc<MemoryStatus>,
    operations: MemoryOperationExecutor,
    defrag: Option<MemoryDefragmentationExecutor>,
    callbacks: Arc<CallbackRegistry>,
    trigger: TriggerMode,
    state: Mutex<SharedState>,
    // Stage encoded as u8 (0 forward, 1 backward) for lock-free reads on
    // the notification path.
    stage: AtomicU8,
    running: AtomicBool,
}

impl Inner {
    fn stage(&self) -> Stage {
        if self.stage.load(Ordering::Acquire) == 1 {
            Stage::Backward
        } else {
            Stage::Forward
        }
    }

    fn current_bundle(&self) -> Arc<ScheduleEvents> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bundle
            .clone()
    }

    fn execute_event(&self, event: &ScheduleEvent) -> ExecutorResult<()> {
        let mut tensor = self.status.reference_tensor(&event.tensor)?;
        let size = if event.size == 0 {
            tensor.size()
        } else {
            event.size
        };
        match event.kind {
            ScheduleEventKind::Allocate => {
                if tensor.is_unlocated() {
                    self.operations.allocate(&mut tensor)?;
                }
            }
            ScheduleEventKind::Copyin => {
                // A tensor the session already freed has nothing to restore;
                // bringing it back would resurrect dead memory.
                if tensor.host_size() > 0 || tensor.is_device_located() {
                    self.operations.copy_in(&mut tensor, size)?;
                }
            }
            ScheduleEventKind::Copyout => self.operations.copy_out(&mut tensor, size)?,
            ScheduleEventKind::Swapin => {
                if tensor.host_size() > 0 || tensor.is_device_located() {
                    self.operations.swap_in(&mut tensor, size)?;
                    let address = tensor.first_section().device_address.unwrap_or(0);
                    self.callbacks.fire_swap_in(&event.tensor, address);
                }
            }
            ScheduleEventKind::Swapout => {
                self.operations.swap_out(&mut tensor, size)?;
                self.callbacks.fire_swap_out(&event.tensor);
            }
            ScheduleEventKind::Freedev => self.operations.free_device(&mut tensor, size)?,
            ScheduleEventKind::Freehost => self.operations.free_host(&mut tensor, size)?,
            ScheduleEventKind::Free => self.operations.free(&mut tensor, size)?,
        }
        Ok(())
    }

    fn run_event(&self, event: &ScheduleEvent) {
        if let Err(error) = self.execute_event(event) {
            // A scheduled operation racing the session is survivable; the
            // emergency path covers any residual shortfall.
            warn!(
                target: "executor.schedule",
                tensor = event.tensor.as_str(),
                kind = event.kind.as_str(),
                %error,
                "schedule event failed"
            );
        }
    }

    /// Fire due timepoint events for the current stage.
    fn fire_due_timepoints(&self) {
        let stage = self.stage();
        let due = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = state.stage_started.elapsed().as_micros() as i64;
            let bundle = state.bundle.clone();
            let lane = &bundle.stage(stage).timepoint;
            let mut due = Vec::new();
            while state.timepoint_cursor < lane.len() {
                let event = &lane[state.timepoint_cursor];
                if event.timepoint > elapsed {
                    break;
                }
                due.push(event.clone());
                state.timepoint_cursor += 1;
            }
            due
        };
        for event in due {
            self.run_event(&event);
        }
    }
}

/// Long-lived executor bound to one background worker thread.
pub struct ScheduleExecutor {
    inner: Arc<Inner>,
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleExecutor {
    pub fn new(
        status: Arc<MemoryStatus>,
        layout: Arc<MemoryLayout>,
        manager: Arc<dyn MemoryManager>,
        trigger: TriggerMode,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let operations = MemoryOperationExecutor::new(layout.clone(), manager.clone());
        let defrag = if manager.memory_info().device.transient_block.size > 0 {
            Some(MemoryDefragmentationExecutor::new(
                status.clone(),
                layout,
                manager,
            ))
        } else {
            None
        };
        let inner = Arc::new(Inner {
            status,
            operations,
            defrag,
            callbacks,
            trigger,
            state: Mutex::new(SharedState {
                bundle: Arc::new(ScheduleEvents::default()),
                pending: None,
                stage_started: Instant::now(),
                timepoint_cursor: 0,
            }),
            stage: AtomicU8::new(0),
            running: AtomicBool::new(false),
        });
        let (sender, receiver) = bounded(1024);
        let executor = Self {
            inner,
            sender,
            worker: Mutex::new(None),
        };
        executor.spawn_worker(receiver);
        executor
    }

    fn spawn_worker(&self, receiver: Receiver<Command>) {
        let inner = self.inner.clone();
        inner.running.store(true, Ordering::Release);
        let handle = std::thread::spawn(move || {
            let poll = match inner.trigger {
                TriggerMode::Time => Duration::from_micros(200),
                TriggerMode::Dependency => Duration::from_millis(5),
            };
            while inner.running.load(Ordering::Acquire) {
                match receiver.recv_timeout(poll) {
                    Ok(Command::NextOperator(op)) => {
                        let stage = inner.stage();
                        let bundle = inner.current_bundle();
                        for event in bundle.stage(stage).after(&op) {
                            if !event.instant {
                                inner.run_event(event);
                            }
                        }
                    }
                    Ok(Command::Terminate) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                if inner.trigger == TriggerMode::Time {
                    inner.fire_due_timepoints();
                }
            }
            debug!(target: "executor.schedule", "worker drained");
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn operations(&self) -> &MemoryOperationExecutor {
        &self.inner.operations
    }

    /// Stage a new bundle; it becomes active at the next iteration boundary.
    pub fn update_schedule(&self, bundle: ScheduleEvents) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.pending = Some(Arc::new(bundle));
        info!(target: "executor.schedule", "schedule staged for next iteration");
    }

    /// Apply staged bundles and reset position and timer. Synchronous: when
    /// this returns, no event of the retired bundle can fire afterwards.
    pub fn new_iteration(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.take() {
            state.bundle = pending;
            debug!(target: "executor.schedule", "staged schedule activated");
        }
        state.stage_started = Instant::now();
        state.timepoint_cursor = 0;
        drop(state);
        self.inner.stage.store(0, Ordering::Release);
    }

    /// Forward → backward transition; the backward timepoint lane restarts.
    pub fn half_iteration(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.stage_started = Instant::now();
        state.timepoint_cursor = 0;
        drop(state);
        self.inner.stage.store(1, Ordering::Release);
    }

    /// The named operator finished; fire its dependent events. Instant
    /// events run here, the rest on the worker.
    pub fn on_next_operator(&self, op: &str) {
        let stage = self.inner.stage();
        let bundle = self.inner.current_bundle();
        for event in bundle.stage(stage).after(op) {
            if event.instant {
                self.inner.run_event(event);
            }
        }
        if self
            .sender
            .send(Command::NextOperator(op.to_string()))
            .is_err()
        {
            warn!(target: "executor.schedule", op, "worker gone; notification dropped");
        }
    }

    /// Emergency eviction: swap out whole operators in execution order until
    /// `size` bytes have left the device. Runs on the calling thread and
    /// returns what was evicted so the session can record the swaps.
    pub fn wait_memory(&self, size: usize) -> ExecutorResult<Vec<(String, usize)>> {
        let mut evicted: Vec<(String, usize)> = Vec::new();
        let mut freed = 0usize;
        for op_name in self.inner.status.execution_order() {
            if freed >= size {
                break;
            }
            let op = match self.inner.status.snapshot_operator(&op_name) {
                Ok(op) => op,
                Err(_) => continue,
            };
            for tensor_name in op.tensors() {
                let Ok(tensor) = self.inner.status.snapshot_tensor(tensor_name) else {
                    continue;
                };
                if tensor.is_persistent() || tensor.is_transient() {
                    continue;
                }
                if !tensor.is_device_located() {
                    continue;
                }
                let device_size = tensor.device_size();
                let mut pres = match self.inner.status.reference_tensor(tensor_name) {
                    Ok(pres) => pres,
                    Err(_) => continue,
                };
                match self.inner.operations.swap_out(&mut pres, device_size) {
                    Ok(()) => {
                        freed += device_size;
                        evicted.push((tensor_name.clone(), device_size));
                        self.inner.callbacks.fire_swap_out(tensor_name);
                        info!(
                            target: "executor.schedule",
                            tensor = tensor_name.as_str(),
                            bytes = device_size,
                            "emergency swap-out"
                        );
                    }
                    Err(error) => {
                        warn!(
                            target: "executor.schedule",
                            tensor = tensor_name.as_str(),
                            %error,
                            "emergency swap-out failed"
                        );
                    }
                }
            }
        }
        if freed < size {
            if let Some(defrag) = &self.inner.defrag {
                defrag.defragment(size)?;
                let (usable, _) = defrag.allocatable(size);
                if usable + freed >= size {
                    return Ok(evicted);
                }
            }
            if freed == 0 {
                return Err(MemoryError::DeviceInsufficient(size).into());
            }
        }
        Ok(evicted)
    }

    /// Stop the worker after draining its queue.
    pub fn terminate(&self) -> ExecutorResult<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Err(StatusError::Uninited.into());
        }
        let _ = self.sender.send(Command::Terminate);
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for ScheduleExecutor {
    fn drop(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            let _ = self.terminate();
        }
    }
}
