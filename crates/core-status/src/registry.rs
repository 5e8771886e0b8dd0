//! The status registry: ownership of all tensors and operators, the declared
//! execution order, and presenter-based access.
//!
//! A presenter (`TensorPres` / `OperatorPres`) grants exclusive mutation of
//! one entity while leaving every other entity free; it is the unit the
//! session, the schedule worker and the defragmenter serialize on. Presenters
//! release on drop on every exit path. Acquisition blocks on a per-entity
//! condvar; `try_reference_tensor` returns an empty view instead of blocking
//! so opportunistic callers (the defragmenter) can skip busy tensors.
//!
//! Registry mutation (register/unregister) is only legal before `start` and
//! takes the registry-wide writer lock, so no presenter can be live across a
//! mutation.

use crate::{Operator, StatusError, StatusResult, Tensor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

struct Cell<T> {
    state: Mutex<CellState<T>>,
    released: Condvar,
}

struct CellState<T> {
    data: T,
    presented: bool,
}

impl<T> Cell<T> {
    fn new(data: T) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                data,
                presented: false,
            }),
            released: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the cell is unpresented, then claim it.
    fn acquire(&self) {
        let mut state = self.lock();
        while state.presented {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.presented = true;
    }

    /// Claim the cell if free; false when another presenter holds it.
    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.presented {
            return false;
        }
        state.presented = true;
        true
    }

    fn release(&self) {
        let mut state = self.lock();
        state.presented = false;
        drop(state);
        self.released.notify_one();
    }
}

/// Exclusive presenter of one tensor. Mutation methods forward to the
/// underlying [`Tensor`] under a brief data lock; exclusivity between
/// presenters is what makes the forwarded sequence atomic.
pub struct TensorPres {
    cell: Arc<Cell<Tensor>>,
}

impl TensorPres {
    fn with<R>(&self, f: impl FnOnce(&Tensor) -> R) -> R {
        f(&self.cell.lock().data)
    }

    fn with_mut<R>(&mut self, f: impl FnOnce(&mut Tensor) -> R) -> R {
        f(&mut self.cell.lock().data)
    }

    pub fn name(&self) -> String {
        self.with(|t| t.name().to_string())
    }

    pub fn size(&self) -> usize {
        self.with(Tensor::size)
    }

    pub fn is_persistent(&self) -> bool {
        self.with(Tensor::is_persistent)
    }

    pub fn is_transient(&self) -> bool {
        self.with(Tensor::is_transient)
    }

    pub fn section_count(&self) -> usize {
        self.with(Tensor::section_count)
    }

    pub fn sections(&self) -> Vec<crate::MemorySection> {
        self.with(|t| t.sections().cloned().collect())
    }

    pub fn first_section(&self) -> crate::MemorySection {
        self.with(|t| t.first_section().clone())
    }

    pub fn last_section(&self) -> crate::MemorySection {
        self.with(|t| t.last_section().clone())
    }

    pub fn section(&self, offset: usize) -> StatusResult<crate::MemorySection> {
        self.with(|t| t.section(offset).cloned())
    }

    pub fn next_section(&self, offset: usize) -> StatusResult<Option<crate::MemorySection>> {
        self.with(|t| t.next_section(offset).map(|s| s.cloned()))
    }

    pub fn prev_section(&self, offset: usize) -> StatusResult<Option<crate::MemorySection>> {
        self.with(|t| t.prev_section(offset).map(|s| s.cloned()))
    }

    pub fn device_size(&self) -> usize {
        self.with(Tensor::device_size)
    }

    pub fn host_size(&self) -> usize {
        self.with(Tensor::host_size)
    }

    pub fn is_device_located(&self) -> bool {
        self.with(Tensor::is_device_located)
    }

    pub fn is_device_all_located(&self) -> bool {
        self.with(Tensor::is_device_all_located)
    }

    pub fn is_unlocated(&self) -> bool {
        self.with(Tensor::is_unlocated)
    }

    pub fn has_fragment(&self) -> bool {
        self.with(Tensor::has_fragment)
    }

    pub fn fragment(&self) -> crate::Fragment {
        self.with(|t| t.fragment().clone())
    }

    pub fn set_allocated(&mut self, device_address: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_allocated(device_address))
    }

    pub fn set_assigned(&mut self) -> StatusResult<()> {
        self.with_mut(Tensor::set_assigned)
    }

    pub fn set_acquired(&self) -> StatusResult<()> {
        self.with(Tensor::set_acquired)
    }

    pub fn set_copied_in(&mut self, offset: usize, device_address: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_copied_in(offset, device_address))
    }

    pub fn set_copied_out(&mut self, offset: usize, host_address: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_copied_out(offset, host_address))
    }

    pub fn set_device_freed(&mut self, offset: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_device_freed(offset))
    }

    pub fn set_host_freed(&mut self, offset: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_host_freed(offset))
    }

    pub fn set_moved(&mut self, offset: usize, device_address: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_moved(offset, device_address))
    }

    pub fn split(&mut self, offset: usize, k: usize) -> StatusResult<()> {
        self.with_mut(|t| t.split(offset, k))
    }

    pub fn is_mergeable(&self, offset: usize) -> bool {
        self.with(|t| t.is_mergeable(offset))
    }

    pub fn merge(&mut self, offset: usize) -> StatusResult<usize> {
        self.with_mut(|t| t.merge(offset))
    }

    pub fn apply_section_plan(&mut self, sizes: &[usize]) -> StatusResult<()> {
        self.with_mut(|t| t.apply_section_plan(sizes))
    }

    pub fn set_fragment_size(&mut self, size: usize) {
        self.with_mut(|t| t.set_fragment_size(size));
    }

    pub fn set_fragment_placed(&mut self, address: usize) -> StatusResult<()> {
        self.with_mut(|t| t.set_fragment_placed(address))
    }

    pub fn set_fragment_removed(&mut self) -> StatusResult<()> {
        self.with_mut(Tensor::set_fragment_removed)
    }
}

impl Drop for TensorPres {
    fn drop(&mut self) {
        self.cell.release();
    }
}

/// Result of a non-blocking reference attempt. Empty when the tensor was
/// already presented elsewhere.
pub struct TensorView {
    cell: Option<Arc<Cell<Tensor>>>,
}

impl TensorView {
    pub fn is_referenced(&self) -> bool {
        self.cell.is_some()
    }

    /// Turn the view into a live presenter. Panics never: an empty view
    /// yields an error instead.
    pub fn reference(mut self) -> StatusResult<TensorPres> {
        let cell = self
            .cell
            .take()
            .ok_or_else(|| StatusError::TensorInvalid("view holds no reference".to_string()))?;
        Ok(TensorPres { cell })
    }
}

impl Drop for TensorView {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.release();
        }
    }
}

/// Exclusive presenter of one operator.
pub struct OperatorPres {
    cell: Arc<Cell<Operator>>,
}

impl OperatorPres {
    fn with<R>(&self, f: impl FnOnce(&Operator) -> R) -> R {
        f(&self.cell.lock().data)
    }

    pub fn name(&self) -> String {
        self.with(|o| o.name().to_string())
    }

    pub fn tensors(&self) -> Vec<String> {
        self.with(|o| o.tensors().to_vec())
    }

    pub fn prevs(&self) -> Vec<String> {
        self.with(|o| o.prevs().to_vec())
    }

    pub fn posts(&self) -> Vec<String> {
        self.with(|o| o.posts().to_vec())
    }

    pub fn is_backward_propagation(&self) -> bool {
        self.with(Operator::is_backward_propagation)
    }
}

impl Drop for OperatorPres {
    fn drop(&mut self) {
        self.cell.release();
    }
}

/// Registry of all tensors and operators plus the declared execution order.
#[derive(Default)]
pub struct MemoryStatus {
    tensors: RwLock<HashMap<String, Arc<Cell<Tensor>>>>,
    operators: RwLock<HashMap<String, Arc<Cell<Operator>>>>,
    exec_order: RwLock<Vec<String>>,
    entry: RwLock<String>,
    started: AtomicBool,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_map<'a, T>(
        map: &'a RwLock<HashMap<String, Arc<Cell<T>>>>,
    ) -> std::sync::RwLockReadGuard<'a, HashMap<String, Arc<Cell<T>>>> {
        map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map<'a, T>(
        map: &'a RwLock<HashMap<String, Arc<Cell<T>>>>,
    ) -> std::sync::RwLockWriteGuard<'a, HashMap<String, Arc<Cell<T>>>> {
        map.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_mutable(&self) -> StatusResult<()> {
        if self.started.load(Ordering::Acquire) {
            Err(StatusError::Inited)
        } else {
            Ok(())
        }
    }

    /// Freeze the registry: from here on registration is rejected.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn register_tensor(&self, tensor: Tensor) -> StatusResult<()> {
        self.ensure_mutable()?;
        let mut tensors = Self::write_map(&self.tensors);
        if tensors.contains_key(tensor.name()) {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} already registered",
                tensor.name()
            )));
        }
        debug!(target: "status.registry", tensor = tensor.name(), size = tensor.size(), "tensor registered");
        tensors.insert(tensor.name().to_string(), Cell::new(tensor));
        Ok(())
    }

    /// Register an operator. Every tensor it names must already exist, and it
    /// is appended to the declared execution order.
    pub fn register_operator(&self, operator: Operator) -> StatusResult<()> {
        self.ensure_mutable()?;
        {
            let tensors = Self::read_map(&self.tensors);
            for tensor in operator.tensors() {
                if !tensors.contains_key(tensor) {
                    return Err(StatusError::UnknownTensor(tensor.clone()));
                }
            }
        }
        let mut operators = Self::write_map(&self.operators);
        if operators.contains_key(operator.name()) {
            return Err(StatusError::TensorInvalid(format!(
                "operator {} already registered",
                operator.name()
            )));
        }
        self.exec_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operator.name().to_string());
        debug!(target: "status.registry", operator = operator.name(), "operator registered");
        operators.insert(operator.name().to_string(), Cell::new(operator));
        Ok(())
    }

    pub fn set_entry(&self, op: &str) -> StatusResult<()> {
        self.ensure_mutable()?;
        if !Self::read_map(&self.operators).contains_key(op) {
            return Err(StatusError::UnknownOperator(op.to_string()));
        }
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = op.to_string();
        Ok(())
    }

    pub fn entry(&self) -> String {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn unregister_tensor(&self, name: &str) -> StatusResult<()> {
        self.ensure_mutable()?;
        let mut tensors = Self::write_map(&self.tensors);
        let cell = tensors
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownTensor(name.to_string()))?;
        {
            let state = cell.lock();
            if state.presented {
                return Err(StatusError::TensorInvalid(format!(
                    "tensor {name} is presented"
                )));
            }
            if !state.data.is_unlocated() {
                return Err(StatusError::TensorInvalid(format!(
                    "tensor {name} still holds memory"
                )));
            }
        }
        tensors.remove(name);
        Ok(())
    }

    pub fn unregister_operator(&self, name: &str) -> StatusResult<()> {
        self.ensure_mutable()?;
        let mut operators = Self::write_map(&self.operators);
        if operators.remove(name).is_none() {
            return Err(StatusError::UnknownOperator(name.to_string()));
        }
        self.exec_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|op| op != name);
        Ok(())
    }

    pub fn is_tensor_registered(&self, name: &str) -> bool {
        Self::read_map(&self.tensors).contains_key(name)
    }

    pub fn is_operator_registered(&self, name: &str) -> bool {
        Self::read_map(&self.operators).contains_key(name)
    }

    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Self::read_map(&self.tensors).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn execution_order(&self) -> Vec<String> {
        self.exec_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The declared successor of `op`, if any.
    pub fn execution_post(&self, op: &str) -> Option<String> {
        let order = self.exec_order.read().unwrap_or_else(PoisonError::into_inner);
        let index = order.iter().position(|o| o == op)?;
        order.get(index + 1).cloned()
    }

    /// Blocking exclusive reference to one tensor.
    pub fn reference_tensor(&self, name: &str) -> StatusResult<TensorPres> {
        let cell = Self::read_map(&self.tensors)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownTensor(name.to_string()))?;
        cell.acquire();
        Ok(TensorPres { cell })
    }

    /// Non-blocking reference attempt; an empty view when the tensor is busy.
    pub fn try_reference_tensor(&self, name: &str) -> StatusResult<TensorView> {
        let cell = Self::read_map(&self.tensors)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownTensor(name.to_string()))?;
        if cell.try_acquire() {
            Ok(TensorView { cell: Some(cell) })
        } else {
            Ok(TensorView { cell: None })
        }
    }

    pub fn reference_operator(&self, name: &str) -> StatusResult<OperatorPres> {
        let cell = Self::read_map(&self.operators)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownOperator(name.to_string()))?;
        cell.acquire();
        Ok(OperatorPres { cell })
    }

    /// Non-blocking operator reference attempt.
    pub fn try_reference_operator(&self, name: &str) -> StatusResult<Option<OperatorPres>> {
        let cell = Self::read_map(&self.operators)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownOperator(name.to_string()))?;
        if cell.try_acquire() {
            Ok(Some(OperatorPres { cell }))
        } else {
            Ok(None)
        }
    }

    /// Read-only copy of a tensor for observers (exporters, planners).
    pub fn snapshot_tensor(&self, name: &str) -> StatusResult<Tensor> {
        let cell = Self::read_map(&self.tensors)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownTensor(name.to_string()))?;
        let state = cell.lock();
        Ok(state.data.clone())
    }

    pub fn snapshot_operator(&self, name: &str) -> StatusResult<Operator> {
        let cell = Self::read_map(&self.operators)
            .get(name)
            .cloned()
            .ok_or_else(|| StatusError::UnknownOperator(name.to_string()))?;
        let state = cell.lock();
        Ok(state.data.clone())
    }

    pub fn clear(&self) {
        Self::write_map(&self.tensors).clear();
        Self::write_map(&self.operators).clear();
        self.exec_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.started.store(false, Ordering::Release);
    }
}
