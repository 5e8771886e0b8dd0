//! Demo collaborators: an in-process memory manager over plain maps and a
//! miniature model that drives the session the way a framework would.

use anyhow::{Context as _, Result};
use core_executor::MemoryManager;
use core_layout::{MemoryError, MemoryResult};
use core_session::{Frontend, MemorySession};
use core_status::{MemoryInfo, Operator, Tensor, TensorKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

const HOST_BASE: usize = 1 << 40;

/// First-fit device pool plus an unbounded host map. Stands in for a real
/// accelerator runtime; thread-safe like the interface demands.
pub struct DemoMemoryManager {
    device: Mutex<BTreeMap<usize, usize>>,
    host: Mutex<BTreeMap<usize, usize>>,
    host_cursor: AtomicUsize,
    info: MemoryInfo,
    swap_traffic: AtomicUsize,
}

impl DemoMemoryManager {
    pub fn new(device_capacity: usize) -> Self {
        let mut info = MemoryInfo::with_sizes(device_capacity, 1 << 30);
        info.device.align_size = 1;
        Self {
            device: Mutex::new(BTreeMap::new()),
            host: Mutex::new(BTreeMap::new()),
            host_cursor: AtomicUsize::new(HOST_BASE),
            info,
            swap_traffic: AtomicUsize::new(0),
        }
    }

    pub fn device_in_use(&self) -> usize {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Total bytes that crossed the device/host boundary.
    pub fn swap_traffic(&self) -> usize {
        self.swap_traffic.load(Ordering::SeqCst)
    }

    fn first_fit(pool: &BTreeMap<usize, usize>, capacity: usize, size: usize) -> Option<usize> {
        let mut cursor = 0;
        for (&start, &region_size) in pool {
            if start.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = start + region_size;
        }
        if capacity >= cursor + size {
            Some(cursor)
        } else {
            None
        }
    }
}

impl MemoryManager for DemoMemoryManager {
    fn allocate_device(&self, size: usize) -> MemoryResult<usize> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let address = Self::first_fit(&device, self.info.device.common_block.size, size)
            .ok_or(MemoryError::DeviceInsufficient(size))?;
        device.insert(address, size);
        Ok(address)
    }

    fn allocate_host(&self, size: usize) -> MemoryResult<usize> {
        let address = self.host_cursor.fetch_add(size.max(1) + 64, Ordering::SeqCst);
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, size);
        Ok(address)
    }

    fn copy_in(&self, host_address: usize, _device_address: usize, size: usize) -> MemoryResult<()> {
        let host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        if !host.contains_key(&host_address) {
            return Err(MemoryError::Unmanaged(host_address));
        }
        self.swap_traffic.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn copy_out(
        &self,
        device_address: usize,
        _host_address: usize,
        size: usize,
    ) -> MemoryResult<()> {
        let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if !device.contains_key(&device_address) {
            return Err(MemoryError::Unmanaged(device_address));
        }
        self.swap_traffic.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn free_device(&self, address: usize) -> MemoryResult<()> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
            .map(|_| ())
            .ok_or(MemoryError::NotAllocated(address))
    }

    fn free_host(&self, address: usize) -> MemoryResult<()> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
            .map(|_| ())
            .ok_or(MemoryError::NotAllocated(address))
    }

    fn memory_info(&self) -> MemoryInfo {
        self.info.clone()
    }
}

struct DemoOperator {
    name: &'static str,
    tensor: &'static str,
    process_time: Duration,
}

/// A three-operator chain sharing the classic forward/backward shape.
pub struct DemoModel {
    operators: Vec<DemoOperator>,
    tensor_size: usize,
}

impl DemoModel {
    pub fn new(tensor_size: usize) -> Self {
        let operators = [("o1", "t1"), ("o2", "t2"), ("o3", "t3")]
            .into_iter()
            .map(|(name, tensor)| DemoOperator {
                name,
                tensor,
                process_time: Duration::from_millis(5),
            })
            .collect();
        Self {
            operators,
            tensor_size,
        }
    }

    /// Register the graph with the frontend (inside the init/start window).
    pub fn register(&self, frontend: &Frontend) -> Result<()> {
        for op in &self.operators {
            frontend
                .register_tensor(Tensor::new(op.tensor, self.tensor_size, TensorKind::Inout))
                .with_context(|| format!("registering tensor {}", op.tensor))?;
        }
        for (i, op) in self.operators.iter().enumerate() {
            let mut operator = Operator::new(op.name).with_tensor(op.tensor);
            if i > 0 {
                operator = operator.with_prev(self.operators[i - 1].name);
            }
            if i + 1 < self.operators.len() {
                operator = operator.with_post(self.operators[i + 1].name);
            }
            frontend
                .register_operator(operator)
                .with_context(|| format!("registering operator {}", op.name))?;
        }
        frontend.set_entry(self.operators[0].name)?;
        Ok(())
    }

    /// One training iteration: forward allocate/assign/run, then backward
    /// re-read and free in reverse order.
    pub fn execute(&self, session: &MemorySession) -> Result<()> {
        session.new_iteration()?;

        for op in &self.operators {
            let address = session.allocate_memory(op.name, op.tensor)?;
            info!(target: "demo", op = op.name, tensor = op.tensor, address, "forward");
            let mut request = session.create_request(op.name)?;
            request.wait_tensor(op.tensor)?;
            request.set_memory_data_assigned(op.tensor)?;
            request.set_operation_started()?;
            std::thread::sleep(op.process_time);
            request.release()?;
        }

        session.half_iteration()?;

        for op in self.operators.iter().rev() {
            info!(target: "demo", op = op.name, tensor = op.tensor, "backward");
            let mut request = session.create_request(op.name)?;
            request.wait_tensor(op.tensor)?;
            request.set_memory_data_acquired(op.tensor)?;
            request.set_operation_started()?;
            std::thread::sleep(op.process_time);
            request.release()?;
            session.free_memory(op.name, op.tensor)?;
        }
        Ok(())
    }
}
