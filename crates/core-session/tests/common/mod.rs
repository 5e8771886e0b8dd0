#![allow(dead_code)] // Shared across test binaries; each uses a subset.

//! A bounded single-section fake memory manager for session-level tests,
//! with traffic counters for weak-equality assertions across iterations.

use core_executor::MemoryManager;
use core_layout::{MemoryError, MemoryResult};
use core_status::MemoryInfo;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

const HOST_BASE: usize = 1 << 40;

#[derive(Default)]
struct Pool {
    regions: BTreeMap<usize, usize>,
}

impl Pool {
    fn in_use(&self) -> usize {
        self.regions.values().sum()
    }

    fn first_fit(&self, base: usize, capacity: usize, size: usize) -> Option<usize> {
        let mut cursor = base;
        for (&start, &region_size) in self.regions.range(base..) {
            if start.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = start + region_size;
        }
        if base + capacity >= cursor + size {
            Some(cursor)
        } else {
            None
        }
    }
}

pub struct DemoManager {
    device: Mutex<Pool>,
    host: Mutex<Pool>,
    info: MemoryInfo,
    host_cursor: AtomicUsize,
    pub copied_in: AtomicUsize,
    pub copied_out: AtomicUsize,
}

impl DemoManager {
    pub fn new(device_capacity: usize) -> Self {
        let mut info = MemoryInfo::with_sizes(device_capacity, 1 << 30);
        info.device.align_size = 1;
        Self {
            device: Mutex::new(Pool::default()),
            host: Mutex::new(Pool::default()),
            info,
            host_cursor: AtomicUsize::new(HOST_BASE),
            copied_in: AtomicUsize::new(0),
            copied_out: AtomicUsize::new(0),
        }
    }

    pub fn device_in_use(&self) -> usize {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use()
    }

    pub fn host_in_use(&self) -> usize {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use()
    }

    pub fn traffic(&self) -> (usize, usize) {
        (
            self.copied_in.load(Ordering::SeqCst),
            self.copied_out.load(Ordering::SeqCst),
        )
    }
}

impl MemoryManager for DemoManager {
    fn allocate_device(&self, size: usize) -> MemoryResult<usize> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.info.device.common_block.address;
        let capacity = self.info.device.common_block.size;
        let address = device
            .first_fit(base, capacity, size)
            .ok_or(MemoryError::DeviceInsufficient(size))?;
        device.regions.insert(address, size);
        Ok(address)
    }

    fn allocate_host(&self, size: usize) -> MemoryResult<usize> {
        let address = self.host_cursor.fetch_add(size.max(1) + 64, Ordering::SeqCst);
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .regions
            .insert(address, size);
        Ok(address)
    }

    fn copy_in(&self, host_address: usize, _device_address: usize, size: usize) -> MemoryResult<()> {
        let host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        if !host.regions.contains_key(&host_address) {
            return Err(MemoryError::Unmanaged(host_address));
        }
        self.copied_in.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn copy_out(
        &self,
        device_address: usize,
        _host_address: usize,
        size: usize,
    ) -> MemoryResult<()> {
        let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if !device.regions.contains_key(&device_address) {
            return Err(MemoryError::Unmanaged(device_address));
        }
        self.copied_out.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn free_device(&self, address: usize) -> MemoryResult<()> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device
            .regions
            .remove(&address)
            .map(|_| ())
            .ok_or(MemoryError::NotAllocated(address))
    }

    fn free_host(&self, address: usize) -> MemoryResult<()> {
        let mut host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        host.regions
            .remove(&address)
            .map(|_| ())
            .ok_or(MemoryError::NotAllocated(address))
    }

    fn memory_info(&self) -> MemoryInfo {
        self.info.clone()
    }
}
