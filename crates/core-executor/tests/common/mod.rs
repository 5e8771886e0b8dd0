#![allow(dead_code)] // Shared across test binaries; each uses a subset.

//! A sectioned fake memory manager with checksum payloads.
//!
//! Device memory is a bounded first-fit pool; host memory is unbounded. Every
//! allocation carries a `u64` payload standing in for its bytes, so tests can
//! assert that swap round-trips preserve content without real device memory.

use core_executor::MemoryManager;
use core_layout::{MemoryError, MemoryResult};
use core_status::MemoryInfo;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone)]
struct Allocation {
    size: usize,
    payload: u64,
}

#[derive(Default)]
struct Pool {
    regions: BTreeMap<usize, Allocation>,
}

impl Pool {
    fn in_use(&self) -> usize {
        self.regions.values().map(|a| a.size).sum()
    }

    fn overlaps(&self, address: usize, size: usize) -> bool {
        if let Some((&start, region)) = self.regions.range(..address + size).next_back() {
            if start + region.size > address {
                return true;
            }
        }
        false
    }

    /// Payload of the allocation covering `address`.
    fn covering(&self, address: usize) -> Option<u64> {
        let (&start, region) = self.regions.range(..=address).next_back()?;
        if start + region.size > address {
            Some(region.payload)
        } else {
            None
        }
    }

    /// Stamp the payload of the allocation covering `address`.
    fn stamp_covering(&mut self, address: usize, payload: u64) -> Option<()> {
        let (&start, _) = self.regions.range(..=address).next_back()?;
        let region = self.regions.get_mut(&start)?;
        if start + region.size > address {
            region.payload = payload;
            Some(())
        } else {
            None
        }
    }

    /// Lowest gap fitting `size` within `[base, base + capacity)`.
    fn first_fit(&self, base: usize, capacity: usize, size: usize) -> Option<usize> {
        let mut cursor = base;
        for (&start, region) in self.regions.range(base..) {
            if start.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = start + region.size;
        }
        if base + capacity >= cursor + size {
            Some(cursor)
        } else {
            None
        }
    }
}

pub struct SectionedManager {
    device: Mutex<Pool>,
    host: Mutex<Pool>,
    info: MemoryInfo,
    host_cursor: AtomicUsize,
    copied_in: AtomicUsize,
    copied_out: AtomicUsize,
}

/// Host addresses live far above any device block.
const HOST_BASE: usize = 1 << 40;

impl SectionedManager {
    pub fn new(device_capacity: usize) -> Self {
        Self {
            device: Mutex::new(Pool::default()),
            host: Mutex::new(Pool::default()),
            info: MemoryInfo::with_sizes(device_capacity, 1 << 30),
            host_cursor: AtomicUsize::new(HOST_BASE),
            copied_in: AtomicUsize::new(0),
            copied_out: AtomicUsize::new(0),
        }
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.info.device.align_size = align;
        self
    }

    pub fn with_transient(mut self, address: usize, size: usize) -> Self {
        self.info.device.transient_block = core_status::MemoryBlock::new(address, size);
        self
    }

    fn in_managed_range(&self, address: usize, size: usize) -> bool {
        let common = &self.info.device.common_block;
        let transient = &self.info.device.transient_block;
        (address >= common.address && address + size <= common.end())
            || (transient.size > 0
                && address >= transient.address
                && address + size <= transient.end())
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

    /// Total bytes moved host → device / device → host so far.
    pub fn traffic(&self) -> (usize, usize) {
        (
            self.copied_in.load(Ordering::SeqCst),
            self.copied_out.load(Ordering::SeqCst),
        )
    }

    /// Stamp the payload of a device allocation.
    pub fn write_device(&self, address: usize, payload: u64) {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(region) = device.regions.get_mut(&address) {
            region.payload = payload;
        }
    }

    pub fn read_device(&self, address: usize) -> Option<u64> {
        let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device.regions.get(&address).map(|r| r.payload)
    }
}

impl MemoryManager for SectionedManager {
    fn allocate_device(&self, size: usize) -> MemoryResult<usize> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.info.device.common_block.address;
        let capacity = self.info.device.common_block.size;
        let address = device
            .first_fit(base, capacity, size)
            .ok_or(MemoryError::DeviceInsufficient(size))?;
        device.regions.insert(address, Allocation { size, payload: 0 });
        Ok(address)
    }

    fn allocate_host(&self, size: usize) -> MemoryResult<usize> {
        // The gap keeps separate host allocations non-contiguous, mirroring
        // a real pinned-memory allocator's headers.
        let address = self.host_cursor.fetch_add(size.max(1) + 64, Ordering::SeqCst);
        let mut host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        host.regions.insert(address, Allocation { size, payload: 0 });
        Ok(address)
    }

    fn copy_in(&self, host_address: usize, device_address: usize, size: usize) -> MemoryResult<()> {
        let payload = {
            let host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
            host.covering(host_address)
                .ok_or(MemoryError::Unmanaged(host_address))?
        };
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device
            .stamp_covering(device_address, payload)
            .ok_or(MemoryError::Unmanaged(device_address))?;
        self.copied_in.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn copy_out(
        &self,
        device_address: usize,
        host_address: usize,
        size: usize,
    ) -> MemoryResult<()> {
        let payload = {
            let device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
            device
                .covering(device_address)
                .ok_or(MemoryError::Unmanaged(device_address))?
        };
        let mut host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        host.stamp_covering(host_address, payload)
            .ok_or(MemoryError::Unmanaged(host_address))?;
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

    fn supports_sections(&self) -> bool {
        true
    }

    fn salloc(&self, address: usize, size: usize) -> MemoryResult<usize> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.in_managed_range(address, size) || device.overlaps(address, size) {
            return Err(MemoryError::DeviceInsufficient(size));
        }
        device.regions.insert(address, Allocation { size, payload: 0 });
        Ok(address)
    }

    fn split(&self, address: usize, size: usize) -> MemoryResult<usize> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let region = device
            .regions
            .get_mut(&address)
            .ok_or(MemoryError::NotAllocated(address))?;
        if region.size <= size {
            return Err(MemoryError::OperationInvalid(
                address,
                "split beyond region".to_string(),
            ));
        }
        let payload = region.payload;
        let right_size = region.size - size;
        region.size = size;
        device.regions.insert(
            address + size,
            Allocation {
                size: right_size,
                payload,
            },
        );
        Ok(address + size)
    }

    fn merge(&self, left: usize, right: usize) -> bool {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(left_region) = device.regions.get(&left) else {
            return false;
        };
        if left + left_region.size != right || !device.regions.contains_key(&right) {
            return false;
        }
        let Some(right_region) = device.regions.remove(&right) else {
            return false;
        };
        if let Some(left_region) = device.regions.get_mut(&left) {
            left_region.size += right_region.size;
            left_region.payload = left_region.payload.wrapping_add(right_region.payload);
        }
        true
    }

    fn copy_device(&self, src: usize, dst: usize, size: usize) -> MemoryResult<()> {
        let _ = size;
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let payload = device.covering(src).ok_or(MemoryError::Unmanaged(src))?;
        device
            .stamp_covering(dst, payload)
            .ok_or(MemoryError::Unmanaged(dst))?;
        Ok(())
    }

    fn memory_info(&self) -> MemoryInfo {
        self.info.clone()
    }
}

/// A single-section manager: same pools, no section capabilities.
pub struct PlainManager(pub SectionedManager);

impl PlainManager {
    pub fn new(device_capacity: usize) -> Self {
        Self(SectionedManager::new(device_capacity))
    }
}

impl MemoryManager for PlainManager {
    fn allocate_device(&self, size: usize) -> MemoryResult<usize> {
        self.0.allocate_device(size)
    }

    fn allocate_host(&self, size: usize) -> MemoryResult<usize> {
        self.0.allocate_host(size)
    }

    fn copy_in(&self, host_address: usize, device_address: usize, size: usize) -> MemoryResult<()> {
        self.0.copy_in(host_address, device_address, size)
    }

    fn copy_out(
        &self,
        device_address: usize,
        host_address: usize,
        size: usize,
    ) -> MemoryResult<()> {
        self.0.copy_out(device_address, host_address, size)
    }

    fn free_device(&self, address: usize) -> MemoryResult<()> {
        self.0.free_device(address)
    }

    fn free_host(&self, address: usize) -> MemoryResult<()> {
        self.0.free_host(address)
    }

    fn memory_info(&self) -> MemoryInfo {
        self.0.memory_info()
    }
}
