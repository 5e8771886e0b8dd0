//! The pluggable memory-manager interface.
//!
//! The manager owns every device and host byte; the core only commands it
//! and records the addresses it returns. Implementations must be thread-safe:
//! the session thread's allocation paths and the schedule worker's swap paths
//! call in concurrently and the core does not serialize them.

use core_layout::{MemoryError, MemoryResult};
use core_status::MemoryInfo;

pub trait MemoryManager: Send + Sync {
    /// Allocate `size` bytes of device memory.
    fn allocate_device(&self, size: usize) -> MemoryResult<usize>;

    /// Allocate `size` bytes of host (pinned) memory.
    fn allocate_host(&self, size: usize) -> MemoryResult<usize>;

    /// Copy `size` bytes host → device.
    fn copy_in(&self, host_address: usize, device_address: usize, size: usize) -> MemoryResult<()>;

    /// Copy `size` bytes device → host.
    fn copy_out(&self, device_address: usize, host_address: usize, size: usize)
        -> MemoryResult<()>;

    fn free_device(&self, address: usize) -> MemoryResult<()>;

    fn free_host(&self, address: usize) -> MemoryResult<()>;

    /// Whether the sectioned capability set below is usable.
    fn supports_sections(&self) -> bool {
        false
    }

    /// Targeted allocation at a specific device address.
    fn salloc(&self, _address: usize, size: usize) -> MemoryResult<usize> {
        Err(MemoryError::DeviceInsufficient(size))
    }

    /// Split a device allocation; returns the right half's address.
    fn split(&self, address: usize, size: usize) -> MemoryResult<usize> {
        Ok(address + size)
    }

    /// Merge two adjacent device allocations. False when not adjacent or not
    /// owned.
    fn merge(&self, _left: usize, _right: usize) -> bool {
        false
    }

    /// Device-to-device copy. The default bounces through a host buffer for
    /// managers without a native path.
    fn copy_device(&self, src: usize, dst: usize, size: usize) -> MemoryResult<()> {
        let bounce = self.allocate_host(size)?;
        self.copy_out(src, bounce, size)?;
        self.copy_in(bounce, dst, size)?;
        self.free_host(bounce)
    }

    /// Device/host geometry.
    fn memory_info(&self) -> MemoryInfo;
}
