//! Live device-memory layout records and the planner's memory map.
//!
//! [`layout::MemoryLayout`] mirrors what the memory manager has handed out:
//! every byte of every managed block is covered by exactly one record, free
//! neighbours merge eagerly, and the executor informs it of every allocate /
//! free / split / merge it performs. [`map::MemoryMap`] is the other side of
//! the coin: the layout the planner *wants*, expressed as layers of regions
//! with section and fragment sizes, shipped inside a schedule bundle.

pub mod layout;
pub mod map;

pub use layout::{BlockKind, MemoryLayout, MemoryRegion};
pub use map::{Layer, MemoryMap, MemoryMapBuilder, Region};

/// Memory-record failures (§MEMORY of the error taxonomy) plus the two
/// insufficience kinds that bubble from the memory manager.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory already allocated at {0:#x}")]
    Allocated(usize),
    #[error("memory not allocated at {0:#x}")]
    NotAllocated(usize),
    #[error("memory address {0:#x} not managed")]
    Unmanaged(usize),
    #[error("invalid memory operation at {0:#x}: {1}")]
    OperationInvalid(usize, String),
    #[error("device memory insufficient: {0} bytes requested")]
    DeviceInsufficient(usize),
    #[error("host memory insufficient: {0} bytes requested")]
    HostInsufficient(usize),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
