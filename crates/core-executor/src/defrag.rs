//! Emergency defragmentation of the transient block.
//!
//! The transient block serves bump-style scratch allocations, so churn leaves
//! small holes behind. The defragmenter keeps a size-keyed index of allocated
//! and idle transient regions and, on demand, copy-moves allocated regions
//! down into holes. Tensors that are presented elsewhere are simply skipped:
//! defragmentation is opportunistic and must never wait on a busy tensor.

use crate::{ExecutorError, ExecutorResult, MemoryManager};
use core_layout::{BlockKind, MemoryError, MemoryLayout};
use core_status::MemoryStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

#[derive(Default)]
struct RegionIndex {
    allocated: BTreeMap<usize, BTreeSet<usize>>,
    idle: BTreeMap<usize, BTreeSet<usize>>,
}

impl RegionIndex {
    fn move_entry(
        from: &mut BTreeMap<usize, BTreeSet<usize>>,
        to: &mut BTreeMap<usize, BTreeSet<usize>>,
        size: usize,
        address: usize,
    ) {
        if let Some(set) = from.get_mut(&size) {
            set.remove(&address);
            if set.is_empty() {
                from.remove(&size);
            }
        }
        to.entry(size).or_default().insert(address);
    }
}

pub struct MemoryDefragmentationExecutor {
    status: Arc<MemoryStatus>,
    layout: Arc<MemoryLayout>,
    manager: Arc<dyn MemoryManager>,
    index: Mutex<RegionIndex>,
}

impl MemoryDefragmentationExecutor {
    pub fn new(
        status: Arc<MemoryStatus>,
        layout: Arc<MemoryLayout>,
        manager: Arc<dyn MemoryManager>,
    ) -> Self {
        let mut index = RegionIndex::default();
        let info = manager.memory_info();
        if info.device.transient_block.size > 0 {
            index
                .idle
                .entry(info.device.transient_block.size)
                .or_default()
                .insert(info.device.transient_block.address);
        }
        Self {
            status,
            layout,
            manager,
            index: Mutex::new(index),
        }
    }

    /// Track a transient allocation.
    pub fn record_alloc(&self, address: usize) -> ExecutorResult<()> {
        if !self.layout.is_transient(address) {
            return Err(MemoryError::Unmanaged(address).into());
        }
        let region = self.layout.locate(address)?;
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let index = &mut *index;
        RegionIndex::move_entry(&mut index.idle, &mut index.allocated, region.size, address);
        Ok(())
    }

    /// Track a transient free.
    pub fn record_free(&self, address: usize) -> ExecutorResult<()> {
        if !self.layout.is_transient(address) {
            return Err(MemoryError::Unmanaged(address).into());
        }
        let region = self.layout.locate(address)?;
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let index = &mut *index;
        RegionIndex::move_entry(&mut index.allocated, &mut index.idle, region.size, address);
        Ok(())
    }

    /// (usable, fragmented) idle byte totals at the given granularity.
    pub fn allocatable(&self, granularity: usize) -> (usize, usize) {
        let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let mut usable = 0;
        let mut fragmented = 0;
        for (&size, addresses) in &index.idle {
            let total = size * addresses.len();
            if size >= granularity {
                usable += total;
            } else {
                fragmented += total;
            }
        }
        (usable, fragmented)
    }

    /// One compaction pass over the transient block: holes smaller than
    /// `granularity` attract the highest allocated region of the same size,
    /// or failing that their immediate allocated successor.
    pub fn defragment(&self, granularity: usize) -> ExecutorResult<()> {
        let snapshot = self.layout.regions_of(BlockKind::Transient);
        for (position, (address, region)) in snapshot.iter().enumerate() {
            if region.allocated || region.size >= granularity {
                continue;
            }
            let same_size_source = {
                let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
                index
                    .allocated
                    .get(&region.size)
                    .and_then(|set| set.iter().next_back().copied())
                    .filter(|&src| src > *address)
            };
            let moved = if let Some(src) = same_size_source {
                self.copy_region(src, *address, region.size)?
            } else if let Some((next_address, next_region)) = snapshot.get(position + 1) {
                next_region.allocated
                    && self.copy_region(*next_address, *address, next_region.size)?
            } else {
                false
            };
            if moved {
                trace!(target: "executor.defrag", hole = *address, "hole filled");
            }
        }
        Ok(())
    }

    /// Move one allocated region down to `dst`. False when the owning tensor
    /// is busy and the move was skipped.
    fn copy_region(&self, src: usize, dst: usize, size: usize) -> ExecutorResult<bool> {
        debug_assert!(src > dst);
        let region = self.layout.locate(src)?;
        let view = self.status.try_reference_tensor(&region.name)?;
        if !view.is_referenced() {
            return Ok(false);
        }
        let mut tensor = view.reference()?;
        let section_offset = tensor
            .sections()
            .into_iter()
            .find(|s| s.device_address == Some(src))
            .map(|s| s.offset)
            .ok_or(ExecutorError::Memory(MemoryError::Unmanaged(src)))?;

        if dst + size <= src {
            // Disjoint ranges: plain move.
            self.manager.salloc(dst, size)?;
            self.manager.copy_device(src, dst, size)?;
            self.manager.free_device(src)?;
            self.layout.record_alloc_aligned(dst, size, &region.name, 1)?;
            self.layout.record_free(src)?;
        } else {
            // Overlapping ranges: claim the gap, fuse, copy, trim the tail.
            let gap = src - dst;
            self.manager.salloc(dst, gap)?;
            if !self.manager.merge(dst, src) {
                self.manager.free_device(dst)?;
                return Ok(false);
            }
            self.manager.copy_device(src, dst, size)?;
            let right = self.manager.split(dst, size)?;
            self.manager.free_device(right)?;
            self.layout.record_alloc_aligned(dst, gap, &region.name, 1)?;
            self.layout.record_merge(dst, src)?;
            self.layout.record_split(dst, size)?;
            self.layout.record_free(right)?;
        }

        {
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(set) = index.allocated.get_mut(&size) {
                set.remove(&src);
            }
            index.allocated.entry(size).or_default().insert(dst);
            if let Some(set) = index.idle.get_mut(&size) {
                set.remove(&dst);
            }
            index.idle.entry(size).or_default().insert(src);
        }

        tensor.set_moved(section_offset, dst)?;
        debug!(
            target: "executor.defrag",
            tensor = region.name.as_str(),
            src,
            dst,
            size,
            "region compacted"
        );
        Ok(true)
    }
}
