//! Realisation of copy / free / fragment operations on a single tensor.
//!
//! Two strategies share one entry surface, selected once by the manager's
//! `supports_sections` capability:
//!
//! - the **default** strategy treats every tensor as one section and maps
//!   each operation directly onto the residence state machine;
//! - the **sectioned** strategy walks the section chain: copy-in from the
//!   last section backward so the most recently evicted data returns first,
//!   copy-out and free-device forward, free-host backward. It uses targeted
//!   allocation to restore sections into their old neighbourhood and falls
//!   back to relocating the whole tensor into one fresh contiguous range
//!   when a targeted allocation fails.
//!
//! Every path keeps the layout records and the section state machine in
//! sync, and nothing is recorded until the manager call it mirrors has
//! succeeded.

use crate::MemoryManager;
use core_layout::{MemoryError, MemoryLayout};
use core_status::{SectionStatus, StatusError, TensorPres};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Status(#[from] StatusError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

pub struct MemoryOperationExecutor {
    layout: Arc<MemoryLayout>,
    manager: Arc<dyn MemoryManager>,
    sectioned: bool,
}

impl MemoryOperationExecutor {
    pub fn new(layout: Arc<MemoryLayout>, manager: Arc<dyn MemoryManager>) -> Self {
        let sectioned = manager.supports_sections();
        Self {
            layout,
            manager,
            sectioned,
        }
    }

    pub fn manager(&self) -> &Arc<dyn MemoryManager> {
        &self.manager
    }

    pub fn layout(&self) -> &Arc<MemoryLayout> {
        &self.layout
    }

    /// Whether the sectioned strategy is active.
    pub fn is_sectioned(&self) -> bool {
        self.sectioned
    }

    fn check_size(tensor: &TensorPres, size: usize, verb: &str) -> ExecutorResult<()> {
        if tensor.size() < size {
            return Err(StatusError::TensorInvalid(format!(
                "{verb} size {size} larger than tensor {} ({})",
                tensor.name(),
                tensor.size()
            ))
            .into());
        }
        Ok(())
    }

    // ---- public surface -------------------------------------------------

    /// Device allocation for the whole tensor (`none → empty` per section).
    /// The chain collapses to one section; partial operations re-split it.
    pub fn allocate(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        let base = self.manager.allocate_device(tensor.size())?;
        self.layout.record_alloc(base, tensor.size(), &tensor.name())?;
        for section in tensor.sections() {
            tensor.set_copied_in(section.offset, base + section.offset)?;
        }
        let mut offset = tensor.first_section().offset;
        while tensor.is_mergeable(offset) {
            offset = tensor.merge(offset)?;
        }
        // Planned trailing padding is reserved together with the data range
        // when the manager can target it; a full allocator is tolerable.
        if self.sectioned && tensor.has_fragment() && tensor.fragment().address.is_none() {
            if let Err(error) = self.fragment(tensor) {
                debug!(
                    target: "executor.op",
                    tensor = tensor.name().as_str(),
                    %error,
                    "fragment not placed"
                );
            }
        }
        trace!(target: "executor.op", tensor = tensor.name().as_str(), base, "allocated");
        Ok(())
    }

    /// Copy tensor data host → device, `size` bytes, most recent first.
    pub fn copy_in(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        Self::check_size(tensor, size, "copy-in")?;
        if self.sectioned {
            self.copy_in_sectioned(tensor, size)
        } else {
            self.copy_in_default(tensor)
        }
    }

    /// Copy tensor data device → host, `size` bytes, front first.
    pub fn copy_out(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        Self::check_size(tensor, size, "copy-out")?;
        if self.sectioned {
            self.copy_out_sectioned(tensor, size)
        } else {
            self.copy_out_default(tensor)
        }
    }

    /// Release device memory, front first.
    pub fn free_device(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        Self::check_size(tensor, size, "free")?;
        if self.sectioned {
            self.free_device_sectioned(tensor, size)
        } else {
            self.free_device_default(tensor)
        }
    }

    /// Release host memory, back first.
    pub fn free_host(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        Self::check_size(tensor, size, "free")?;
        if self.sectioned {
            self.free_host_sectioned(tensor, size)
        } else {
            self.free_host_default(tensor)
        }
    }

    pub fn swap_in(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        self.copy_in(tensor, size)?;
        self.free_host(tensor, size)
    }

    pub fn swap_out(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        self.copy_out(tensor, size)?;
        self.free_device(tensor, size)
    }

    pub fn free(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        self.free_device(tensor, size)?;
        self.free_host(tensor, size)
    }

    /// Reserve the tensor's trailing fragment region.
    pub fn fragment(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        if !tensor.has_fragment() {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} requests no fragment",
                tensor.name()
            ))
            .into());
        }
        let first = tensor.first_section();
        let base = first.device_address.ok_or_else(|| {
            StatusError::TensorInvalid(format!(
                "tensor {} not on device; fragment unplaceable",
                tensor.name()
            ))
        })?;
        let target = base + tensor.size();
        let fragment_size = tensor.fragment().size;
        let address = self.manager.salloc(target, fragment_size)?;
        self.layout
            .record_alloc_aligned(address, fragment_size, &tensor.name(), 1)?;
        tensor.set_fragment_placed(address)?;
        Ok(())
    }

    /// Release the fragment region back to the allocator.
    pub fn fuse(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        if !tensor.has_fragment() {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} requests no fragment",
                tensor.name()
            ))
            .into());
        }
        if let Some(address) = tensor.fragment().address {
            self.layout.record_free(address)?;
            self.manager.free_device(address)?;
            tensor.set_fragment_removed()?;
        }
        Ok(())
    }

    // ---- default (single-section) strategy ------------------------------

    fn copy_in_default(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        let section = tensor.first_section();
        match section.status {
            SectionStatus::None | SectionStatus::Host => {
                let address = self.manager.allocate_device(section.size)?;
                self.layout
                    .record_alloc(address, section.size, &tensor.name())?;
                if let Some(host) = section.host_address {
                    self.manager.copy_in(host, address, section.size)?;
                }
                tensor.set_copied_in(section.offset, address)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn copy_out_default(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        let section = tensor.first_section();
        if section.status == SectionStatus::Device {
            let device = section.device_address.ok_or_else(|| {
                StatusError::SectionInvalid("device section without address".to_string())
            })?;
            let host = self.manager.allocate_host(section.size)?;
            self.manager.copy_out(device, host, section.size)?;
            tensor.set_copied_out(section.offset, host)?;
        }
        Ok(())
    }

    fn free_device_default(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        let section = tensor.first_section();
        if section.on_device() {
            let device = section.device_address.ok_or_else(|| {
                StatusError::SectionInvalid("device section without address".to_string())
            })?;
            self.layout.record_free(device)?;
            self.manager.free_device(device)?;
            tensor.set_device_freed(section.offset)?;
        }
        Ok(())
    }

    fn free_host_default(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        let section = tensor.first_section();
        if section.on_host() {
            let host = section.host_address.ok_or_else(|| {
                StatusError::SectionInvalid("host section without address".to_string())
            })?;
            self.manager.free_host(host)?;
            tensor.set_host_freed(section.offset)?;
        }
        Ok(())
    }

    // ---- sectioned strategy ---------------------------------------------

    /// Device slot a section should return to, derived from the neighbouring
    /// sections still on device.
    fn section_device_target(tensor: &TensorPres, offset: usize) -> ExecutorResult<Option<usize>> {
        let section = tensor.section(offset)?;
        if let Some(next) = tensor.next_section(offset)? {
            if let Some(address) = next.device_address {
                return Ok(Some(address.saturating_sub(section.size)));
            }
        }
        if let Some(prev) = tensor.prev_section(offset)? {
            if let Some(address) = prev.device_address {
                return Ok(Some(address + prev.size));
            }
        }
        Ok(None)
    }

    /// Swap the tensor's device residue out and bring the whole tensor back
    /// into one fresh contiguous range, merging the chain to one section.
    fn relocate(&self, tensor: &mut TensorPres) -> ExecutorResult<()> {
        debug!(target: "executor.op", tensor = tensor.name().as_str(), "relocating");
        let total = tensor.size();
        let base = match self.manager.allocate_device(total) {
            Ok(base) => base,
            Err(_) => {
                let residue = tensor.device_size();
                if residue != 0 {
                    self.swap_out(tensor, residue)?;
                }
                self.manager
                    .allocate_device(total)
                    .map_err(|_| MemoryError::DeviceInsufficient(total))?
            }
        };
        self.layout.record_alloc(base, total, &tensor.name())?;

        // The fragment, if placed, does not survive relocation.
        if tensor.has_fragment() {
            if let Some(address) = tensor.fragment().address {
                self.layout.record_free(address)?;
                self.manager.free_device(address)?;
                tensor.set_fragment_removed()?;
            }
        }

        let mut cursor = base;
        let mut offset = Some(tensor.first_section().offset);
        while let Some(current) = offset {
            let section = tensor.section(current)?;
            let size = section.size;
            match section.status {
                SectionStatus::Empty => {
                    if let Some(device) = section.device_address {
                        self.layout.record_free(device)?;
                        self.manager.free_device(device)?;
                    }
                    tensor.set_device_freed(current)?;
                    tensor.set_copied_in(current, cursor)?;
                }
                SectionStatus::None => {
                    tensor.set_copied_in(current, cursor)?;
                }
                SectionStatus::Host => {
                    let host = section.host_address.ok_or_else(|| {
                        StatusError::SectionInvalid("host section without address".to_string())
                    })?;
                    self.manager.copy_in(host, cursor, size)?;
                    tensor.set_copied_in(current, cursor)?;
                }
                SectionStatus::Device | SectionStatus::Coexist => {
                    let device = section.device_address.ok_or_else(|| {
                        StatusError::SectionInvalid("device section without address".to_string())
                    })?;
                    self.manager.copy_device(device, cursor, size)?;
                    self.layout.record_free(device)?;
                    self.manager.free_device(device)?;
                    tensor.set_moved(current, cursor)?;
                }
            }
            cursor += size;

            // Fold the chain as it lands in the contiguous range; where the
            // statuses differ the manager-side region is split to match the
            // section boundary instead.
            let mut current = current;
            if let Some(prev) = tensor.prev_section(current)? {
                let prev_offset = prev.offset;
                let prev_size = prev.size;
                let prev_device = prev.device_address;
                if tensor.is_mergeable(prev_offset) {
                    current = tensor.merge(prev_offset)?;
                } else if let Some(prev_device) = prev_device {
                    self.manager.split(prev_device, prev_size)?;
                    self.layout.record_split(prev_device, prev_size)?;
                }
            }
            offset = tensor.next_section(current)?.map(|s| s.offset);
        }
        Ok(())
    }

    fn copy_in_sectioned(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        let mut copied = 0usize;
        let mut offset = Some(tensor.last_section().offset);
        while let Some(mut current) = offset {
            let section = tensor.section(current)?;
            let section_size = section.size;
            match section.status {
                SectionStatus::None | SectionStatus::Host => {
                    // Quick path: the whole tensor went to host, so targeted
                    // allocation has nothing to anchor on.
                    if tensor.size() == size && tensor.device_size() == 0 {
                        return self.relocate(tensor);
                    }
                    let Some(target) = Self::section_device_target(tensor, current)? else {
                        return self.relocate(tensor);
                    };
                    let address = match self.manager.salloc(target, section_size) {
                        Ok(address) => address,
                        Err(_) => return self.relocate(tensor),
                    };
                    self.layout
                        .record_alloc_aligned(address, section_size, &tensor.name(), 1)?;
                    if let Some(host) = tensor.section(current)?.host_address {
                        self.manager.copy_in(host, address, section_size)?;
                    }
                    tensor.set_copied_in(current, address)?;

                    // Stitch the restored section to its neighbours.
                    if tensor.is_mergeable(current) {
                        if self.manager.merge(address, address + section_size) {
                            self.layout.record_merge(address, address + section_size)?;
                            tensor.merge(current)?;
                        }
                    }
                    if let Some(prev) = tensor.prev_section(current)? {
                        let prev_offset = prev.offset;
                        let prev_device = prev.device_address;
                        if tensor.is_mergeable(prev_offset) {
                            if let Some(prev_device) = prev_device {
                                if self.manager.merge(prev_device, address) {
                                    self.layout.record_merge(prev_device, address)?;
                                    current = tensor.merge(prev_offset)?;
                                }
                            }
                        }
                    }
                    copied += section_size;
                }
                SectionStatus::Coexist | SectionStatus::Empty | SectionStatus::Device => {
                    copied += section_size;
                }
            }
            if copied >= size {
                return Ok(());
            }
            offset = tensor.prev_section(current)?.map(|s| s.offset);
        }
        Ok(())
    }

    fn copy_out_sectioned(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        let mut copied = 0usize;
        let mut offset = Some(tensor.first_section().offset);
        while let Some(current) = offset {
            let section = tensor.section(current)?;
            if section.status == SectionStatus::Device {
                let device = section.device_address.ok_or_else(|| {
                    StatusError::SectionInvalid("device section without address".to_string())
                })?;
                // Only `size` bytes leave; split the straddling section.
                if copied + section.size > size {
                    let keep = size - copied;
                    self.manager.split(device, keep)?;
                    self.layout.record_split(device, keep)?;
                    tensor.split(current, keep)?;
                }
                let section = tensor.section(current)?;
                let host = self.manager.allocate_host(section.size)?;
                self.manager.copy_out(device, host, section.size)?;
                tensor.set_copied_out(current, host)?;
                copied += section.size;
                if copied >= size {
                    return Ok(());
                }
            }
            offset = tensor.next_section(current)?.map(|s| s.offset);
        }
        Ok(())
    }

    fn free_device_sectioned(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        let mut freed = 0usize;
        let mut offset = Some(tensor.first_section().offset);
        while let Some(mut current) = offset {
            let section = tensor.section(current)?;
            let section_size = section.size;
            if section.on_device() {
                let device = section.device_address.ok_or_else(|| {
                    StatusError::SectionInvalid("device section without address".to_string())
                })?;
                self.layout.record_free(device)?;
                self.manager.free_device(device)?;
                tensor.set_device_freed(current)?;

                if tensor.is_mergeable(current) {
                    tensor.merge(current)?;
                }
                if let Some(prev) = tensor.prev_section(current)? {
                    if tensor.is_mergeable(prev.offset) {
                        current = tensor.merge(prev.offset)?;
                    }
                }
                freed += section_size;
            }
            if freed >= size {
                break;
            }
            offset = tensor.next_section(current)?.map(|s| s.offset);
        }

        // With no device bytes left, the fragment has nothing to pad.
        if tensor.device_size() == 0 && tensor.has_fragment() {
            if let Some(address) = tensor.fragment().address {
                self.layout.record_free(address)?;
                self.manager.free_device(address)?;
                tensor.set_fragment_removed()?;
            }
        }
        Ok(())
    }

    fn free_host_sectioned(&self, tensor: &mut TensorPres, size: usize) -> ExecutorResult<()> {
        let mut freed = 0usize;
        let mut offset = Some(tensor.last_section().offset);
        while let Some(mut current) = offset {
            let section = tensor.section(current)?;
            let section_size = section.size;
            if section.on_host() {
                let host = section.host_address.ok_or_else(|| {
                    StatusError::SectionInvalid("host section without address".to_string())
                })?;
                self.manager.free_host(host)?;
                tensor.set_host_freed(current)?;
                freed += section_size;

                // Device-resident halves may now merge on both levels.
                if tensor.is_mergeable(current) {
                    let section = tensor.section(current)?;
                    if let (Some(device), Some(next)) =
                        (section.device_address, tensor.next_section(current)?)
                    {
                        if let Some(next_device) = next.device_address {
                            if self.manager.merge(device, next_device) {
                                self.layout.record_merge(device, next_device)?;
                                tensor.merge(current)?;
                            }
                        }
                    } else {
                        tensor.merge(current)?;
                    }
                }
                if let Some(prev) = tensor.prev_section(current)? {
                    let prev_offset = prev.offset;
                    if tensor.is_mergeable(prev_offset) {
                        let prev_device = prev.device_address;
                        let current_device = tensor.section(current)?.device_address;
                        match (prev_device, current_device) {
                            (Some(left), Some(right)) => {
                                if self.manager.merge(left, right) {
                                    self.layout.record_merge(left, right)?;
                                    current = tensor.merge(prev_offset)?;
                                }
                            }
                            _ => {
                                current = tensor.merge(prev_offset)?;
                            }
                        }
                    }
                }
                if freed >= size {
                    return Ok(());
                }
            }
            offset = tensor.prev_section(current)?.map(|s| s.offset);
        }
        Ok(())
    }
}
