//! Tensors and their memory sections.
//!
//! A tensor's payload is tracked as an ordered, gap-free list of sections
//! covering `[0, size)`. Each section moves through the residence state
//! machine independently, which is what lets the executor swap a tensor in
//! and out piecewise. Sections are stored in one vector ordered by offset;
//! neighbour links are positional rather than owning pointers, so splitting
//! and merging are vector insert/remove operations.
//!
//! Residence transitions are enforced here, exhaustively; every caller path
//! (session, schedule worker, defragmenter) goes through these methods, so an
//! illegal transition can only surface as an error, never as silently
//! corrupted bookkeeping.

use crate::{StatusError, StatusResult};

/// Payload category declared by the framework at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorKind {
    #[default]
    Inout,
    Weight,
    Workspace,
    Constant,
}

impl TensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorKind::Inout => "inout",
            TensorKind::Weight => "weight",
            TensorKind::Workspace => "workspace",
            TensorKind::Constant => "constant",
        }
    }
}

/// Residence of one section.
///
/// `Empty` means device memory is allocated but the framework has not
/// declared a write yet; it carries a device address like `Device` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectionStatus {
    #[default]
    None,
    Empty,
    Device,
    Host,
    Coexist,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySection {
    pub offset: usize,
    pub size: usize,
    pub status: SectionStatus,
    pub device_address: Option<usize>,
    pub host_address: Option<usize>,
}

impl MemorySection {
    fn new(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            ..Self::default()
        }
    }

    /// Whether the section occupies device memory (allocated or written).
    pub fn on_device(&self) -> bool {
        matches!(
            self.status,
            SectionStatus::Empty | SectionStatus::Device | SectionStatus::Coexist
        )
    }

    /// Whether the section has a host copy.
    pub fn on_host(&self) -> bool {
        matches!(self.status, SectionStatus::Host | SectionStatus::Coexist)
    }
}

/// Trailing padding reserved after the last section to round the tensor's
/// device footprint up to an allocator-friendly boundary. Carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentStatus {
    #[default]
    None,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub size: usize,
    pub address: Option<usize>,
    pub status: FragmentStatus,
}

#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    size: usize,
    kind: TensorKind,
    persistent: bool,
    transient: bool,

    sections: Vec<MemorySection>,
    fragment: Fragment,
}

impl Tensor {
    pub fn new(name: impl Into<String>, size: usize, kind: TensorKind) -> Self {
        Self {
            name: name.into(),
            size,
            kind,
            persistent: false,
            transient: false,
            sections: vec![MemorySection::new(0, size)],
            fragment: Fragment::default(),
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    // ---- section access ------------------------------------------------

    pub fn sections(&self) -> impl Iterator<Item = &MemorySection> {
        self.sections.iter()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn first_section(&self) -> &MemorySection {
        // The chain is never empty: construction seeds one section and merge
        // only ever removes the second of a pair.
        &self.sections[0]
    }

    pub fn last_section(&self) -> &MemorySection {
        &self.sections[self.sections.len() - 1]
    }

    fn index_of(&self, offset: usize) -> StatusResult<usize> {
        self.sections
            .binary_search_by_key(&offset, |s| s.offset)
            .map_err(|_| {
                StatusError::SectionInvalid(format!(
                    "tensor {} has no section at offset {offset}",
                    self.name
                ))
            })
    }

    pub fn section(&self, offset: usize) -> StatusResult<&MemorySection> {
        self.index_of(offset).map(|i| &self.sections[i])
    }

    pub fn next_section(&self, offset: usize) -> StatusResult<Option<&MemorySection>> {
        let i = self.index_of(offset)?;
        Ok(self.sections.get(i + 1))
    }

    pub fn prev_section(&self, offset: usize) -> StatusResult<Option<&MemorySection>> {
        let i = self.index_of(offset)?;
        Ok(if i == 0 {
            None
        } else {
            self.sections.get(i - 1)
        })
    }

    /// Bytes currently occupying device memory.
    pub fn device_size(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.on_device())
            .map(|s| s.size)
            .sum()
    }

    /// Bytes currently copied to host memory.
    pub fn host_size(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.on_host())
            .map(|s| s.size)
            .sum()
    }

    pub fn is_device_located(&self) -> bool {
        self.sections.iter().any(|s| s.on_device())
    }

    pub fn is_device_all_located(&self) -> bool {
        self.sections.iter().all(|s| s.on_device())
    }

    /// All sections back to `None`: the tensor holds no memory anywhere.
    pub fn is_unlocated(&self) -> bool {
        self.sections
            .iter()
            .all(|s| s.status == SectionStatus::None)
    }

    // ---- residence transitions ----------------------------------------

    /// `none → empty`: device memory allocated for the whole tensor.
    pub fn set_allocated(&mut self, device_address: usize) -> StatusResult<()> {
        if self.sections.len() != 1 || self.sections[0].status != SectionStatus::None {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} cannot be allocated in its current state",
                self.name
            )));
        }
        let section = &mut self.sections[0];
        section.status = SectionStatus::Empty;
        section.device_address = Some(device_address);
        Ok(())
    }

    /// `empty → device` for every section: the framework declared the write.
    pub fn set_assigned(&mut self) -> StatusResult<()> {
        if self
            .sections
            .iter()
            .any(|s| s.status != SectionStatus::Empty)
        {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} has unallocated or already-assigned sections",
                self.name
            )));
        }
        for section in &mut self.sections {
            section.status = SectionStatus::Device;
        }
        Ok(())
    }

    /// Reaffirm device residence for a read. No transition, only a check.
    pub fn set_acquired(&self) -> StatusResult<()> {
        if self.is_device_all_located() {
            Ok(())
        } else {
            Err(StatusError::TensorInvalid(format!(
                "tensor {} accessed while not resident on device",
                self.name
            )))
        }
    }

    /// `host → coexist` (data copied in) or `none → empty` (space allocated
    /// without data, as the relocation path does for untouched sections).
    pub fn set_copied_in(&mut self, offset: usize, device_address: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &mut self.sections[i];
        match section.status {
            SectionStatus::Host => {
                section.status = SectionStatus::Coexist;
                section.device_address = Some(device_address);
                Ok(())
            }
            SectionStatus::None => {
                section.status = SectionStatus::Empty;
                section.device_address = Some(device_address);
                Ok(())
            }
            _ => Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} cannot be copied in",
                self.name
            ))),
        }
    }

    /// `device → coexist`: a host copy now exists.
    pub fn set_copied_out(&mut self, offset: usize, host_address: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &mut self.sections[i];
        match section.status {
            SectionStatus::Device => {
                section.status = SectionStatus::Coexist;
                section.host_address = Some(host_address);
                Ok(())
            }
            _ => Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} cannot be copied out",
                self.name
            ))),
        }
    }

    /// `empty/device → none`, `coexist → host`: device copy released.
    pub fn set_device_freed(&mut self, offset: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &mut self.sections[i];
        match section.status {
            SectionStatus::Empty | SectionStatus::Device => {
                section.status = SectionStatus::None;
                section.device_address = None;
                Ok(())
            }
            SectionStatus::Coexist => {
                section.status = SectionStatus::Host;
                section.device_address = None;
                Ok(())
            }
            _ => Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} holds no device memory",
                self.name
            ))),
        }
    }

    /// `host → none`, `coexist → device`: host copy released.
    pub fn set_host_freed(&mut self, offset: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &mut self.sections[i];
        match section.status {
            SectionStatus::Host => {
                section.status = SectionStatus::None;
                section.host_address = None;
                Ok(())
            }
            SectionStatus::Coexist => {
                section.status = SectionStatus::Device;
                section.host_address = None;
                Ok(())
            }
            _ => Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} holds no host memory",
                self.name
            ))),
        }
    }

    /// Device data relocated; residence unchanged.
    pub fn set_moved(&mut self, offset: usize, device_address: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &mut self.sections[i];
        if section.device_address.is_none() {
            return Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} moved while not on device",
                self.name
            )));
        }
        section.device_address = Some(device_address);
        Ok(())
    }

    // ---- splitting and merging ----------------------------------------

    /// Replace the section at `offset` with two contiguous sections of sizes
    /// `k` and `size - k`. Addresses advance by `k` on the right half.
    pub fn split(&mut self, offset: usize, k: usize) -> StatusResult<()> {
        let i = self.index_of(offset)?;
        let section = &self.sections[i];
        if k == 0 || k >= section.size {
            return Err(StatusError::SectionInvalid(format!(
                "tensor {} section {offset} (size {}) cannot split at {k}",
                self.name, section.size
            )));
        }
        let mut right = self.sections[i].clone();
        right.offset = offset + k;
        right.size -= k;
        right.device_address = right.device_address.map(|a| a + k);
        right.host_address = right.host_address.map(|a| a + k);
        let left = &mut self.sections[i];
        left.size = k;
        self.sections.insert(i + 1, right);
        Ok(())
    }

    /// Whether the section at `offset` can merge with its successor: equal
    /// status, and each address pair either absent on both sides or
    /// physically contiguous.
    pub fn is_mergeable(&self, offset: usize) -> bool {
        let Ok(i) = self.index_of(offset) else {
            return false;
        };
        let Some(next) = self.sections.get(i + 1) else {
            return false;
        };
        let section = &self.sections[i];
        if section.status != next.status {
            return false;
        }
        let contiguous = |a: Option<usize>, b: Option<usize>, size: usize| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a + size == b,
            _ => false,
        };
        contiguous(section.device_address, next.device_address, section.size)
            && contiguous(section.host_address, next.host_address, section.size)
    }

    /// Collapse the section at `offset` with its successor. Returns the
    /// offset of the merged section (unchanged).
    pub fn merge(&mut self, offset: usize) -> StatusResult<usize> {
        if !self.is_mergeable(offset) {
            return Err(StatusError::SectionInvalid(format!(
                "tensor {} sections at {offset} are not mergeable",
                self.name
            )));
        }
        let i = self.index_of(offset)?;
        let next = self.sections.remove(i + 1);
        self.sections[i].size += next.size;
        Ok(offset)
    }

    // ---- fragment ------------------------------------------------------

    pub fn has_fragment(&self) -> bool {
        self.fragment.size > 0
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    /// Planner-decided fragment size. Only meaningful before execution.
    pub fn set_fragment_size(&mut self, size: usize) {
        self.fragment.size = size;
        if size == 0 {
            self.fragment.address = None;
            self.fragment.status = FragmentStatus::None;
        }
    }

    pub fn set_fragment_placed(&mut self, address: usize) -> StatusResult<()> {
        if !self.has_fragment() || self.fragment.status == FragmentStatus::Empty {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} has no fragment to place",
                self.name
            )));
        }
        self.fragment.address = Some(address);
        self.fragment.status = FragmentStatus::Empty;
        Ok(())
    }

    pub fn set_fragment_removed(&mut self) -> StatusResult<()> {
        if self.fragment.status != FragmentStatus::Empty {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} has no placed fragment",
                self.name
            )));
        }
        self.fragment.address = None;
        self.fragment.status = FragmentStatus::None;
        Ok(())
    }

    /// Apply the planner's section split plan: section sizes from offset 0.
    /// Only valid while the tensor is unlocated.
    pub fn apply_section_plan(&mut self, sizes: &[usize]) -> StatusResult<()> {
        if !self.is_unlocated() {
            return Err(StatusError::TensorInvalid(format!(
                "tensor {} is live; section plan rejected",
                self.name
            )));
        }
        if sizes.iter().sum::<usize>() != self.size || sizes.iter().any(|&s| s == 0) {
            return Err(StatusError::SectionInvalid(format!(
                "section plan does not tile tensor {}",
                self.name
            )));
        }
        let mut offset = 0;
        self.sections = sizes
            .iter()
            .map(|&size| {
                let section = MemorySection::new(offset, size);
                offset += size;
                section
            })
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage_holds(tensor: &Tensor) {
        let mut expected = 0;
        for section in tensor.sections() {
            assert_eq!(section.offset, expected, "gap or overlap in chain");
            assert!(section.size > 0);
            expected += section.size;
        }
        assert_eq!(expected, tensor.size());
    }

    #[test]
    fn allocate_assign_free_cycle() {
        let mut t = Tensor::new("t", 1024, TensorKind::Inout);
        t.set_allocated(0x1000).unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Empty);
        t.set_assigned().unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Device);
        t.set_device_freed(0).unwrap();
        assert!(t.is_unlocated());
        coverage_holds(&t);
    }

    #[test]
    fn swap_round_trip() {
        let mut t = Tensor::new("t", 512, TensorKind::Inout);
        t.set_allocated(0x2000).unwrap();
        t.set_assigned().unwrap();

        t.set_copied_out(0, 0x8000).unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Coexist);
        t.set_device_freed(0).unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Host);
        assert_eq!(t.first_section().device_address, None);

        t.set_copied_in(0, 0x3000).unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Coexist);
        t.set_host_freed(0).unwrap();
        assert_eq!(t.first_section().status, SectionStatus::Device);
        assert_eq!(t.first_section().device_address, Some(0x3000));
        assert_eq!(t.first_section().host_address, None);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut t = Tensor::new("t", 256, TensorKind::Inout);
        assert!(t.set_assigned().is_err());
        assert!(t.set_copied_out(0, 0x1).is_err());
        t.set_allocated(0x100).unwrap();
        assert!(t.set_allocated(0x100).is_err());
        assert!(t.set_host_freed(0).is_err());
    }

    #[test]
    fn split_then_merge_restores_section() {
        let mut t = Tensor::new("t", 1024, TensorKind::Inout);
        t.set_allocated(0x4000).unwrap();
        t.set_assigned().unwrap();

        t.split(0, 256).unwrap();
        assert_eq!(t.section_count(), 2);
        coverage_holds(&t);
        assert_eq!(t.section(256).unwrap().device_address, Some(0x4100));

        assert!(t.is_mergeable(0));
        t.merge(0).unwrap();
        assert_eq!(t.section_count(), 1);
        assert_eq!(t.first_section().size, 1024);
        coverage_holds(&t);
    }

    #[test]
    fn merge_requires_contiguity_and_status() {
        let mut t = Tensor::new("t", 1024, TensorKind::Inout);
        t.set_allocated(0x4000).unwrap();
        t.set_assigned().unwrap();
        t.split(0, 512).unwrap();

        // Same status, contiguous: mergeable.
        assert!(t.is_mergeable(0));

        // Move the right half elsewhere: no longer contiguous.
        t.set_moved(512, 0x9000).unwrap();
        assert!(!t.is_mergeable(0));

        // Free one side: statuses diverge.
        t.set_moved(512, 0x4200).unwrap();
        t.set_device_freed(0).unwrap();
        assert!(!t.is_mergeable(0));
    }

    #[test]
    fn section_plan_tiles() {
        let mut t = Tensor::new("t", 1000, TensorKind::Inout);
        t.apply_section_plan(&[400, 400, 200]).unwrap();
        assert_eq!(t.section_count(), 3);
        coverage_holds(&t);
        assert!(t.apply_section_plan(&[400, 400]).is_err());
    }

    #[test]
    fn partial_swap_keeps_coverage() {
        let mut t = Tensor::new("t", 4096, TensorKind::Inout);
        t.apply_section_plan(&[1024, 1024, 1024, 1024]).unwrap();
        for (i, offset) in [0usize, 1024, 2048, 3072].iter().enumerate() {
            t.set_copied_in(*offset, 0x1000 + i * 1024).unwrap();
        }
        t.set_assigned().unwrap();

        // Evict the middle two sections.
        t.set_copied_out(1024, 0x8000).unwrap();
        t.set_device_freed(1024).unwrap();
        t.set_copied_out(2048, 0x9000).unwrap();
        t.set_device_freed(2048).unwrap();

        assert_eq!(t.device_size(), 2048);
        assert_eq!(t.host_size(), 2048);
        assert!(!t.is_device_all_located());
        assert!(t.is_device_located());
        coverage_holds(&t);
    }
}
