//! Sectioned operation-executor behaviour against the fake manager:
//! piecewise eviction, targeted restore, the relocation fallback, and the
//! checksum swap round-trip.

mod common;

use common::{PlainManager, SectionedManager};
use core_executor::{MemoryManager, MemoryOperationExecutor};
use core_layout::MemoryLayout;
use core_status::{MemoryStatus, SectionStatus, Tensor, TensorKind};
use std::sync::Arc;

fn setup(
    device_capacity: usize,
    tensor_size: usize,
    plan: &[usize],
) -> (Arc<MemoryStatus>, MemoryOperationExecutor, Arc<SectionedManager>) {
    let manager = Arc::new(SectionedManager::new(device_capacity).with_align(1));
    let layout = Arc::new(MemoryLayout::new(&manager.memory_info()));
    let status = Arc::new(MemoryStatus::new());
    let mut tensor = Tensor::new("t", tensor_size, TensorKind::Inout);
    if !plan.is_empty() {
        tensor.apply_section_plan(plan).unwrap();
    }
    status.register_tensor(tensor).unwrap();
    let ops = MemoryOperationExecutor::new(layout, manager.clone() as Arc<dyn MemoryManager>);
    (status, ops, manager)
}

#[test]
fn partial_swap_out_evicts_front_sections() {
    let (status, ops, manager) = setup(8192, 4096, &[1024, 1024, 1024, 1024]);
    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    ops.swap_out(&mut tensor, 3072).unwrap();
    assert_eq!(tensor.device_size(), 1024);
    assert_eq!(tensor.host_size(), 3072);
    assert_eq!(manager.device_in_use(), 1024);
    assert_eq!(manager.host_in_use(), 3072);
    // Allocation collapsed the planned chain; the partial eviction split it
    // back into an evicted front and a resident tail.
    assert_eq!(tensor.section_count(), 2);
    assert!(ops.layout().verify_tiling());
}

#[test]
fn targeted_copy_in_restores_into_old_slots() {
    let (status, ops, manager) = setup(8192, 4096, &[1024, 1024, 1024, 1024]);
    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    ops.swap_out(&mut tensor, 2048).unwrap();
    assert_eq!(tensor.device_size(), 2048);

    // Nothing intrudes into the vacated range, so targeted allocation wins
    // and the tensor reassembles in place.
    ops.swap_in(&mut tensor, 4096).unwrap();
    assert_eq!(tensor.device_size(), 4096);
    assert_eq!(tensor.host_size(), 0);
    assert_eq!(tensor.section_count(), 1);
    assert_eq!(tensor.first_section().status, SectionStatus::Device);
    assert_eq!(manager.device_in_use(), 4096);
    assert_eq!(manager.host_in_use(), 0);
    assert!(ops.layout().verify_tiling());
}

#[test]
fn salloc_failure_relocates_whole_tensor() {
    // 6144 of device: tensor residue (1024) + intruder (2048) leave 3072
    // free, so relocation must first evict the residue.
    let (status, ops, manager) = setup(6144, 4096, &[1024, 1024, 1024, 1024]);
    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    ops.swap_out(&mut tensor, 3072).unwrap();
    assert_eq!(tensor.device_size(), 1024);

    // An intruder claims the vacated front range.
    let intruder = manager.allocate_device(2048).unwrap();
    ops.layout().record_alloc(intruder, 2048, "intruder").unwrap();

    ops.swap_in(&mut tensor, 4096).unwrap();
    assert_eq!(tensor.section_count(), 1, "relocation merges the chain");
    assert_eq!(tensor.first_section().status, SectionStatus::Device);
    assert_eq!(tensor.device_size(), 4096);
    assert_eq!(tensor.host_size(), 0);
    assert_eq!(manager.device_in_use(), 4096 + 2048);
    assert_eq!(manager.host_in_use(), 0);
    assert!(ops.layout().verify_tiling());
}

#[test]
fn swap_round_trip_preserves_payload() {
    let (status, ops, manager) = setup(4096, 1024, &[]);
    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    let device = tensor.first_section().device_address.unwrap();
    manager.write_device(device, 0xFEED_C0DE);

    ops.copy_out(&mut tensor, 1024).unwrap();
    ops.free_device(&mut tensor, 1024).unwrap();
    assert_eq!(tensor.first_section().status, SectionStatus::Host);

    ops.copy_in(&mut tensor, 1024).unwrap();
    ops.free_host(&mut tensor, 1024).unwrap();
    let section = tensor.first_section();
    assert_eq!(section.status, SectionStatus::Device);
    let restored = section.device_address.unwrap();
    assert_eq!(manager.read_device(restored), Some(0xFEED_C0DE));
}

#[test]
fn default_strategy_handles_single_section_tensors() {
    let manager = Arc::new(PlainManager::new(4096));
    let layout = Arc::new(MemoryLayout::new(&manager.memory_info()));
    let status = Arc::new(MemoryStatus::new());
    status
        .register_tensor(Tensor::new("t", 1024, TensorKind::Inout))
        .unwrap();
    let ops = MemoryOperationExecutor::new(layout, manager.clone() as Arc<dyn MemoryManager>);

    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    ops.swap_out(&mut tensor, 1024).unwrap();
    assert_eq!(tensor.first_section().status, SectionStatus::Host);
    assert_eq!(manager.0.device_in_use(), 0);

    ops.swap_in(&mut tensor, 1024).unwrap();
    assert_eq!(tensor.first_section().status, SectionStatus::Device);
    assert_eq!(manager.0.device_in_use(), 1024);
    assert_eq!(manager.0.host_in_use(), 0);
}

#[test]
fn copy_out_splits_at_requested_size() {
    let (status, ops, _manager) = setup(8192, 4096, &[]);
    let mut tensor = status.reference_tensor("t").unwrap();
    ops.allocate(&mut tensor).unwrap();
    tensor.set_assigned().unwrap();

    // Evicting 1000 of 4096 bytes splits the single section.
    ops.swap_out(&mut tensor, 1000).unwrap();
    assert_eq!(tensor.section_count(), 2);
    assert_eq!(tensor.first_section().status, SectionStatus::Host);
    assert_eq!(tensor.first_section().size, 1000);
    assert_eq!(tensor.last_section().status, SectionStatus::Device);
    assert_eq!(tensor.device_size(), 3096);
    assert!(ops.layout().verify_tiling());
}

#[test]
fn fragment_rides_along_with_the_allocation() {
    let (status, ops, manager) = setup(4096, 1024, &[]);
    {
        let mut tensor = status.reference_tensor("t").unwrap();
        tensor.set_fragment_size(512);
        ops.allocate(&mut tensor).unwrap();
        assert!(tensor.fragment().address.is_some(), "fragment placed");
    }
    assert_eq!(manager.device_in_use(), 1024 + 512);
    assert!(ops.layout().verify_tiling());

    let mut tensor = status.reference_tensor("t").unwrap();
    ops.fuse(&mut tensor).unwrap();
    assert!(tensor.fragment().address.is_none());
    assert_eq!(manager.device_in_use(), 1024);

    // Freeing the data range with the fragment still planned but unplaced
    // must not trip over it.
    tensor.set_assigned().unwrap();
    ops.free_device(&mut tensor, 1024).unwrap();
    assert_eq!(manager.device_in_use(), 0);
    assert!(ops.layout().verify_tiling());
}

#[test]
fn oversized_request_is_rejected() {
    let (status, ops, _manager) = setup(8192, 1024, &[]);
    let mut tensor = status.reference_tensor("t").unwrap();
    assert!(ops.copy_in(&mut tensor, 2048).is_err());
}
