//! End-to-end training-loop scenarios: a fitting working set produces no
//! swaps and an empty schedule; a constrained device forces an emergency
//! swap in the profiling iteration and an anchored swap pair afterwards.

mod common;

use common::DemoManager;
use core_config::Context;
use core_events::ScheduleEventKind;
use core_session::{Frontend, SessionError};
use core_status::{Operator, Tensor, TensorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

const OPS: [(&str, &str); 3] = [("o1", "t1"), ("o2", "t2"), ("o3", "t3")];

fn build_frontend(device_capacity: usize) -> (Frontend, Arc<DemoManager>) {
    let manager = Arc::new(DemoManager::new(device_capacity));
    let frontend = Frontend::new(Context::new()).unwrap();
    frontend.set_memory_manager(manager.clone()).unwrap();
    frontend.init().unwrap();
    for (_, tensor) in OPS {
        frontend
            .register_tensor(Tensor::new(tensor, 1024, TensorKind::Inout))
            .unwrap();
    }
    for (i, (op, tensor)) in OPS.iter().enumerate() {
        let mut operator = Operator::new(*op).with_tensor(*tensor);
        if i > 0 {
            operator = operator.with_prev(OPS[i - 1].0);
        }
        if i + 1 < OPS.len() {
            operator = operator.with_post(OPS[i + 1].0);
        }
        frontend.register_operator(operator).unwrap();
    }
    frontend.set_entry("o1").unwrap();
    frontend.start().unwrap();
    (frontend, manager)
}

/// One forward/backward iteration in the shape of the reference demo: each
/// operator allocates, assigns and runs forward; the backward pass re-reads
/// and frees in reverse order.
fn run_iteration(frontend: &Frontend) {
    let session = frontend.session().unwrap();
    session.new_iteration().unwrap();
    for (op, tensor) in OPS {
        session.allocate_memory(op, tensor).unwrap();
        let mut request = session.create_request(op).unwrap();
        request.wait_tensor(tensor).unwrap();
        request.set_memory_data_assigned(tensor).unwrap();
        request.set_operation_started().unwrap();
        request.release().unwrap();
    }
    session.half_iteration().unwrap();
    for (op, tensor) in OPS.iter().rev() {
        let mut request = session.create_request(op).unwrap();
        request.wait_tensor(tensor).unwrap();
        request.set_memory_data_acquired(tensor).unwrap();
        request.set_operation_started().unwrap();
        request.release().unwrap();
        session.free_memory(op, tensor).unwrap();
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[test]
fn fitting_working_set_needs_no_swaps() {
    let (frontend, manager) = build_frontend(4096);
    run_iteration(&frontend);

    let (copied_in, copied_out) = manager.traffic();
    assert_eq!(copied_out, 0, "no eviction should have happened");
    assert_eq!(copied_in, 0);
    assert_eq!(manager.device_in_use(), 0, "backward pass freed everything");

    // Iteration 2: zero deficit means an empty schedule.
    let session = frontend.session().unwrap();
    session.new_iteration().unwrap();
    let bundle = frontend.schedule_events().expect("decision must exist");
    assert!(bundle.is_empty());

    frontend.terminate().unwrap();
}

#[test]
fn constrained_device_forces_emergency_swap_then_planned_pair() {
    let (frontend, manager) = build_frontend(2048);
    let swap_outs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let swap_outs = swap_outs.clone();
        let session = frontend.session().unwrap();
        session.set_callback(
            core_session::CallbackStage::PostSwapOut,
            Box::new(move |_, _| {
                swap_outs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
    }
    run_iteration(&frontend);
    assert_eq!(
        swap_outs.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "the emergency eviction notifies the framework"
    );

    // The third allocate could not fit: t1 went to host and came back in
    // the backward pass.
    let (copied_in, copied_out) = manager.traffic();
    assert_eq!(copied_out, 1024, "exactly one emergency eviction");
    assert_eq!(copied_in, 1024, "the evicted tensor returned");
    assert_eq!(manager.device_in_use(), 0);

    // Iteration 2 start: the FIFO decision converts the deficit into an
    // anchored pair.
    let session = frontend.session().unwrap();
    session.new_iteration().unwrap();
    let bundle = frontend.schedule_events().expect("decision must exist");

    let swapouts = bundle.forward.after("o1");
    assert_eq!(swapouts.len(), 1);
    assert_eq!(swapouts[0].tensor, "t1");
    assert_eq!(swapouts[0].size, 1024);
    assert_eq!(swapouts[0].kind, ScheduleEventKind::Swapout);

    let swapins = bundle.backward.after("o2");
    assert_eq!(swapins.len(), 1);
    assert_eq!(swapins[0].tensor, "t1");
    assert_eq!(swapins[0].kind, ScheduleEventKind::Swapin);

    frontend.terminate().unwrap();
}

#[test]
fn scheduled_iteration_matches_profiled_swap_volume() {
    let (frontend, manager) = build_frontend(2048);
    run_iteration(&frontend);
    let (_, profiled_out) = manager.traffic();

    // Iteration 2 runs under the schedule; the worker performs the planned
    // swap-out after o1 completes, so o3's allocation fits without an
    // emergency.
    {
        let session = frontend.session().unwrap();
        session.new_iteration().unwrap();
        for (op, tensor) in OPS {
            // Give the scheduled eviction a chance to run before the next
            // allocation needs the space.
            if op == "o3" {
                wait_until(Duration::from_secs(2), || manager.device_in_use() <= 1024);
            }
            session.allocate_memory(op, tensor).unwrap();
            let mut request = session.create_request(op).unwrap();
            request.wait_tensor(tensor).unwrap();
            request.set_memory_data_assigned(tensor).unwrap();
            request.set_operation_started().unwrap();
            request.release().unwrap();
        }
        session.half_iteration().unwrap();
        for (op, tensor) in OPS.iter().rev() {
            let mut request = session.create_request(op).unwrap();
            request.wait_tensor(tensor).unwrap();
            request.set_memory_data_acquired(tensor).unwrap();
            request.set_operation_started().unwrap();
            request.release().unwrap();
            session.free_memory(op, tensor).unwrap();
        }
    }

    let (_, total_out) = manager.traffic();
    let scheduled_out = total_out - profiled_out;
    assert_eq!(
        scheduled_out, profiled_out,
        "the planned iteration moves the same volume the emergency did"
    );
    assert_eq!(manager.device_in_use(), 0);
    frontend.terminate().unwrap();
}

#[test]
fn registration_window_is_fenced() {
    let manager = Arc::new(DemoManager::new(4096));
    let frontend = Frontend::new(Context::new()).unwrap();
    frontend.set_memory_manager(manager).unwrap();

    // Registration before init is rejected.
    assert!(matches!(
        frontend.register_tensor(Tensor::new("t", 64, TensorKind::Inout)),
        Err(SessionError::Uninited)
    ));

    frontend.init().unwrap();
    frontend
        .register_tensor(Tensor::new("t", 64, TensorKind::Inout))
        .unwrap();
    frontend
        .register_operator(Operator::new("o").with_tensor("t"))
        .unwrap();
    frontend.start().unwrap();

    // And after start as well.
    assert!(matches!(
        frontend.register_tensor(Tensor::new("u", 64, TensorKind::Inout)),
        Err(SessionError::Inited)
    ));
    frontend.terminate().unwrap();
}

#[test]
fn session_requires_started_frontend() {
    let manager = Arc::new(DemoManager::new(4096));
    let frontend = Frontend::new(Context::new()).unwrap();
    frontend.set_memory_manager(manager).unwrap();
    frontend.init().unwrap();
    assert!(matches!(frontend.session(), Err(SessionError::Uninited)));
}
