//! The FIFO swap policy.
//!
//! Iteration 1 is the profiling pass: the scheduler stays silent and lets the
//! session pay for shortfalls with emergency swaps. At the start of iteration
//! 2 the policy reads the iteration-1 history and converts the emergency
//! volume into planned swaps: the earliest forward tensors are swapped out
//! after their last forward touch and brought back just before their first
//! backward touch. Later iterations reuse the decision.

use crate::time_model::{TimeModel, Timespan, TransferringModel};
use crate::{LayoutModel, MemoryScheduler, SchedulerResult};
use core_events::{
    EventStore, MemoryEventKind, ScheduleEvent, ScheduleEventKind, ScheduleEvents, Stage,
};
use core_status::{MemoryInfo, MemoryStatus};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// How the executor is told to fire events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Dependency,
    Time,
}

#[derive(Default)]
struct FifoState {
    decided: bool,
    bundle: Option<ScheduleEvents>,
    memory_info: Option<MemoryInfo>,
}

pub struct FifoScheduler {
    status: Arc<MemoryStatus>,
    events: Arc<EventStore>,
    trigger: TriggerMode,
    smin: usize,
    state: Mutex<FifoState>,
}

impl FifoScheduler {
    pub fn new(
        status: Arc<MemoryStatus>,
        events: Arc<EventStore>,
        trigger: TriggerMode,
        smin: usize,
    ) -> Self {
        Self {
            status,
            events,
            trigger,
            smin,
            state: Mutex::new(FifoState::default()),
        }
    }

    fn decide(&self, state: &mut FifoState) -> SchedulerResult<()> {
        let iter1 = self.events.select().where_(|(i, _)| *i == 1).get();
        let unmet: usize = iter1
            .select()
            .where_(|(_, e)| e.kind == MemoryEventKind::Swapout)
            .get()
            .iter()
            .map(|(_, e)| e.size)
            .sum();

        let mut bundle = ScheduleEvents::default();
        if let Some(info) = &state.memory_info {
            let mut model =
                LayoutModel::new(info.device.common_block.size).with_smin(self.smin);
            model.analyze(&self.status, info.device.align_size)?;
            bundle.memory_map = model.memory_map()?;
        }

        if unmet == 0 {
            debug!(target: "scheduler.fifo", "no deficit observed; schedule is empty");
            state.bundle = Some(bundle);
            state.decided = true;
            return Ok(());
        }

        // Candidate tensors: earliest forward tensors first, until the
        // deficit is covered. Ties inside one operator break on tensor name.
        let mut candidates: Vec<(String, usize)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut covered = 0usize;
        'walk: for op_name in self.status.execution_order() {
            let op = self.status.snapshot_operator(&op_name)?;
            if op.is_backward_propagation() {
                continue;
            }
            let mut tensor_names = op.tensors().to_vec();
            tensor_names.sort();
            for tensor_name in tensor_names {
                if !seen.insert(tensor_name.clone()) {
                    continue;
                }
                let tensor = self.status.snapshot_tensor(&tensor_name)?;
                if tensor.is_persistent() || tensor.is_transient() {
                    continue;
                }
                covered += tensor.size();
                candidates.push((tensor_name, tensor.size()));
                if covered >= unmet {
                    break 'walk;
                }
            }
        }

        let mut released = 0usize;
        for (tensor_name, size) in candidates {
            let swap_size = size.min(unmet - released);

            let forward_name = tensor_name.clone();
            let forward_touches = iter1
                .select()
                .where_(move |(_, e)| {
                    e.stage == Stage::Forward && e.tensor == forward_name && !e.kind.is_swap()
                })
                .get();
            let Some((_, last_forward)) = forward_touches.last() else {
                continue;
            };
            let op_f = last_forward.op.clone();

            let backward_name = tensor_name.clone();
            let backward_touches = iter1
                .select()
                .where_(move |(_, e)| {
                    e.stage == Stage::Backward && e.tensor == backward_name && !e.kind.is_swap()
                })
                .get();
            let swapin_post = backward_touches
                .first()
                .and_then(|(_, e)| self.status.execution_post(&e.op));

            // A pair anchored on one operator would swap out and straight
            // back in; such a candidate contributes nothing.
            if swapin_post.as_deref() == Some(op_f.as_str()) {
                continue;
            }

            debug!(
                target: "scheduler.fifo",
                tensor = tensor_name.as_str(),
                size = swap_size,
                postop = op_f.as_str(),
                "swap-out planned"
            );
            bundle.forward.push_execution(ScheduleEvent::on_operator(
                tensor_name.clone(),
                swap_size,
                ScheduleEventKind::Swapout,
                op_f,
            ));
            if let Some(post) = swapin_post {
                bundle.backward.push_execution(ScheduleEvent::on_operator(
                    tensor_name.clone(),
                    swap_size,
                    ScheduleEventKind::Swapin,
                    post,
                ));
            }

            released += swap_size;
            if released >= unmet {
                break;
            }
        }

        if self.trigger == TriggerMode::Time {
            self.raise_swapins_to_timepoints(&iter1, &mut bundle)?;
        }

        info!(
            target: "scheduler.fifo",
            unmet,
            released,
            forward_events = bundle.forward.len(),
            backward_events = bundle.backward.len(),
            "schedule decided"
        );
        state.bundle = Some(bundle);
        state.decided = true;
        Ok(())
    }

    /// Re-express backward swap-ins on the timepoint lane, packing each copy
    /// to complete when its anchor operator starts in the backward replay.
    fn raise_swapins_to_timepoints(
        &self,
        iter1: &core_events::EventSet,
        bundle: &mut ScheduleEvents,
    ) -> SchedulerResult<()> {
        if bundle.backward.execution.is_empty() {
            return Ok(());
        }

        // Backward replay order and per-operator spans, as observed.
        let backward = iter1
            .select()
            .where_(|(_, e)| e.stage == Stage::Backward)
            .get();
        let mut replay_order: Vec<String> = Vec::new();
        for (_, event) in backward.iter() {
            if !replay_order.contains(&event.op) {
                replay_order.push(event.op.clone());
            }
        }

        let mut model = TimeModel::new();
        for op in &replay_order {
            let op_name = op.clone();
            let touches = backward
                .select()
                .where_(move |(_, e)| e.op == op_name)
                .get();
            let first = touches.first().map_or(0, |(_, e)| e.timestamp);
            let last = touches.last().map_or(0, |(_, e)| e.timestamp);
            let span = (last.saturating_sub(first) as i64).max(1);
            model.submit_execution_synchronization(op)?;
            model.submit_execution_timespan(op, Timespan::new(op.clone(), span))?;
        }

        let transfer = TransferringModel;
        let mut pending: Vec<ScheduleEvent> = Vec::new();
        let mut processed: HashSet<String> = HashSet::new();
        for op in &replay_order {
            let events = bundle.backward.after(op).to_vec();
            if events.is_empty() {
                continue;
            }
            for event in &events {
                model.submit_transferring_timespan(
                    op,
                    Timespan::new(event.tensor.clone(), transfer.analyze(event.size)),
                )?;
            }
            model.submit_transferring_synchronization(op)?;
            model.set_synchronization_enabled(op);
            processed.insert(op.clone());
            pending.extend(events);
        }
        model.analyze()?;

        let timepoints = model.transferring_timepoints();
        let mut raised = Vec::new();
        for (event, (target, timepoint)) in pending.into_iter().zip(timepoints) {
            debug_assert_eq!(event.tensor, target);
            raised.push(ScheduleEvent::at_timepoint(
                event.tensor,
                event.size,
                event.kind,
                timepoint.max(0),
            ));
        }
        // Anchors that never surfaced in the backward replay keep their
        // execution trigger rather than being dropped.
        bundle
            .backward
            .execution
            .retain(|postop, _| !processed.contains(postop));
        bundle.backward.timepoint = raised;
        Ok(())
    }
}

impl MemoryScheduler for FifoScheduler {
    fn set_memory_info(&self, info: MemoryInfo) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .memory_info = Some(info);
    }

    fn on_new_iteration(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Iteration 1 is profiling; afterwards the decision is made once.
        if state.decided || self.events.iteration() <= 1 {
            return Ok(());
        }
        self.decide(&mut state)
    }

    fn schedule_events(&self) -> Option<ScheduleEvents> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bundle
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_events::MemoryEvent;
    use core_status::{Operator, Tensor, TensorKind};

    fn graph() -> Arc<MemoryStatus> {
        let status = MemoryStatus::new();
        for name in ["t1", "t2", "t3"] {
            status
                .register_tensor(Tensor::new(name, 1024, TensorKind::Inout))
                .unwrap();
        }
        for (op, tensor) in [("o1", "t1"), ("o2", "t2"), ("o3", "t3")] {
            status
                .register_operator(Operator::new(op).with_tensor(tensor))
                .unwrap();
        }
        Arc::new(status)
    }

    fn profile_iteration_1(events: &EventStore, with_swapout: bool) {
        events.new_iteration();
        for (op, tensor) in [("o1", "t1"), ("o2", "t2"), ("o3", "t3")] {
            events.submit(MemoryEvent::new(
                op,
                tensor,
                1024,
                MemoryEventKind::Allocate,
                Stage::Forward,
            ));
            events.submit(MemoryEvent::new(
                op,
                tensor,
                1024,
                MemoryEventKind::Access,
                Stage::Forward,
            ));
        }
        if with_swapout {
            // Emergency eviction of t1 while o3 allocated.
            events.submit(MemoryEvent::new(
                "o3",
                "t1",
                1024,
                MemoryEventKind::Swapout,
                Stage::Forward,
            ));
        }
        for (op, tensor) in [("o3", "t3"), ("o2", "t2"), ("o1", "t1")] {
            events.submit(MemoryEvent::new(
                op,
                tensor,
                1024,
                MemoryEventKind::Access,
                Stage::Backward,
            ));
            events.submit(MemoryEvent::new(
                op,
                tensor,
                1024,
                MemoryEventKind::Free,
                Stage::Backward,
            ));
        }
    }

    #[test]
    fn silent_during_profiling() {
        let events = Arc::new(EventStore::new());
        let scheduler = FifoScheduler::new(graph(), events.clone(), TriggerMode::Dependency, 16);
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();
        assert!(scheduler.schedule_events().is_none());
    }

    #[test]
    fn zero_deficit_yields_empty_schedule() {
        let events = Arc::new(EventStore::new());
        let scheduler = FifoScheduler::new(graph(), events.clone(), TriggerMode::Dependency, 16);
        profile_iteration_1(&events, false);
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();
        let bundle = scheduler.schedule_events().expect("decision must exist");
        assert!(bundle.is_empty());
    }

    #[test]
    fn deficit_produces_anchored_swap_pair() {
        let events = Arc::new(EventStore::new());
        let scheduler = FifoScheduler::new(graph(), events.clone(), TriggerMode::Dependency, 16);
        profile_iteration_1(&events, true);
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();

        let bundle = scheduler.schedule_events().expect("decision must exist");
        let swapouts = bundle.forward.after("o1");
        assert_eq!(swapouts.len(), 1);
        assert_eq!(swapouts[0].tensor, "t1");
        assert_eq!(swapouts[0].size, 1024);
        assert_eq!(swapouts[0].kind, ScheduleEventKind::Swapout);

        // First backward touch of t1 is o1; the swap-in anchors one step
        // after it in declared order.
        let swapins = bundle.backward.after("o2");
        assert_eq!(swapins.len(), 1);
        assert_eq!(swapins[0].tensor, "t1");
        assert_eq!(swapins[0].kind, ScheduleEventKind::Swapin);
    }

    #[test]
    fn decision_is_made_once() {
        let events = Arc::new(EventStore::new());
        let scheduler = FifoScheduler::new(graph(), events.clone(), TriggerMode::Dependency, 16);
        profile_iteration_1(&events, true);
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();
        let first = scheduler.schedule_events();
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();
        assert_eq!(scheduler.schedule_events(), first);
    }

    #[test]
    fn partial_swap_size_covers_exact_deficit() {
        let events = Arc::new(EventStore::new());
        let status = MemoryStatus::new();
        status
            .register_tensor(Tensor::new("big", 4096, TensorKind::Inout))
            .unwrap();
        status
            .register_operator(Operator::new("o1").with_tensor("big"))
            .unwrap();
        status
            .register_operator(Operator::new("o2").with_tensor("big"))
            .unwrap();
        let status = Arc::new(status);

        events.new_iteration();
        events.submit(MemoryEvent::new(
            "o1",
            "big",
            4096,
            MemoryEventKind::Allocate,
            Stage::Forward,
        ));
        events.submit(MemoryEvent::new(
            "o1",
            "big",
            1500,
            MemoryEventKind::Swapout,
            Stage::Forward,
        ));
        events.submit(MemoryEvent::new(
            "o2",
            "big",
            4096,
            MemoryEventKind::Access,
            Stage::Backward,
        ));
        events.new_iteration();

        let scheduler =
            FifoScheduler::new(status, events.clone(), TriggerMode::Dependency, 16);
        scheduler.on_new_iteration().unwrap();
        let bundle = scheduler.schedule_events().expect("decision must exist");
        let swapouts = bundle.forward.after("o1");
        assert_eq!(swapouts.len(), 1);
        assert_eq!(swapouts[0].size, 1500, "swap size is capped by the deficit");
    }

    #[test]
    fn time_trigger_moves_swapins_to_timepoints() {
        let events = Arc::new(EventStore::new());
        let scheduler = FifoScheduler::new(graph(), events.clone(), TriggerMode::Time, 16);
        profile_iteration_1(&events, true);
        events.new_iteration();
        scheduler.on_new_iteration().unwrap();

        let bundle = scheduler.schedule_events().expect("decision must exist");
        assert!(bundle.backward.execution.is_empty());
        assert_eq!(bundle.backward.timepoint.len(), 1);
        let event = &bundle.backward.timepoint[0];
        assert_eq!(event.tensor, "t1");
        assert!(event.timepoint >= 0);
        // Swap-outs keep their execution anchors.
        assert_eq!(bundle.forward.after("o1").len(), 1);
    }
}
