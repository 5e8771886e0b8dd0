//! Schedule events: the decisions the scheduler pins to operator boundaries.
//!
//! A schedule event either fires after a named operator (`postop`,
//! dependency-triggered) or at an offset from iteration start (`timepoint`,
//! time-triggered). The full bundle pairs the per-stage event sets with the
//! planner's memory map.

use crate::Stage;
use core_layout::MemoryMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleEventKind {
    #[default]
    Allocate,
    Copyin,
    Copyout,
    Swapin,
    Swapout,
    Freedev,
    Freehost,
    Free,
}

impl ScheduleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleEventKind::Allocate => "allocate",
            ScheduleEventKind::Copyin => "copyin",
            ScheduleEventKind::Copyout => "copyout",
            ScheduleEventKind::Swapin => "swapin",
            ScheduleEventKind::Swapout => "swapout",
            ScheduleEventKind::Freedev => "freedev",
            ScheduleEventKind::Freehost => "freehost",
            ScheduleEventKind::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleEvent {
    #[serde(rename = "operator")]
    pub op: String,
    pub tensor: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub kind: ScheduleEventKind,
    /// Dependency trigger: fire once this operator has executed.
    #[serde(rename = "post_operator")]
    pub postop: String,
    /// Time trigger: microseconds from iteration start.
    pub timepoint: i64,
    /// Instant events run synchronously on the notifying thread.
    #[serde(skip)]
    pub instant: bool,
}

impl ScheduleEvent {
    /// Event fired after `postop` executes.
    pub fn on_operator(
        tensor: impl Into<String>,
        size: usize,
        kind: ScheduleEventKind,
        postop: impl Into<String>,
    ) -> Self {
        Self {
            op: String::new(),
            tensor: tensor.into(),
            size,
            kind,
            postop: postop.into(),
            timepoint: 0,
            instant: false,
        }
    }

    /// Event fired at `timepoint` microseconds into the iteration.
    pub fn at_timepoint(
        tensor: impl Into<String>,
        size: usize,
        kind: ScheduleEventKind,
        timepoint: i64,
    ) -> Self {
        Self {
            op: String::new(),
            tensor: tensor.into(),
            size,
            kind,
            postop: String::new(),
            timepoint,
            instant: false,
        }
    }

    pub fn instant(mut self) -> Self {
        self.instant = true;
        self
    }
}

/// Events for one stage, split by trigger mode. Execution-triggered events
/// are keyed by their post-operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageScheduleEvents {
    pub execution: BTreeMap<String, Vec<ScheduleEvent>>,
    pub timepoint: Vec<ScheduleEvent>,
}

impl StageScheduleEvents {
    pub fn push_execution(&mut self, event: ScheduleEvent) {
        self.execution
            .entry(event.postop.clone())
            .or_default()
            .push(event);
    }

    pub fn push_timepoint(&mut self, event: ScheduleEvent) {
        self.timepoint.push(event);
    }

    pub fn len(&self) -> usize {
        self.execution.values().map(Vec::len).sum::<usize>() + self.timepoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events pinned after `postop`, in insertion order.
    pub fn after(&self, postop: &str) -> &[ScheduleEvent] {
        self.execution.get(postop).map_or(&[], Vec::as_slice)
    }
}

/// The bundle published by the scheduler and replayed by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleEvents {
    pub memory_map: MemoryMap,
    pub forward: StageScheduleEvents,
    pub backward: StageScheduleEvents,
}

impl ScheduleEvents {
    pub fn stage(&self, stage: Stage) -> &StageScheduleEvents {
        match stage {
            Stage::Backward => &self.backward,
            _ => &self.forward,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.backward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_events_key_by_postop() {
        let mut stage = StageScheduleEvents::default();
        stage.push_execution(ScheduleEvent::on_operator(
            "t1",
            1024,
            ScheduleEventKind::Swapout,
            "o1",
        ));
        stage.push_execution(ScheduleEvent::on_operator(
            "t2",
            512,
            ScheduleEventKind::Swapout,
            "o1",
        ));
        assert_eq!(stage.after("o1").len(), 2);
        assert_eq!(stage.after("o2").len(), 0);
        assert_eq!(stage.len(), 2);
    }

    #[test]
    fn schedule_event_serializes_with_wire_names() {
        let event =
            ScheduleEvent::on_operator("t", 1024, ScheduleEventKind::Swapin, "o2").instant();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["tensor"], "t");
        assert_eq!(value["type"], "swapin");
        assert_eq!(value["post_operator"], "o2");
        assert_eq!(value["timepoint"], 0);
        assert!(value.get("instant").is_none(), "instant is not exported");
    }
}
