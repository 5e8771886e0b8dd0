//! The two-lane time model behind time-triggered schedules.
//!
//! The execution lane carries operator run spans; the transferring lane
//! carries copy spans. Both lanes interleave labelled synchronization points.
//! The execution lane synchronizes *prev*: an operator's spans follow its
//! label. The transferring lane synchronizes *post*: a copy's spans precede
//! the label they must complete by. A label submitted out of order is a hard
//! error; silent misalignment would produce a schedule that fires copies
//! against the wrong operator.
//!
//! `analyze` stretches transferring synchronization spans so that transfers
//! finish exactly when their enabled label is reached on the execution lane,
//! then assigns absolute timepoints to every span.

use crate::{SchedulerError, SchedulerResult};
use std::collections::HashSet;

/// Copy-duration estimator. The constant factor models a PCIe-class link:
/// four bytes per microsecond step keeps the spans coarse but ordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferringModel;

impl TransferringModel {
    pub fn analyze(&self, size: usize) -> i64 {
        (size >> 2) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynchronizationKind {
    Prev,
    Post,
}

#[derive(Debug, Clone, Default)]
pub struct Timespan {
    pub target: String,
    pub span: i64,
    pub synchronization: bool,
    pub timepoint: i64,
}

impl Timespan {
    pub fn new(target: impl Into<String>, span: i64) -> Self {
        Self {
            target: target.into(),
            span,
            synchronization: false,
            timepoint: 0,
        }
    }
}

#[derive(Debug)]
pub struct Lane {
    kind: SynchronizationKind,
    timespans: Vec<(String, Timespan)>,
    current_label: String,
}

impl Lane {
    fn new(kind: SynchronizationKind) -> Self {
        Self {
            kind,
            timespans: Vec::new(),
            current_label: String::new(),
        }
    }

    fn submit_synchronization(&mut self, label: &str) -> SchedulerResult<()> {
        if self.kind == SynchronizationKind::Post {
            // Every span since the previous synchronization must have been
            // submitted under this label.
            for (span_label, timespan) in self.timespans.iter().rev() {
                if timespan.synchronization {
                    break;
                }
                if span_label != label {
                    return Err(SchedulerError::LabelMismatch {
                        expected: span_label.clone(),
                        found: label.to_string(),
                    });
                }
            }
        }
        let mut timespan = Timespan::new(label, 0);
        timespan.synchronization = true;
        self.timespans.push((label.to_string(), timespan));
        self.current_label = label.to_string();
        Ok(())
    }

    fn submit_timespan(&mut self, label: &str, timespan: Timespan) -> SchedulerResult<()> {
        let aligned = label == self.current_label;
        let legal = match self.kind {
            // Prev lane: spans follow their label.
            SynchronizationKind::Prev => aligned,
            // Post lane: spans precede their label; an already-passed label
            // is late.
            SynchronizationKind::Post => !aligned,
        };
        if !legal {
            return Err(SchedulerError::LabelMismatch {
                expected: self.current_label.clone(),
                found: label.to_string(),
            });
        }
        self.timespans.push((label.to_string(), timespan));
        Ok(())
    }

    pub fn timespans(&self) -> &[(String, Timespan)] {
        &self.timespans
    }
}

pub struct TimeModel {
    pub execution_lane: Lane,
    pub transferring_lane: Lane,
    enabled_labels: HashSet<String>,
    strong_synchronization: bool,
}

impl Default for TimeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeModel {
    pub fn new() -> Self {
        Self {
            execution_lane: Lane::new(SynchronizationKind::Prev),
            transferring_lane: Lane::new(SynchronizationKind::Post),
            enabled_labels: HashSet::new(),
            strong_synchronization: false,
        }
    }

    pub fn submit_execution_synchronization(&mut self, label: &str) -> SchedulerResult<()> {
        self.execution_lane.submit_synchronization(label)
    }

    pub fn submit_execution_timespan(
        &mut self,
        label: &str,
        timespan: Timespan,
    ) -> SchedulerResult<()> {
        self.execution_lane.submit_timespan(label, timespan)
    }

    pub fn submit_transferring_synchronization(&mut self, label: &str) -> SchedulerResult<()> {
        self.transferring_lane.submit_synchronization(label)
    }

    pub fn submit_transferring_timespan(
        &mut self,
        label: &str,
        timespan: Timespan,
    ) -> SchedulerResult<()> {
        self.transferring_lane.submit_timespan(label, timespan)
    }

    /// Labels the transferring lane must complete at.
    pub fn set_synchronization_enabled(&mut self, label: &str) {
        self.enabled_labels.insert(label.to_string());
    }

    pub fn set_strong_synchronization(&mut self, strong: bool) {
        self.strong_synchronization = strong;
    }

    fn analyze_synchronization(&mut self) -> SchedulerResult<()> {
        let transferring = &mut self.transferring_lane.timespans;
        let mut trans_index = transferring.len();

        let mut total_execution_time: i64 = 0;
        for (_, exec_span) in self.execution_lane.timespans.iter().rev() {
            if exec_span.synchronization {
                if !self.enabled_labels.contains(&exec_span.target) {
                    continue;
                }
            } else {
                total_execution_time += exec_span.span;
                continue;
            }

            // Walk the transferring lane back to the matching enabled label.
            let mut total_transferring_time: i64 = 0;
            while trans_index > 0 {
                let (_, span) = &transferring[trans_index - 1];
                if span.synchronization {
                    if self.enabled_labels.contains(&span.target) {
                        break;
                    }
                } else {
                    total_transferring_time += span.span;
                }
                trans_index -= 1;
            }
            if trans_index > 0 {
                let (_, span) = &mut transferring[trans_index - 1];
                if span.target != exec_span.target {
                    return Err(SchedulerError::LabelMismatch {
                        expected: exec_span.target.clone(),
                        found: span.target.clone(),
                    });
                }
                if total_execution_time >= total_transferring_time {
                    span.span = total_execution_time - total_transferring_time;
                    total_execution_time = 0;
                } else {
                    span.span = 0;
                    total_execution_time = if self.strong_synchronization {
                        total_execution_time - total_transferring_time
                    } else {
                        0
                    };
                }
                trans_index -= 1;
            }
        }
        Ok(())
    }

    fn generate_timepoints(&mut self) {
        let mut current: i64 = 0;
        for (_, span) in self.execution_lane.timespans.iter_mut() {
            span.timepoint = current;
            current += span.span;
        }
        for (_, span) in self.transferring_lane.timespans.iter_mut().rev() {
            current -= span.span;
            span.timepoint = current;
        }
    }

    /// Align the lanes and assign timepoints.
    pub fn analyze(&mut self) -> SchedulerResult<()> {
        self.analyze_synchronization()?;
        self.generate_timepoints();
        Ok(())
    }

    /// Timepoints of non-synchronization transferring spans, in lane order.
    pub fn transferring_timepoints(&self) -> Vec<(String, i64)> {
        self.transferring_lane
            .timespans
            .iter()
            .filter(|(_, span)| !span.synchronization)
            .map(|(_, span)| (span.target.clone(), span.timepoint))
            .collect()
    }
}
