//! Runtime event records: what the framework did, when.
//!
//! Memory events describe per-tensor traffic (allocate, access, swap, free);
//! execution events bracket operator execution (request / execution /
//! release). Timestamps are microseconds on a process-wide monotonic clock so
//! events from different threads order consistently within an iteration.

use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

/// Application stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    All,
    Forward,
    Backward,
    Update,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::All => "all",
            Stage::Forward => "forward",
            Stage::Backward => "backward",
            Stage::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryEventKind {
    Allocate,
    Write,
    Read,
    #[default]
    Access,
    Swapin,
    Swapout,
    Free,
    Reshape,
}

impl MemoryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::Allocate => "allocate",
            MemoryEventKind::Write => "write",
            MemoryEventKind::Read => "read",
            MemoryEventKind::Access => "access",
            MemoryEventKind::Swapin => "swapin",
            MemoryEventKind::Swapout => "swapout",
            MemoryEventKind::Free => "free",
            MemoryEventKind::Reshape => "reshape",
        }
    }

    /// Swap traffic is excluded when the scheduler looks for genuine
    /// framework touches of a tensor.
    pub fn is_swap(&self) -> bool {
        matches!(self, MemoryEventKind::Swapin | MemoryEventKind::Swapout)
    }
}

/// Microseconds since the first call in this process. Monotonic.
pub fn timestamp_now_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryEvent {
    #[serde(rename = "operator")]
    pub op: String,
    pub tensor: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub kind: MemoryEventKind,
    pub stage: Stage,
    pub timestamp: u64,
    /// Stamped by the event store at submission.
    pub iteration: u32,
}

impl MemoryEvent {
    pub fn new(
        op: impl Into<String>,
        tensor: impl Into<String>,
        size: usize,
        kind: MemoryEventKind,
        stage: Stage,
    ) -> Self {
        Self {
            op: op.into(),
            tensor: tensor.into(),
            size,
            kind,
            stage,
            timestamp: timestamp_now_us(),
            iteration: 0,
        }
    }
}

impl std::fmt::Display for MemoryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timestamp: {} operator: {} tensor: {} size: {} type: {} stage: {}",
            self.timestamp,
            self.op,
            self.tensor,
            self.size,
            self.kind.as_str(),
            self.stage.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEventKind {
    Request,
    Release,
    #[default]
    Execution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionEvent {
    #[serde(rename = "operator")]
    pub op: String,
    #[serde(rename = "type")]
    pub kind: ExecutionEventKind,
    pub stage: Stage,
    pub timestamp: u64,
}

impl ExecutionEvent {
    pub fn new(op: impl Into<String>, kind: ExecutionEventKind, stage: Stage) -> Self {
        Self {
            op: op.into(),
            kind,
            stage,
            timestamp: timestamp_now_us(),
        }
    }
}
