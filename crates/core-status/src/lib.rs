//! Memory status core: the model of operators, tensors and memory sections,
//! and the registry that owns them.
//!
//! Everything downstream (layout records, the scheduler, the operation
//! executor, the session) consumes this crate. The section state machine in
//! [`tensor`] is the single source of truth for residence transitions; the
//! registry in [`registry`] is the single source of truth for ownership and
//! exclusive access.

pub mod info;
pub mod operator;
pub mod registry;
pub mod tensor;

pub use info::{address_aligned, aligned_size, DeviceInfo, HostInfo, MemoryBlock, MemoryInfo};
pub use operator::Operator;
pub use registry::{MemoryStatus, OperatorPres, TensorPres, TensorView};
pub use tensor::{Fragment, FragmentStatus, MemorySection, SectionStatus, Tensor, TensorKind};

/// Status-level failures: lifecycle misuse and illegal residence
/// transitions. Transition faults are fatal to the offending request only;
/// the registry stays live.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("component not initialized")]
    Uninited,
    #[error("component already initialized")]
    Inited,
    #[error("tensor status invalid: {0}")]
    TensorInvalid(String),
    #[error("memory section invalid: {0}")]
    SectionInvalid(String),
    #[error("unknown tensor: {0}")]
    UnknownTensor(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}

pub type StatusResult<T> = Result<T, StatusError>;
