//! Coordinator error types.

use thiserror::Error;

use crate::approval::ApprovalError;
use sandcell_providers::ProviderError;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The execution budget elapsed; the kernel was interrupted.
    #[error("execution budget exhausted")]
    BudgetTimeout,

    /// The executor was used before `start` or after `close`.
    #[error("executor is not running")]
    NotStarted,

    /// Kernel liveness was lost or its bus closed mid-stream.
    #[error("kernel connection lost")]
    KernelLost,

    #[error("kernel failure: {0}")]
    Kernel(String),

    #[error("tool service failure: {0}")]
    Service(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
