use uuid::Uuid;

use crate::models::ScanStatus;

/// Failures raised synchronously by the asset and scan services.
///
/// Execution-phase failures never appear here; they are recorded on the
/// job itself (see `jobs::ExecutionError`).
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("asset {0} not found")]
    AssetNotFound(Uuid),

    #[error("scan {0} not found")]
    JobNotFound(Uuid),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("cannot move scan from {from} to {to}")]
    InvalidTransition { from: ScanStatus, to: ScanStatus },

    #[error("target out of scope: {0}")]
    OutOfScope(String),

    #[error("scan queue is full, retry later")]
    QueueFull,

    #[error("{0}")]
    InvalidInput(String),

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type ServiceResult<T> = Result<T, ScanError>;
