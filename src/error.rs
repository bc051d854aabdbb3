use thiserror::Error;

use crate::estimator::TableId;

pub type Result<T> = std::result::Result<T, KdeError>;

/// Everything that can go wrong inside the estimator.
///
/// The first three variants are infrastructure failures. Whoever sees one of them
/// should stop using the model for that table and fall back to the default
/// statistics instead of handing the error to the planner.
#[derive(Error, Debug)]
pub enum KdeError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("failed to build kernel {kernel}: {reason}")]
    KernelBuildFailure { kernel: String, reason: String },

    #[error("device allocation of {requested} bytes exceeds the limit of {limit} bytes")]
    AllocationFailure { requested: usize, limit: usize },

    #[error("request cannot be answered: {0}")]
    UnanswerableRequest(String),

    #[error("bandwidth optimization diverged: {0}")]
    OptimizationDivergence(String),

    #[error("no usable feedback for table {table}")]
    FeedbackUnavailable { table: TableId },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl KdeError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            KdeError::DeviceUnavailable(_)
                | KdeError::KernelBuildFailure { .. }
                | KdeError::AllocationFailure { .. }
        )
    }

    /// Persistence failures must reach the enclosing transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KdeError::PersistenceFailure(_))
    }
}
