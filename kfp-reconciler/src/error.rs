//! Error types for reconciliation steps

use kfp_models::Status;

/// Failure of a reconciliation step
///
/// `Status` failures are expected outcomes: the engine copies the status to
/// the unit and stops the pass. `Fatal` failures abort the trigger.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Status(Status),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn waiting(message: impl Into<String>) -> Self {
        ReconcileError::Status(Status::waiting(message))
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        ReconcileError::Status(Status::blocked(message))
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        ReconcileError::Status(Status::maintenance(message))
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ReconcileError::Fatal(anyhow::anyhow!(message.into()))
    }

    /// Status carried by this error, if any
    pub fn status(&self) -> Option<&Status> {
        match self {
            ReconcileError::Status(status) => Some(status),
            ReconcileError::Fatal(_) => None,
        }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
