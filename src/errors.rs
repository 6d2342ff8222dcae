use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;
use crate::workflow::authorization::AccessDenied;
use crate::workflow::types::{RequestId, RequestStatus, StepType};

/// Everything a workflow operation can hand back to the caller.
///
/// All variants except `Storage` are recoverable by the caller and carry enough detail for a
/// specific message. `Storage` deliberately renders a generic retry message; the underlying
/// error is logged where it happens and kept as the `source`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Authorization(#[from] AccessDenied),

    #[error(
        "This request is {}; it was changed by someone else. Reload it before acting again.",
        .actual.describe()
    )]
    Conflict {
        request_id: RequestId,
        expected: RequestStatus,
        actual: RequestStatus,
    },

    #[error("A valid {step} signature is required: {detail}")]
    MissingSignature { step: StepType, detail: String },

    #[error("{0}")]
    Validation(String),

    #[error("The {step} signature has already been recorded for this request.")]
    DuplicateSignature { request_id: RequestId, step: StepType },

    #[error("Request {0} was not found.")]
    NotFound(RequestId),

    #[error("Signature {0} was not found.")]
    SignatureNotFound(Uuid),

    #[error("The request could not be saved. Please try again.")]
    Storage(#[source] StorageError),
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        WorkflowError::Validation(message.into())
    }

    /// Whether the caller may simply retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::Storage(_))
    }
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StatusMismatch {
                request_id,
                expected,
                actual,
            } => WorkflowError::Conflict {
                request_id,
                expected,
                actual,
            },
            StorageError::DuplicateSignature { request_id, step } => {
                WorkflowError::DuplicateSignature { request_id, step }
            }
            StorageError::RequestNotFound(id) => WorkflowError::NotFound(id),
            other => WorkflowError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_actual_status() {
        let err = WorkflowError::from(StorageError::StatusMismatch {
            request_id: RequestId::new(),
            expected: RequestStatus::PendingApprover,
            actual: RequestStatus::PendingCpso,
        });
        assert!(err
            .to_string()
            .contains("already approved and pending CPSO review"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_backend_errors_render_generic_message() {
        let err = WorkflowError::from(StorageError::Unavailable("disk full".to_string()));
        assert_eq!(err.to_string(), "The request could not be saved. Please try again.");
        assert!(err.is_retryable());
    }
}
