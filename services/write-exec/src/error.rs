use schema::{ErrorCode, Namespace, Status, ValidationError};

/// Call-level failures of `execute_batch`. Per-item failures never surface
/// here; they are reported as write errors in the response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteExecError {
    #[error("invalid write command: {0}")]
    InvalidRequest(#[from] ValidationError),
    #[error("write command for '{request}' cannot use a targeter for '{targeter}'")]
    NamespaceMismatch {
        request: Namespace,
        targeter: Namespace,
    },
    #[error("transaction aborted: {0}")]
    TransactionAborted(Status),
}

impl WriteExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WriteExecError::InvalidRequest(_) | WriteExecError::NamespaceMismatch { .. } => {
                ErrorCode::BadValue
            }
            WriteExecError::TransactionAborted(status) => status.code,
        }
    }
}
