use std::time::Duration;

use schema::{ErrorCode, RetryIdentity, Status};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call execution context: retry identity, transaction membership,
/// caller cancellation and deadline.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    retry_identity: Option<RetryIdentity>,
    in_transaction: bool,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A retryable write: shards can deduplicate re-sent statements.
    pub fn retryable(identity: RetryIdentity) -> Self {
        Self {
            retry_identity: Some(identity),
            ..Self::default()
        }
    }

    /// A statement inside a multi-statement transaction.
    pub fn in_transaction(identity: RetryIdentity) -> Self {
        Self {
            retry_identity: Some(identity),
            in_transaction: true,
            ..Self::default()
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn retry_identity(&self) -> Option<&RetryIdentity> {
        self.retry_identity.as_ref()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether a failed send may be repeated without risking a duplicate write.
    pub fn is_retryable_write(&self) -> bool {
        self.retry_identity.is_some() && !self.in_transaction
    }

    pub fn check_for_interrupt(&self) -> Option<Status> {
        if self.cancellation.is_cancelled() {
            return Some(interrupted_status());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(deadline_status()),
            _ => None,
        }
    }

    /// Resolves once the caller cancels or the deadline passes.
    pub async fn interrupted(&self) -> Status {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancellation.cancelled() => interrupted_status(),
                _ = tokio::time::sleep_until(deadline) => deadline_status(),
            },
            None => {
                self.cancellation.cancelled().await;
                interrupted_status()
            }
        }
    }
}

fn interrupted_status() -> Status {
    Status::new(ErrorCode::Interrupted, "operation was interrupted")
}

fn deadline_status() -> Status {
    Status::new(ErrorCode::ExceededTimeLimit, "operation exceeded time limit")
}

#[cfg(test)]
mod tests {
    use schema::SessionId;

    use super::*;

    #[test]
    fn transaction_context_is_not_a_retryable_write() {
        let identity = RetryIdentity::new(SessionId::generate(), 5);
        assert!(OperationContext::retryable(identity).is_retryable_write());
        assert!(!OperationContext::in_transaction(identity).is_retryable_write());
        assert!(!OperationContext::new().is_retryable_write());
    }

    #[test]
    fn cancelled_token_interrupts() {
        let ctx = OperationContext::new();
        assert_eq!(ctx.check_for_interrupt(), None);
        ctx.cancellation_token().cancel();
        let status = ctx.check_for_interrupt().expect("should be interrupted");
        assert_eq!(status.code, ErrorCode::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_reports_time_limit() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(50));
        let status = ctx.interrupted().await;
        assert_eq!(status.code, ErrorCode::ExceededTimeLimit);
        assert!(ctx.check_for_interrupt().is_some());
    }
}
