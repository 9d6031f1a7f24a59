//! Per-request cancellation and deadlines.

use crate::error::EnclaveError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline carried by every operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Expire the context `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail fast when the caller has given up.
    pub fn check(&self) -> Result<(), EnclaveError> {
        if self.is_cancelled() {
            return Err(EnclaveError::Cancelled);
        }
        Ok(())
    }

    /// Drive `fut` unless the context is cancelled first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, EnclaveError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(EnclaveError::Cancelled),
            output = fut => Ok(output),
        }
    }

    async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestContext;
    use crate::error::EnclaveError;
    use std::time::Duration;

    #[tokio::test]
    async fn run_completes_when_not_cancelled() {
        let ctx = RequestContext::new();
        let value = ctx.run(async { 7 }).await.expect("completes");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_work() {
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(EnclaveError::Cancelled)));
        assert!(ctx.check().is_err());
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(5));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(EnclaveError::Cancelled)));
    }
}
