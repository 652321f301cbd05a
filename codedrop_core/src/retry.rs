//! The one retry controller.
//!
//! Signaling connects, negotiation restarts and chunk sends all back off
//! through [`Backoff`]; what varies is the operation label and, for chunk
//! sends, the work done between attempts. Classification always comes from
//! [`TransferError::is_transient`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first re-attempt; doubles each time after.
    pub base_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (zero-based):
    /// 1s, 2s, 4s, 8s for the defaults.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Attempt bookkeeping for one retried operation.
///
/// Call [`step`](Self::step) with each failure: it returns `Ok(())` after
/// waiting out the backoff delay when another attempt is allowed, and the
/// error itself once the operation is out of road. [`reset`](Self::reset)
/// clears the streak after a success, which is what makes chunk-send
/// failures count as *consecutive*.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    op: &'static str,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, op: &'static str) -> Self {
        Self {
            policy,
            op,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub async fn step(
        &mut self,
        cancel: &CancellationToken,
        err: TransferError,
    ) -> Result<(), TransferError> {
        if !err.is_transient() {
            return Err(err);
        }
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            tracing::warn!(
                "{} giving up after {} attempts: {}",
                self.op,
                self.failures,
                err
            );
            return Err(err);
        }
        let delay = self.policy.delay_for(self.failures - 1);
        tracing::debug!(
            "{} attempt {} failed ({}), retrying in {:?}",
            self.op,
            self.failures,
            err,
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::TransferCancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Runs `f` until it succeeds, a terminal error shows up, or the policy is
/// exhausted. For operations whose attempts need exclusive state (chunk
/// sends, negotiation), drive a [`Backoff`] directly instead.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    op: &'static str,
    mut f: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut backoff = Backoff::new(policy, op);
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::TransferCancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => backoff.step(cancel, err).await?,
        }
    }
}
