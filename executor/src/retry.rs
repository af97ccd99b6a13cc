use crate::config::RetryPolicy;
use crate::error::ExecutorError;
use drover_lib::{CancelSignal, ChainResult};
use std::future::Future;

/// Drive a chain operation under the retry policy. Non-retryable chain
/// errors fail immediately; retryable ones back off exponentially until
/// `max_attempts` is exhausted. The backoff sleep races the task's
/// cancellation signal, so a stopping executor wakes sleepers at once.
///
/// `on_retry` runs before each backoff sleep (the per-stage retry
/// counters hang off it).
pub(crate) async fn retry_chain_op<T, F, Fut, R>(
    policy: &RetryPolicy,
    signal: &CancelSignal,
    mut on_retry: R,
    op: F,
) -> Result<T, ExecutorError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = ChainResult<T>>,
    R: FnMut(),
{
    let mut attempt: u32 = 0;
    loop {
        if signal.is_aborted() {
            return Err(ExecutorError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(ExecutorError::Chain(err)),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(ExecutorError::RetryExhausted {
                        attempts: policy.max_attempts,
                        source: err,
                    });
                }
                on_retry();
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(
                    "retry: attempt {attempt}/{} failed ({err}), backing off {delay:?}",
                    policy.max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = signal.cancelled() => return Err(ExecutorError::Cancelled),
                }
            }
        }
    }
}
