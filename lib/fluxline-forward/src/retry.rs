use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{ForwardError, SendError};
use crate::sender::Sender;

/// Computes the delay before a retry.
///
/// Called as `backoff(retry, max_retries)` where `retry` counts from 1 and
/// never exceeds `max_retries`. A zero duration retries immediately.
pub type BackoffFn = Arc<dyn Fn(u32, u32) -> Duration + Send + Sync>;

/// The default backoff: a delay of 8 seconds growing linearly by 3 seconds
/// per retry, capped at 30 seconds.
pub fn default_backoff(retry: u32, _max_retries: u32) -> Duration {
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    let next = Duration::from_secs(8) + Duration::from_secs(3) * retry.saturating_sub(1);
    next.min(MAX_BACKOFF)
}

/// How a batch is driven through its send attempts.
pub(crate) struct SendPolicy {
    pub retry_limit: u32,
    pub timeout: Option<Duration>,
    pub backoff: BackoffFn,
    pub request_limit: Option<Arc<Semaphore>>,
}

/// Runs the bounded retry state machine for one batch.
///
/// Performs at most `retry_limit + 1` send attempts. Each attempt first
/// checks for cancellation, then takes an in-flight slot (when a limit is
/// configured) for the duration of the attempt, and applies the soft
/// per-attempt timeout. A terminal sender error, or any error once the
/// context is cancelled, ends the loop immediately; retryable errors wait
/// out the backoff (or the cancellation, whichever comes first).
pub(crate) async fn send_with_retries(
    sender: &dyn Sender, policy: &SendPolicy, payload: Bytes, ctx: &CancellationToken,
) -> Result<(), ForwardError> {
    let mut last_error = None;

    for attempt in 0..=policy.retry_limit {
        if ctx.is_cancelled() {
            return Err(ForwardError::Canceled);
        }

        let permit = match &policy.request_limit {
            Some(semaphore) => tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => {
                    Some(permit.expect("request-limit semaphore is never closed"))
                }
                _ = ctx.cancelled() => return Err(ForwardError::Canceled),
            },
            None => None,
        };

        let result = match policy.timeout {
            Some(limit) if !limit.is_zero() => match timeout(limit, sender.send(payload.clone())).await {
                Ok(result) => result,
                Err(_) => Err(SendError::retryable(ForwardError::Timeout)),
            },
            _ => sender.send(payload.clone()).await,
        };
        drop(permit);

        match result {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !err.is_retryable() || ctx.is_cancelled() {
                    return Err(err.into_inner());
                }
                last_error = Some(err.into_inner());
            }
        }

        if attempt < policy.retry_limit {
            let delay = (policy.backoff)(attempt + 1, policy.retry_limit);
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = ctx.cancelled() => return Err(ForwardError::Canceled),
                }
            }
        }
    }

    Err(last_error.expect("retry loop only exhausts after a retryable error"))
}
