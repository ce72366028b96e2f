//! Bounded retry with exponential backoff for network-facing calls

use std::future::Future;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::RetryPolicy;

/// Marks an error that must not be retried (e.g. a 4xx response)
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Permanent(pub String);

impl Permanent {
    pub fn err(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Permanent(message.into()))
    }
}

/// 5xx, 408 and 429 are worth retrying; any other failure status is not
pub fn classify_status(status: StatusCode, body: &str, what: &str) -> anyhow::Error {
    let message = format!("{what} returned {status}: {body}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        anyhow::anyhow!(message)
    } else {
        Permanent::err(message)
    }
}

/// Final failure after the retry loop gave up
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
/// Each attempt is bounded by the policy timeout; a timeout counts as a
/// transient failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("timed out after {:?}", policy.attempt_timeout),
        };

        let permanent = error.downcast_ref::<Permanent>().is_some();
        if permanent || attempt >= max_attempts {
            tracing::warn!(
                operation,
                attempt,
                permanent,
                error = %error,
                "Giving up"
            );
            return Err(RetryExhausted {
                attempts: attempt,
                last_error: format!("{error:#}"),
            });
        }

        let delay = policy.backoff(attempt);
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
