//! Bounded exponential backoff for queries against transiently-unavailable
//! indexes (e.g. one concurrently being rebuilt).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use gentab_core::{Error, Result};

pub async fn with_retry<T, F, Fut>(attempts: usize, base_ms: u64, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_ms;
    let mut last: Option<Error> = None;
    for attempt in 1..=attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, error = %e, "transient failure, backing off");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = delay.saturating_mul(2);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::retrieval("retries exhausted")))
}
