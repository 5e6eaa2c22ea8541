#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// A fixed-delay backoff policy used for retrying idempotent operations.
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new instance with the given delay between attempts.
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// The delay applied between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Retry the given fallible operation with a fixed backoff, a bounded number of times.
///
/// Only idempotent operations may be driven through this routine. The final error is
/// surfaced with context on the number of attempts made.
pub async fn retry<T, F, Fut>(backoff: FixedBackoff, max_attempts: usize, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..max_attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay()).await;
        }
        match operation().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                tracing::warn!(error = ?err, attempt, "retryable operation failed");
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(err).with_context(|| format!("operation failed after {} attempts", max_attempts)),
        None => bail!("retry invoked with max_attempts == 0"),
    }
}

/// Encode the given revision number as its opaque wire form, big-endian bytes.
pub fn encode_rev(rev: u64) -> Vec<u8> {
    rev.to_be_bytes().to_vec()
}

/// Decode an opaque wire revision into its numeric form.
pub fn decode_rev(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as a revision, invalid len {} needed 8", val.len()),
    }
}
