use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

use crate::config::TransferConf;

/// Failure taxonomy shared by the download and upload engines.
///
/// Everything except [`TransferError::Fatal`] is worth another attempt; the
/// attempt budget belongs to [`RetryPolicy`], not to the error itself.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The provider is still finalizing the artifact upstream.
    #[error("remote artifact is not ready: {reason}")]
    NotReady { reason: String },
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),
    #[error("rate limited by the remote endpoint")]
    RateLimited,
    #[error("authentication rejected with status {status}")]
    Auth { status: u16 },
    /// The downloaded body is not a usable video (error page, truncated file…).
    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },
    /// Post-upload verification disagreed with the local file.
    #[error("integrity mismatch: {reason}")]
    IntegrityMismatch { reason: String },
    #[error(transparent)]
    Fatal(anyhow::Error),
}

impl TransferError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, TransferError::Fatal(_))
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        TransferError::Fatal(error.into())
    }
}

/// Exponential backoff with jitter and a hard attempt bound, scoped by label.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub label: &'static str,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn download(conf: &TransferConf) -> Self {
        Self {
            label: "download",
            max_attempts: conf.max_retries_download,
            base_delay: conf.initial_backoff,
            max_delay: conf.max_backoff,
        }
    }

    pub fn upload(conf: &TransferConf) -> Self {
        Self {
            label: "upload",
            max_attempts: conf.max_retries_upload,
            base_delay: conf.initial_backoff,
            max_delay: conf.max_backoff,
        }
    }

    /// `min(MAX, BASE × 2^attempt)` plus up to 20% of jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        // Past 2^20 the doubling is irrelevant, the cap always wins.
        let factor = 1u32 << attempt.min(20);
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = exp.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
        exp + jitter
    }
}

/// Drives `op` until it succeeds, returns a non-retriable error, or the
/// policy's attempt budget runs out. The attempt index is handed to `op` so
/// callers can vary behavior between the first and later attempts.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retriable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);

                warn!(
                    label = policy.label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = format!("{error:#}", error = anyhow::anyhow!(error)),
                    "Attempt failed, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            label: "test",
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = policy(30_000, 300_000, 10);

        for (attempt, expected_ms) in [(0u32, 30_000u64), (1, 60_000), (2, 120_000), (3, 240_000)] {
            let delay = policy.delay(attempt).as_millis() as u64;
            assert!(delay >= expected_ms, "attempt {attempt}: {delay} < {expected_ms}");
            assert!(
                delay < expected_ms + expected_ms / 5 + 1,
                "attempt {attempt}: {delay} over jitter bound"
            );
        }
    }

    #[test]
    fn delay_is_capped_by_max() {
        let policy = policy(30_000, 300_000, 10);

        // 30s × 2^9 would be far past the 300s cap.
        let delay = policy.delay(9).as_millis() as u64;
        assert!(delay >= 300_000);
        assert!(delay < 360_001);

        // Huge attempt indexes must not overflow the doubling factor.
        let delay = policy.delay(u32::MAX).as_millis() as u64;
        assert!(delay >= 300_000);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let policy = policy(0, 0, 3);
        let mut calls = 0;

        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            calls += 1;
            async {
                Err(TransferError::Transport(anyhow::anyhow!("nope")))
            }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Transport(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_errors_short_circuit() {
        let policy = policy(0, 0, 5);
        let mut calls = 0;

        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            calls += 1;
            async { Err(TransferError::fatal(anyhow::anyhow!("bad request"))) }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Fatal(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = policy(0, 0, 5);
        let mut calls = 0;

        let result = retry_with_policy(&policy, |attempt| {
            calls += 1;
            async move {
                if attempt < 2 {
                    Err(TransferError::RateLimited)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls, 3);
    }
}
