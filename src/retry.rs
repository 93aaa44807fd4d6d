//!
//! src/retry.rs
//!
//! Bounded exponential backoff for calls that can fail transiently
//!

use std::{future::Future, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::StoryError;

/// initial_delay * factor^(attempt - 1), plus up to 250ms jitter when enabled
fn generate_backoff(policy: &RetryConfig, attempt: u8, rng: Option<&mut SmallRng>) -> Duration {
    let exp = policy.factor.saturating_pow(u32::from(attempt.saturating_sub(1)).min(16));
    let base = policy.initial_delay.saturating_mul(exp);
    match rng {
        Some(rng) => base + Duration::from_millis(rng.gen_range(0..=250)),
        None => base
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
/// The error of the final attempt is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    label: &str,
    mut op: F
) -> Result<T, StoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoryError>>
{
    let mut rng = policy.jitter.then(SmallRng::from_entropy);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u8 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient(&policy.retryable_statuses) || attempt >= max_attempts {
                    return Err(e);
                }
                let backoff = generate_backoff(policy, attempt, rng.as_mut());
                warn!(
                    call = label,
                    error = %e,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "http.retry"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::time::Instant;

    fn api(status: u16) -> StoryError {
        StoryError::Api { status, body: format!("{{\"status\":{status}}}") }
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = RetryConfig::default();
        let delays: Vec<u64> = (1..=4)
            .map(|a| generate_backoff(&policy, a, None).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = RetryConfig { jitter: true, ..RetryConfig::default() };
        let mut rng = SmallRng::seed_from_u64(7);
        for attempt in 1..=3 {
            let d = generate_backoff(&policy, attempt, Some(&mut rng)).as_millis() as u64;
            let base = 1000 * 2_u64.pow(u32::from(attempt) - 1);
            assert!(d >= base && d <= base + 250, "{d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_statuses() {
        let policy = RetryConfig::default();
        let script = RefCell::new(vec![Err(api(429)), Err(api(503)), Ok("ok")].into_iter());
        let calls = RefCell::new(Vec::new());

        let out = retry_with_backoff(&policy, "stage", || {
            calls.borrow_mut().push(Instant::now());
            let next = script.borrow_mut().next().unwrap();
            async move { next }
        }).await.unwrap();

        assert_eq!(out, "ok");
        let calls = calls.into_inner();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let policy = RetryConfig::default();
        let script = RefCell::new(
            vec![Err(api(500)), Err(api(502)), Err(api(503)), Err(api(429)), Ok(())].into_iter()
        );
        let calls = RefCell::new(Vec::new());

        let err = retry_with_backoff(&policy, "publish", || {
            calls.borrow_mut().push(Instant::now());
            let next = script.borrow_mut().next().unwrap();
            async move { next }
        }).await.unwrap_err();

        assert!(matches!(err, StoryError::Api { status: 429, .. }));
        let calls = calls.into_inner();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![
            Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried() {
        let policy = RetryConfig::default();
        let script = RefCell::new(
            vec![Err(StoryError::Http("connection reset".into())), Ok(5)].into_iter()
        );
        let out = retry_with_backoff(&policy, "stage", || {
            let next = script.borrow_mut().next().unwrap();
            async move { next }
        }).await.unwrap();
        assert_eq!(out, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryConfig::default();
        let count = RefCell::new(0);
        let err = retry_with_backoff(&policy, "stage", || {
            *count.borrow_mut() += 1;
            async { Err::<(), _>(api(400)) }
        }).await.unwrap_err();
        assert!(matches!(err, StoryError::Api { status: 400, .. }));
        assert_eq!(*count.borrow(), 1);
    }
}
