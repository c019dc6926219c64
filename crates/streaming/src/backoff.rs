// Exponential backoff with fuzz, shared by the network layer and the
// streaming engine's failure pacing.

use std::time::Duration;

use rand::RngExt;
use tracing::trace;

use crate::config::RetryParameters;
use crate::error::StreamingError;

/// Counts attempts of one logical retry sequence and delays every attempt
/// after the first.
///
/// In auto-reset mode running out of attempts starts a fresh sequence instead
/// of failing, so the caller can retry forever at a bounded pace.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
    backoff_factor: f64,
    fuzz_factor: f64,
    auto_reset: bool,
    num_attempts: u32,
    next_unfuzzed_delay: Duration,
}

impl Backoff {
    pub fn new(params: &RetryParameters, auto_reset: bool) -> Self {
        let min_attempts = if auto_reset { 2 } else { 1 };
        Self {
            max_attempts: params.max_attempts.max(min_attempts),
            base_delay: params.base_delay(),
            backoff_factor: params.backoff_factor,
            fuzz_factor: params.fuzz_factor.clamp(0.0, 1.0),
            auto_reset,
            num_attempts: 0,
            next_unfuzzed_delay: params.base_delay(),
        }
    }

    /// Waits until the next attempt is allowed.
    ///
    /// The first attempt of a sequence proceeds immediately. Each later one
    /// sleeps for the fuzzed current delay and then grows the delay by the
    /// backoff factor. Fails with [`StreamingError::AttemptsExhausted`] once
    /// `max_attempts` have been made, unless auto-reset is enabled.
    pub async fn attempt(&mut self) -> Result<(), StreamingError> {
        if self.num_attempts >= self.max_attempts {
            if !self.auto_reset {
                return Err(StreamingError::AttemptsExhausted);
            }
            trace!(max_attempts = self.max_attempts, "Backoff sequence exhausted, resetting");
            self.num_attempts = 1;
            self.next_unfuzzed_delay = self.base_delay;
            return Ok(());
        }

        let current_attempt = self.num_attempts;
        self.num_attempts += 1;
        if current_attempt == 0 {
            return Ok(());
        }

        let delay = fuzz(self.next_unfuzzed_delay, self.fuzz_factor);
        trace!(
            attempt = current_attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Backing off before next attempt"
        );
        tokio::time::sleep(delay).await;
        self.next_unfuzzed_delay = self.next_unfuzzed_delay.mul_f64(self.backoff_factor);
        Ok(())
    }

    /// Attempts made so far in the current sequence.
    pub fn attempts(&self) -> u32 {
        self.num_attempts
    }

    /// Delay the next waiting attempt will use before fuzzing.
    pub fn next_unfuzzed_delay(&self) -> Duration {
        self.next_unfuzzed_delay
    }
}

fn fuzz(delay: Duration, fuzz_factor: f64) -> Duration {
    if fuzz_factor == 0.0 {
        return delay;
    }
    let jitter: f64 = rand::rng().random_range(-1.0..=1.0);
    delay.mul_f64((1.0 + jitter * fuzz_factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn params(max_attempts: u32, fuzz_factor: f64) -> RetryParameters {
        RetryParameters {
            max_attempts,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            fuzz_factor,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_follow_exponential_schedule() {
        let mut backoff = Backoff::new(&params(3, 0.0), false);

        let start = Instant::now();
        backoff.attempt().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        let start = Instant::now();
        backoff.attempt().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));

        let start = Instant::now();
        backoff.attempt().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(2000));

        assert_eq!(
            backoff.attempt().await.unwrap_err(),
            StreamingError::AttemptsExhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unfuzzed_delay_never_shrinks() {
        let mut backoff = Backoff::new(&params(6, 0.5), false);
        let mut previous = backoff.next_unfuzzed_delay();
        for _ in 0..6 {
            backoff.attempt().await.unwrap();
            let next = backoff.next_unfuzzed_delay();
            assert!(next >= previous);
            previous = next;
        }
        assert!(backoff.attempt().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fuzzed_delay_stays_within_bounds() {
        let mut backoff = Backoff::new(&params(2, 0.5), false);
        backoff.attempt().await.unwrap();

        let start = Instant::now();
        backoff.attempt().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reset_never_fails() {
        let mut backoff = Backoff::new(&params(3, 0.0), true);

        backoff.attempt().await.unwrap();
        backoff.attempt().await.unwrap();
        backoff.attempt().await.unwrap();

        // The fourth call starts a new sequence and, like the first, does not wait.
        let start = Instant::now();
        backoff.attempt().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(backoff.attempts(), 1);

        let start = Instant::now();
        backoff.attempt().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[test]
    fn auto_reset_requires_two_attempts() {
        let backoff = Backoff::new(&params(1, 0.0), true);
        assert_eq!(backoff.max_attempts, 2);
    }
}
