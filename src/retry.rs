use crate::errors::{BibSortError, Result};
use crate::traits::Sleeper;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Exponential backoff: `base_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`, then passed through `jitter`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    jitter: JitterFn,
}

/// Why `retry` gave up.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub last_error: BibSortError,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Arc::new(proportional_jitter),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(
        mut self,
        jitter: impl Fn(Duration) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn without_jitter(self) -> Self {
        self.with_jitter(|delay| delay)
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() {
            Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };
        (self.jitter)(capped)
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of
    /// attempts. The closure receives the 1-based attempt number.
    pub async fn retry<T, F, Fut, S>(
        &self,
        sleeper: &S,
        mut operation: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        S: Sleeper + ?Sized,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, ?delay, %error, "transient failure, backing off");
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: error,
                    })
                }
            }
        }
    }
}

/// Spread retries over `[delay, delay * 1.25)` so parallel workers hitting
/// the same rate limit do not come back in lockstep.
pub fn proportional_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.25);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> BibSortError {
        BibSortError::from_status(503, "unavailable")
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1)).without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(50, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_default_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, Duration::from_millis(800));
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay < Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).without_jitter();
        let calls = AtomicU32::new(0);

        let result = policy
            .retry(&sleeper, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::default();

        let result: std::result::Result<(), _> = policy
            .retry(&sleeper, |_| async { Err(BibSortError::from_status(401, "bad key")) })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.last_error, BibSortError::FatalApi { .. }));
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_gives_up_at_ceiling() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::new(3, Duration::from_millis(10)).without_jitter();

        let result: std::result::Result<(), _> =
            policy.retry(&sleeper, |_| async { Err(transient()) }).await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.is_transient());
        assert_eq!(sleeper.recorded().len(), 2);
    }
}
