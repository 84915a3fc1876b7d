//! Bounded retry with exponential backoff.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use rand::prelude::*;
use std::time::Duration;
use tracing::info;

/// Exponential backoff with jitter.
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Give up after this many retries (not counting the initial attempt).
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        // 100ms, 200ms, 400ms, then surface the error.
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.,
            max_retries: 3,
        }
    }
}

/// Whether a failed operation is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient condition (network hiccup, 429/502/503/504); retry with backoff.
    Transient,
    /// Permanent condition (4xx, precondition failure, explicit abort); surface immediately.
    Fatal,
}

/// [`Backoff`] can be created from a [`BackoffConfig`].
///
/// Consecutive calls to [`Backoff::next`] return the next backoff interval.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    max_retries: usize,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            max_retries: config.max_retries,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation, retrying transient failures with backoff.
    ///
    /// `classify` decides per error whether another attempt is worthwhile.
    /// Fatal errors and exhausted retry budgets surface the last error.
    pub async fn retry_classified<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
        classify: impl Fn(&E) -> RetryClass + Send,
    ) -> Result<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        let mut retries = 0;
        loop {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                Ok(r) => break Ok(r),
                Err(e) => e,
            };

            if classify(&e) == RetryClass::Fatal || retries >= self.max_retries {
                break Err(e);
            }
            retries += 1;

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                retries,
                backoff_ms = backoff.as_millis() as u64,
                "request encountered transient error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Retry all errors until the retry budget runs out.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        do_stuff: F,
    ) -> Result<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        self.retry_classified(task_name, do_stuff, |_| RetryClass::Transient)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_sequence() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 500.;
        let base = 3.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
            max_retries: 100,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        // Create a static rng that takes the minimum of the range
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for _ in 0..20 {
            assert_eq!(backoff.next().as_secs_f64(), init_backoff_secs);
        }

        // Create a static rng that takes the maximum of the range
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }
    }

    #[tokio::test]
    async fn retries_transient_until_budget_exhausted() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.,
            max_retries: 3,
        };
        let attempts = AtomicUsize::new(0);

        let res: Result<(), &str> = Backoff::new(&config)
            .retry_classified(
                "always_fails",
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("boom") }
                },
                |_| RetryClass::Transient,
            )
            .await;

        assert_eq!(res.unwrap_err(), "boom");
        // initial attempt + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let config = BackoffConfig::default();
        let attempts = AtomicUsize::new(0);

        let res: Result<(), &str> = Backoff::new(&config)
            .retry_classified(
                "fatal",
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("precondition failed") }
                },
                |_| RetryClass::Fatal,
            )
            .await;

        assert_eq!(res.unwrap_err(), "precondition failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.,
            max_retries: 3,
        };
        let attempts = AtomicUsize::new(0);

        let res: Result<usize, &str> = Backoff::new(&config)
            .retry_all_errors("flaky", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("flaky")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(res.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
