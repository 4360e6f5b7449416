//! Exponential backoff with jitter, used when (re)connecting to the
//! recorder.

use std::time::Duration;

use observability_deps::tracing::info;
use rand::prelude::*;

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First wait.
    pub init_backoff: Duration,
    /// Cap on any single wait.
    pub max_backoff: Duration,
    /// Growth factor per round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 3.0,
        }
    }
}

/// Jittered exponential backoff state.
#[derive(Debug)]
pub struct Backoff {
    init_secs: f64,
    next_secs: f64,
    max_secs: f64,
    base: f64,
}

impl Backoff {
    /// Fresh state from a config.
    pub fn new(config: &BackoffConfig) -> Self {
        let init_secs = config.init_backoff.as_secs_f64();
        Self {
            init_secs,
            next_secs: init_secs,
            max_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// The next wait: uniformly drawn between the initial backoff and
    /// the current exponential ceiling.
    pub fn next(&mut self) -> Duration {
        let ceiling = self.next_secs * self.base;
        let drawn = thread_rng().gen_range(self.init_secs..ceiling.max(self.init_secs + f64::EPSILON));
        let next = self.max_secs.min(drawn);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_secs, next))
    }

    /// Retry `op` until it succeeds or `attempts` runs out.
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        task_name: &str,
        attempts: usize,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut remaining = attempts.max(1);
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if remaining > 1 => {
                    remaining -= 1;
                    let wait = self.next();
                    info!(
                        task_name,
                        error = %e,
                        backoff_ms = wait.as_millis() as u64,
                        "retryable failure, backing off",
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_grow_up_to_the_cap() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            base: 4.0,
        };
        let mut b = Backoff::new(&config);
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = b.next();
            assert!(last <= Duration::from_millis(100) + Duration::from_millis(1));
        }
        assert!(last >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn retry_stops_after_budget() {
        let mut b = Backoff::new(&BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.0,
        });
        let mut calls = 0;
        let r: Result<(), String> = b
            .retry("test", 3, || {
                calls += 1;
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(r.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let mut b = Backoff::new(&BackoffConfig::default());
        let mut calls = 0;
        let r: Result<u32, String> = b
            .retry("test", 5, || {
                calls += 1;
                let ok = calls >= 2;
                async move {
                    if ok {
                        Ok(7)
                    } else {
                        Err("not yet".to_string())
                    }
                }
            })
            .await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
