//! Retry schedules for network-facing calls.
//!
//! The core pipeline never retries: it's level triggered and waits for the
//! next upstream update instead. Backoff is only for things like rebinding a
//! listening socket.
//!
//! A negative `max_attempts` retries forever. That's easy to misconfigure
//! into a retry storm, so a `ceiling` can cap the total number of attempts
//! regardless of `max_attempts`.

use std::future::Future;
use std::time::Duration as StdDuration;

use gantry_api::shared::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backoff {
    pub kind: BackoffKind,

    /// The delay before the first retry. Exponential backoff doubles it on
    /// every attempt.
    pub base: Duration,

    pub max_delay: Duration,

    /// The total number of attempts, including the first. Negative values
    /// retry indefinitely.
    pub max_attempts: i32,

    /// A hard cap on the total number of attempts that applies even when
    /// `max_attempts` is negative.
    pub ceiling: Option<u32>,

    /// Randomize each delay between half and all of its computed value.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: -1,
            ceiling: None,
            jitter: true,
        }
    }
}

impl Backoff {
    /// The maximum number of attempts this schedule allows, or `None` if it
    /// retries forever.
    pub fn attempt_limit(&self) -> Option<u32> {
        let limit = match self.max_attempts {
            n if n < 0 => None,
            n => Some((n as u32).max(1)),
        };

        match (limit, self.ceiling) {
            (Some(limit), Some(ceiling)) => Some(limit.min(ceiling.max(1))),
            (None, Some(ceiling)) => Some(ceiling.max(1)),
            (limit, None) => limit,
        }
    }

    /// The delay before retry number `retry`, starting from zero, without
    /// jitter.
    pub fn delay(&self, retry: u32) -> StdDuration {
        let base: StdDuration = self.base.into();
        let max: StdDuration = self.max_delay.into();

        let delay = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max)
            }
        };

        delay.min(max)
    }

    fn jittered_delay(&self, retry: u32) -> StdDuration {
        let delay = self.delay(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let half = delay / 2;
        let extra = crate::rand::with_thread_rng(|rng| rng.gen_range(0..=half.as_millis() as u64));
        half + StdDuration::from_millis(extra)
    }

    /// Run `op` until it succeeds or the schedule runs out of attempts,
    /// sleeping between failures. Returns the last error if every attempt
    /// fails.
    ///
    /// `op` is passed the attempt number, starting from 1.
    pub async fn retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let limit = self.attempt_limit();
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if limit.is_some_and(|limit| attempt >= limit) {
                if self.max_attempts < 0 {
                    tracing::warn!(
                        attempt,
                        ceiling = self.ceiling,
                        "unbounded retry stopped by the attempt ceiling"
                    );
                }
                return Err(err);
            }

            let delay = self.jittered_delay(attempt - 1);
            tracing::warn!(attempt, ?delay, err = %err, "attempt failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(max_attempts: i32, ceiling: Option<u32>) -> Backoff {
        Backoff {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
            ceiling,
            jitter: false,
        }
    }

    #[test]
    fn test_attempt_limit() {
        assert_eq!(backoff(3, None).attempt_limit(), Some(3));
        assert_eq!(backoff(0, None).attempt_limit(), Some(1));
        assert_eq!(backoff(-1, None).attempt_limit(), None);
        assert_eq!(backoff(-1, Some(10)).attempt_limit(), Some(10));
        assert_eq!(backoff(3, Some(10)).attempt_limit(), Some(3));
        assert_eq!(backoff(30, Some(10)).attempt_limit(), Some(10));
    }

    #[test]
    fn test_delays() {
        let b = backoff(-1, None);
        let delays: Vec<_> = (0..6).map(|i| b.delay(i).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(b.delay(64), StdDuration::from_secs(1));

        let fixed = Backoff {
            kind: BackoffKind::Fixed,
            ..b
        };
        assert_eq!(fixed.delay(5), StdDuration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let b = Backoff {
            jitter: true,
            ..backoff(-1, None)
        };
        for _ in 0..100 {
            let delay = b.jittered_delay(2);
            assert!(delay >= StdDuration::from_millis(200));
            assert!(delay <= StdDuration::from_millis(400));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = backoff(5, None)
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match attempt {
                        3 => Ok(attempt),
                        _ => Err(format!("attempt {attempt} failed")),
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = backoff(2, None)
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {attempt} failed")) }
            })
            .await;

        assert_eq!(result, Err("attempt 2 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_stops_at_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = backoff(-1, Some(7))
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_deserialize_defaults() {
        let b: Backoff = serde_json::from_value(serde_json::json!({
            "maxAttempts": 5,
            "base": "1s",
        }))
        .unwrap();

        assert_eq!(b.max_attempts, 5);
        assert_eq!(b.base, Duration::from_secs(1));
        assert_eq!(b.max_delay, Duration::from_secs(30));
        assert!(b.jitter);
    }
}
