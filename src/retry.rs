/* Copyright 2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Retry and rate-limit policies wrapped around the HTTP calls.

use log::warn;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Error;

/// Errors that can be told apart into "try again" and "give up".
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for Error {
    fn is_transient(&self) -> bool {
        Error::is_transient(self)
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is used up. The last error is returned in the latter cases.
pub async fn retry<T, E, F, Fut>(policy: &Backoff, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    "{what} failed (attempt {}/{}): {err}; retrying in {delay:?}",
                    attempt + 1,
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Client-side limit of `max_calls` per rolling `period`.
#[derive(Debug)]
pub struct RateLimit {
    max_calls: usize,
    period: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimit {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls,
            period,
            calls: VecDeque::with_capacity(max_calls),
        }
    }

    /// Record a call at `now` if the budget allows it. Otherwise return how
    /// long until the oldest call leaves the window.
    pub fn acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.period {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.calls.len() < self.max_calls {
            self.calls.push_back(now);
            Ok(())
        } else {
            // max_calls > 0 here, so there is a front
            let oldest = self.calls.front().copied().unwrap_or(now);
            Err(self.period.saturating_sub(now.duration_since(oldest)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (transient: {})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = Backoff::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), Flaky> = retry(&Backoff::default(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let result = retry(&Backoff::default(), "test", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n < 3 { Err(Flaky(true)) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        // 1s + 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let calls = Cell::new(0);
        let result: Result<(), Flaky> = retry(&Backoff::default(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(false)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn rate_limit_window() {
        let mut limit = RateLimit::new(12, Duration::from_secs(3600));
        let start = Instant::now();
        for i in 0..12 {
            assert!(limit.acquire(start + Duration::from_secs(i * 60)).is_ok());
        }
        let now = start + Duration::from_secs(1200);
        assert_eq!(limit.acquire(now), Err(Duration::from_secs(2400)));
        // First call has aged out
        assert!(limit.acquire(start + Duration::from_secs(3600)).is_ok());
        assert!(limit.acquire(start + Duration::from_secs(3601)).is_err());
    }
}
