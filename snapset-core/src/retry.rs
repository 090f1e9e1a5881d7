//! Retrying fallible async operations.
//!
//! A finished future cannot be polled again, so callers pass a factory
//! `Fn(attempt) -> Future` and a [`RetryPolicy`] that decides, per error,
//! whether to retry now, wait, or give up.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction<E: Debug> {
    RetryNow,
    WaitFor(Duration),
    ReturnError(E),
}

/// Decides the [`RetryAction`] for each failed attempt (numbered from 0).
pub trait RetryPolicy<E: Debug> {
    fn on_ok(&mut self, _attempt: u32) {}
    fn on_err(&mut self, attempt: u32, err: E) -> RetryAction<E>;
}

impl<P, E: Debug> RetryPolicy<E> for P
where
    P: FnMut(u32, E) -> RetryAction<E>,
{
    fn on_err(&mut self, attempt: u32, err: E) -> RetryAction<E> {
        (*self)(attempt, err)
    }
}

/// Drive `factory` until it succeeds or `policy` returns the error.
pub async fn retry_future<T, E, F, FF>(factory: FF, mut policy: impl RetryPolicy<E>) -> Result<T, E>
where
    E: Debug,
    F: Future<Output = Result<T, E>>,
    FF: Fn(u32) -> F,
{
    let mut attempt = 0u32;
    loop {
        match factory(attempt).await {
            Ok(x) => {
                policy.on_ok(attempt);
                return Ok(x);
            }
            Err(e) => {
                let action = policy.on_err(attempt, e);
                debug!(attempt, action = ?action, "Attempt failed");
                match action {
                    RetryAction::RetryNow => {}
                    RetryAction::WaitFor(delay) => tokio::time::sleep(delay).await,
                    RetryAction::ReturnError(err) => return Err(err),
                }
            }
        }
        attempt += 1;
    }
}

/// Attempt-bounded backoff for coordinator errors.
///
/// Only errors for which [`Error::is_retryable`] holds are retried, unless
/// the backoff was built with [`Backoff::retry_all`].
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    multiplier: u32,
    retry_all: bool,
    label: &'static str,
}

impl Backoff {
    /// Constant `delay` between at most `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base: delay,
            cap: delay,
            multiplier: 1,
            retry_all: false,
            label: "operation",
        }
    }

    /// `base`, `2 * base`, `4 * base`, ... never more than `cap`.
    pub fn capped_exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            multiplier: 2,
            retry_all: false,
            label: "operation",
        }
    }

    /// Retry every error, not only the retryable ones.
    pub fn retry_all(mut self) -> Self {
        self.retry_all = true;
        self
    }

    /// Name used in retry log lines.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl RetryPolicy<Error> for Backoff {
    fn on_err(&mut self, attempt: u32, err: Error) -> RetryAction<Error> {
        let retry = self.retry_all || err.is_retryable();
        if !retry || attempt + 1 >= self.max_attempts {
            return RetryAction::ReturnError(err);
        }
        let delay = self.delay_after(attempt);
        warn!(
            what = self.label,
            attempt = attempt + 1,
            max_attempts = self.max_attempts,
            delay_secs = delay.as_secs_f64(),
            error = %err,
            "Retrying"
        );
        RetryAction::WaitFor(delay)
    }
}
