// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations a bounded number of
//! times at a fixed interval.
//!
//! Operations report whether a failure is worth another attempt by returning
//! [`BackoffError::transient`] (retry) or [`BackoffError::permanent`] (give up
//! now). Callers of [`retry_after`] only ever see the inner error type.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, Notify};

/// Bounded, fixed-interval retry policy.
///
/// An operation retried under this policy is called at most `max_attempts`
/// times (a value of zero still permits the first call), with `interval`
/// between consecutive calls. There is no growth and no jitter, so the total
/// time spent sleeping is bounded by [`RetryPolicy::max_wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Returns the [`Backoff`] implementation for this policy.
    pub fn backoff(&self) -> FixedAttempts {
        let retries = self.max_attempts.saturating_sub(1);
        FixedAttempts { retries, remaining: retries, interval: self.interval }
    }
}

/// [`Backoff`] yielding the same interval a fixed number of times.
#[derive(Clone, Debug)]
pub struct FixedAttempts {
    retries: u32,
    remaining: u32,
    interval: Duration,
}

impl Backoff for FixedAttempts {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.interval)
    }
}

/// Retry `operation` according to `policy`.
///
/// Returns as soon as the operation succeeds or fails permanently. If every
/// attempt fails transiently, the error from the final attempt is returned.
/// `notify` is invoked before each sleep with the transient error and the
/// upcoming delay.
///
/// Transient errors must be built with [`BackoffError::transient`]; an
/// explicit `retry_after` on the error would bypass the attempt bound.
pub async fn retry_after<T, E, F, Fut, N>(
    policy: &RetryPolicy,
    operation: F,
    notify: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackoffError<E>>>,
    N: Notify<E>,
{
    retry_notify(policy.backoff(), operation, notify).await
}

/// Like [`retry_after`], but for operations returning plain errors:
/// `is_retriable` decides whether a failure gets another attempt.
pub async fn retry_after_if<T, E, F, Fut, P, N>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retriable: P,
    notify: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: Notify<E>,
{
    let is_retriable = &is_retriable;
    retry_after(
        policy,
        move || {
            let attempt = operation();
            async move {
                attempt.await.map_err(|err| {
                    if is_retriable(&err) {
                        BackoffError::transient(err)
                    } else {
                        BackoffError::permanent(err)
                    }
                })
            }
        },
        notify,
    )
    .await
}
