// ABOUTME: Retry backoff policies and the retry helper that drives them
//
// Two closed variants: a constant interval, and an exponential interval with
// uniform jitter. Neither caps growth beyond `max_retries`, so callers keep
// `max_retries` small.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use rand::Rng;

/// Computes successive wait durations for one retry sequence.
///
/// A policy is stateful: each call to [`BackoffPolicy::next`] consumes one
/// attempt. Create a fresh policy for every retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Always waits `interval`
    Constant {
        /// Attempts consumed so far
        attempt: u32,
        /// Attempts allowed before exhaustion
        max_retries: u32,
        /// Wait between attempts
        interval: Duration,
    },

    /// Waits `2^attempt * interval + rand[0, interval)`
    Exponential {
        /// Attempts consumed so far (0-indexed exponent)
        attempt: u32,
        /// Attempts allowed before exhaustion
        max_retries: u32,
        /// Base interval, also the jitter width
        interval: Duration,
    },
}

impl BackoffPolicy {
    /// Policy returning the same interval for every retry
    #[must_use]
    pub const fn constant(max_retries: u32, interval: Duration) -> Self {
        Self::Constant {
            attempt: 0,
            max_retries,
            interval,
        }
    }

    /// Policy doubling the interval on every retry, plus jitter
    #[must_use]
    pub const fn exponential(max_retries: u32, interval: Duration) -> Self {
        Self::Exponential {
            attempt: 0,
            max_retries,
            interval,
        }
    }

    /// Next wait duration, or `None` once `max_retries` waits were handed out.
    pub fn next(&mut self) -> Option<Duration> {
        match self {
            Self::Constant {
                attempt,
                max_retries,
                interval,
            } => {
                if *attempt >= *max_retries {
                    return None;
                }
                *attempt += 1;
                Some(*interval)
            }
            Self::Exponential {
                attempt,
                max_retries,
                interval,
            } => {
                if *attempt >= *max_retries {
                    return None;
                }
                let scaled = interval.saturating_mul(2u32.saturating_pow(*attempt));
                let jitter = if interval.is_zero() {
                    Duration::ZERO
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..*interval)
                };
                *attempt += 1;
                Some(scaled.saturating_add(jitter))
            }
        }
    }

    /// Attempts consumed so far
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Constant { attempt, .. } | Self::Exponential { attempt, .. } => *attempt,
        }
    }

    /// True once `next` will return `None`
    pub const fn is_exhausted(&self) -> bool {
        match self {
            Self::Constant {
                attempt,
                max_retries,
                ..
            }
            | Self::Exponential {
                attempt,
                max_retries,
                ..
            } => *attempt >= *max_retries,
        }
    }
}

/// Repeatedly runs `block`, sleeping between runs for the policy's next
/// interval.
///
/// `block` returns `ControlFlow::Break(value)` to stop and
/// `ControlFlow::Continue(())` to ask for another attempt. Returns the break
/// value, or `None` once the policy is exhausted.
pub async fn call_with_backoff<T, F, Fut>(policy: &mut BackoffPolicy, mut block: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    loop {
        if let ControlFlow::Break(value) = block().await {
            return Some(value);
        }

        match policy.next() {
            Some(wait) => tokio::time::sleep(wait).await,
            None => return None,
        }
    }
}
