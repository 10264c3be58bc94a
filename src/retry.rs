//! Transport retry strategies.
//!
//! A [`RetryStrategy`] governs one budget: how many times a single logical
//! call may resend after a transport-class failure (see
//! [`Error::is_retryable`](crate::Error::is_retryable)), and how long it
//! waits in between. The budget is counted per call and starts fresh for
//! every [`Client::execute`](crate::Client::execute). The one-shot token
//! refresh does not draw from it, and platform errcodes never consume it.

use rand::Rng;
use std::time::Duration;

/// Delay used by [`RetryStrategy::fixed`].
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How many transport failures a call absorbs, and the pause after each.
///
/// # Examples
///
/// ```
/// use wecom_dispatch::RetryStrategy;
/// use std::time::Duration;
///
/// assert_eq!(RetryStrategy::default(), RetryStrategy::None);
///
/// // Up to 3 resends, DEFAULT_RETRY_DELAY apart.
/// assert_eq!(RetryStrategy::fixed(3).max_retries(), 3);
///
/// // Pauses of 200ms, 400ms, 800ms, then 1s for every later resend.
/// let backoff = RetryStrategy::ExponentialBackoff {
///     initial_delay: Duration::from_millis(200),
///     max_delay: Duration::from_secs(1),
///     max_retries: 5,
///     jitter: false,
/// };
/// assert_eq!(backoff.delay_for_attempt(4), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetryStrategy {
    /// The first transport failure ends the call.
    #[default]
    None,

    /// The same pause before every resend.
    Linear {
        /// Pause before each resend.
        delay: Duration,
        /// Resends allowed per call.
        max_retries: usize,
    },

    /// Pauses that double per resend up to a ceiling.
    ///
    /// Resend `n` waits `initial_delay * 2^(n - 1)`, never more than
    /// `max_delay`. With `jitter`, each pause is scaled to a random 50-100%
    /// so concurrent calls hitting the same outage spread out.
    ExponentialBackoff {
        /// Pause before the first resend.
        initial_delay: Duration,
        /// Ceiling for any single pause.
        max_delay: Duration,
        /// Resends allowed per call.
        max_retries: usize,
        /// Randomize each pause.
        jitter: bool,
    },
}

impl RetryStrategy {
    /// `max_retries` retries with [`DEFAULT_RETRY_DELAY`] between them.
    /// Zero yields [`RetryStrategy::None`].
    pub fn fixed(max_retries: usize) -> Self {
        if max_retries == 0 {
            RetryStrategy::None
        } else {
            RetryStrategy::Linear {
                delay: DEFAULT_RETRY_DELAY,
                max_retries,
            }
        }
    }

    /// The pause before resend number `attempt` (1-based), or `None` once
    /// the call has used its budget.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            RetryStrategy::None => None,
            RetryStrategy::Linear { delay, max_retries } => {
                (attempt <= *max_retries).then_some(*delay)
            }
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                max_delay,
                max_retries,
                jitter,
            } => {
                if attempt > *max_retries {
                    return None;
                }

                let doublings = u32::try_from(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX)
                    .min(31);
                let pause = initial_delay
                    .checked_mul(1 << doublings)
                    .map_or(*max_delay, |d| d.min(*max_delay));

                Some(if *jitter {
                    pause.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
                } else {
                    pause
                })
            }
        }
    }

    /// Resends allowed per call.
    pub fn max_retries(&self) -> usize {
        match self {
            RetryStrategy::None => 0,
            RetryStrategy::Linear { max_retries, .. } => *max_retries,
            RetryStrategy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }
}
