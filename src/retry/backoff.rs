use std::sync::Arc;
use std::time::Duration;

/// Default number of retries before a message is dead-lettered.
///
/// `3` retries = `4` total deliveries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base of the default exponential backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Wait before redelivering a message that was nacked on `attempt`.
///
/// Implementations must be pure and non-decreasing in `attempt`.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `base × 2^attempt`, no jitter. Saturates at `Duration::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    pub base: Duration,
}

impl Exponential {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

impl BackoffPolicy for Exponential {
    fn delay(&self, attempt: u32) -> Duration {
        match 1u32.checked_shl(attempt) {
            Some(factor) => self.base.saturating_mul(factor),
            None => Duration::MAX,
        }
    }
}

/// Same delay for every attempt. `Constant(Duration::ZERO)` keeps tests fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant(pub Duration);

impl BackoffPolicy for Constant {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Retry bound plus the backoff between attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first delivery. `0` dead-letters on the
    /// first nack.
    pub max_attempts: u32,
    pub backoff: Arc<dyn BackoffPolicy>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: impl BackoffPolicy + 'static) -> Self {
        Self {
            max_attempts,
            backoff: Arc::new(backoff),
        }
    }

    #[inline]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Exponential::default())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &"<backoff>")
            .finish()
    }
}
