//! Retry logic with exponential backoff for transient device errors.

use crate::client::{ClientError, ClientResult};
use crate::context::CancellationToken;
use crate::types::RetryConfig;
use std::time::{Duration, Instant};

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is about to be retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Wait before the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ClientError, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &ClientError, _delay: Duration) {}
}

/// Callback that logs retries at warn level.
pub struct LogCallback<'a>(pub &'a str);

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ClientError, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {}ms",
            self.0,
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
    }
}

/// When to give up waiting between attempts
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryBounds<'a> {
    pub cancel: Option<&'a CancellationToken>,
    /// No attempt starts after this instant
    pub deadline: Option<Instant>,
}

/// Execute a device call with retry logic.
///
/// Retries the call if it returns a retryable error, using exponential
/// backoff between attempts. Stops early, returning the last error, when
/// cancelled or when the next attempt would start past the deadline.
///
/// Returns the result and the number of attempts made.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    bounds: RetryBounds<'_>,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> (ClientResult<T>, u32)
where
    F: FnMut() -> ClientResult<T>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation() {
            Ok(result) => return (Ok(result), attempt),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return (Err(error), attempt);
        }

        let delay = config.delay_for_attempt(attempt - 1);
        if bounds.deadline.is_some_and(|d| Instant::now() + delay >= d) {
            return (Err(error), attempt);
        }

        if let Some(cb) = callback {
            cb.on_retry(attempt, max_attempts, &error, delay);
        }

        let cancelled = match bounds.cancel {
            Some(token) => token.wait(delay),
            None => {
                std::thread::sleep(delay);
                false
            }
        };
        if cancelled {
            return (Err(error), attempt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    fn busy() -> ClientError {
        ClientError::transport(Some(503), "busy")
    }

    #[test]
    fn test_success_first_try() {
        let (result, attempts) = with_retry(&RetryConfig::no_retry(), RetryBounds::default(), None, || Ok(42));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_conflict_is_not_retried() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let (result, _): (ClientResult<()>, _) = with_retry(&fast(), RetryBounds::default(), None, || {
            counter.set(counter.get() + 1);
            Err(ClientError::Conflict)
        });
        assert_eq!(result.unwrap_err(), ClientError::Conflict);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let (result, attempts) = with_retry(&fast(), RetryBounds::default(), None, || {
            let current = counter.get();
            counter.set(current + 1);
            if current < 2 { Err(busy()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_all_attempts_fail() {
        let (result, attempts): (ClientResult<()>, _) =
            with_retry(&fast(), RetryBounds::default(), None, || Err(ClientError::Timeout(Duration::from_secs(1))));
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct Counting(Arc<AtomicU32>);
        impl RetryCallback for Counting {
            fn on_retry(&self, _: u32, _: u32, _: &ClientError, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = Counting(count.clone());
        let _: (ClientResult<()>, _) = with_retry(&fast(), RetryBounds::default(), Some(&callback), || Err(busy()));

        // Not after the last attempt
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancellation_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let bounds = RetryBounds {
            cancel: Some(&token),
            deadline: None,
        };
        let (result, attempts): (ClientResult<()>, _) = with_retry(&fast(), bounds, None, || Err(busy()));
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_deadline_stops_retrying() {
        let bounds = RetryBounds {
            cancel: None,
            deadline: Some(Instant::now()),
        };
        let (_, attempts): (ClientResult<()>, _) = with_retry(&fast(), bounds, None, || Err(busy()));
        assert_eq!(attempts, 1);
    }
}
