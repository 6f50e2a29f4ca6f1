//! Test utilities for printlink
//!
//! Provides timeout helpers and event assertions used by tests across
//! crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_sample_payload;
//!
//! let data = create_sample_payload(300);
//! assert_eq!(data[256], 0);
//! ```

use crate::channel::{EventReceiver, LinkEvent};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Wait for the next link event, panicking after [`DEFAULT_TEST_TIMEOUT`]
pub async fn next_event(events: &EventReceiver) -> LinkEvent {
    with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("event channel closed")
}

/// Assert that no event arrives within `quiet`
pub async fn expect_no_event(events: &EventReceiver, quiet: Duration) {
    if let Ok(Ok(event)) = tokio::time::timeout(quiet, events.recv()).await {
        panic!("expected no event, got {:?}", event);
    }
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns the final value of the condition. For use from threads that
/// cannot await.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Create a payload of the given size with a repeating byte ramp
pub fn create_sample_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
