#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in thread_lifecycle packages.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// This function wraps a test closure with a timeout mechanism. If the test
/// takes longer than the timeout to complete, the test fails instead of
/// blocking CI/build systems forever.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     // Your test code here
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Check if we are running under mutation testing.
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        // Under mutation testing, disable the watchdog to allow hanging mutations.
        return test_fn();
    }

    // Miri is dramatically slower for thread synchronization, so we use a
    // longer timeout to avoid false positives while still catching real hangs.
    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match run_with_timeout(test_fn, timeout) {
        Some(result) => result,
        None => panic!("test exceeded {}-second timeout", timeout.as_secs()),
    }
}

/// Asserts that `blocking_fn` is still running after `duration`.
///
/// This is how we test that something never happens too early, for example that a barrier does
/// not release while a worker is still missing. The function runs on a separate thread, which
/// is left behind, still blocked, when the assertion succeeds.
///
/// # Panics
///
/// Panics if `blocking_fn` returns or panics within `duration`.
///
/// # Example
///
/// ```rust
/// use std::sync::mpsc;
/// use std::time::Duration;
///
/// use testing::assert_stays_blocked;
///
/// let (_tx, rx) = mpsc::channel::<()>();
///
/// // Nobody ever sends, so this stays blocked.
/// assert_stays_blocked(Duration::from_millis(50), move || {
///     drop(rx.recv());
/// });
/// ```
#[cfg_attr(test, mutants::skip)] // Mutations can only make this hang or pass vacuously.
pub fn assert_stays_blocked<F>(duration: Duration, blocking_fn: F)
where
    F: FnOnce() + Send + 'static,
{
    assert!(
        run_with_timeout(blocking_fn, duration).is_none(),
        "expected the operation to stay blocked for {duration:?} but it completed"
    );
}

/// Runs `f` on a new thread and waits up to `timeout` for it to finish.
///
/// Returns `None` if the thread is still running after the timeout. Panics from the thread are
/// propagated.
fn run_with_timeout<F, R>(f: F, timeout: Duration) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let result = f();
        // Send the result back - if this fails, the receiver has timed out
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            // Completed, join the thread to clean up
            handle.join().expect("thread sent its result so cannot have panicked");
            Some(result)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            // Thread panicked, join it to get the panic
            match handle.join() {
                Ok(()) => panic!("thread disconnected unexpectedly"),
                Err(e) => std::panic::resume_unwind(e),
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_allows_fast_tests() {
        let result = with_watchdog(|| {
            // A test that completes quickly
            42
        });
        assert_eq!(result, 42);
    }

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn watchdog_propagates_panic() {
        let _: u32 = with_watchdog(|| panic!("boom"));
    }

    #[test]
    fn stays_blocked_accepts_blocked() {
        let (_tx, rx) = mpsc::channel::<()>();

        assert_stays_blocked(Duration::from_millis(50), move || {
            drop(rx.recv());
        });
    }

    #[test]
    #[should_panic(expected = "expected the operation to stay blocked")]
    fn stays_blocked_rejects_completed() {
        assert_stays_blocked(Duration::from_secs(5), || {});
    }
}
