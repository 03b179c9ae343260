//! Thread isolation
//!
//! Runs a hook on a dedicated OS thread and waits up to the deadline. A
//! thread cannot be killed: on timeout it is abandoned and left to finish in
//! the background with its result discarded. No memory ceiling applies.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use tracing::debug;

use crate::error::SandboxError;

/// Fallback isolation strategy backed by a worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSandbox;

impl ThreadSandbox {
    pub fn new() -> Self {
        Self
    }

    /// Runs `f` on a fresh thread, failing with [`SandboxError::Timeout`] if
    /// it has not completed after `timeout`.
    pub fn run<T, F>(&self, f: F, timeout: Duration) -> Result<T, SandboxError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("livecache-sandbox".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f));
                // Receiver is gone if the caller already timed out
                let _ = tx.send(outcome);
            })
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(SandboxError::Failure(err)),
            Ok(Err(payload)) => Err(SandboxError::Failure(anyhow!(
                "hook panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(RecvTimeoutError::Timeout) => {
                debug!(?timeout, "abandoning overrunning sandbox thread");
                Err(SandboxError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SandboxError::Failure(anyhow!(
                "sandbox thread exited without reporting"
            ))),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_returns_value() {
        let result = ThreadSandbox::new().run(|| Ok(21 * 2), Duration::from_secs(1));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_error_is_wrapped() {
        let result: Result<(), _> =
            ThreadSandbox::new().run(|| Err(anyhow!("bad hook")), Duration::from_secs(1));
        match result {
            Err(SandboxError::Failure(err)) => assert_eq!(err.to_string(), "bad hook"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_contained() {
        let result: Result<(), _> =
            ThreadSandbox::new().run(|| panic!("kaboom"), Duration::from_secs(1));
        match result {
            Err(SandboxError::Failure(err)) => assert!(err.to_string().contains("kaboom")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_abandons_thread() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let start = Instant::now();

        let result: Result<(), _> = ThreadSandbox::new().run(
            move || {
                thread::sleep(Duration::from_millis(500));
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(50),
        );

        assert!(matches!(result, Err(SandboxError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_millis(400));
        // The abandoned thread still runs to completion
        thread::sleep(Duration::from_millis(700));
        assert!(finished.load(Ordering::SeqCst));
    }
}
