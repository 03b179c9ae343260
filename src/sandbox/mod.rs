//! Sandbox Module
//!
//! Runs hooks with a hard deadline, isolated from the caller's failure
//! domain. Two strategies sit behind one `run` contract:
//! - `ProcessIsolated`: forked child, memory ceiling, killed on timeout (unix)
//! - `ThreadIsolated`: worker thread, abandoned on timeout
//!
//! The strategy is chosen once, at construction, by probing the platform.

#[cfg(unix)]
mod process;
mod thread;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{CacheError, SandboxError};

#[cfg(unix)]
pub use process::ProcessSandbox;
pub use thread::ThreadSandbox;

// == Isolation Mode ==
/// Requested isolation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Process isolation where the platform supports it, else threads
    #[default]
    Auto,
    Process,
    Thread,
}

impl FromStr for IsolationMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, CacheError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(IsolationMode::Auto),
            "process" => Ok(IsolationMode::Process),
            "thread" => Ok(IsolationMode::Thread),
            other => Err(CacheError::Configuration(format!(
                "unsupported isolation mode: {}",
                other
            ))),
        }
    }
}

/// Whether the host can run hooks in a separate, resource-limited process.
pub fn process_isolation_supported() -> bool {
    cfg!(unix)
}

// == Sandbox ==
/// Resolved isolation strategy.
#[derive(Debug, Clone, Copy)]
pub enum Sandbox {
    #[cfg(unix)]
    ProcessIsolated(ProcessSandbox),
    ThreadIsolated(ThreadSandbox),
}

impl Sandbox {
    /// Resolves a requested mode against platform capability.
    ///
    /// A process request on a platform without process limits degrades to
    /// thread isolation with a warning.
    pub fn detect(mode: IsolationMode, memory_limit: Option<u64>) -> Self {
        match mode {
            IsolationMode::Thread => Sandbox::ThreadIsolated(ThreadSandbox::new()),
            IsolationMode::Auto | IsolationMode::Process => {
                #[cfg(unix)]
                {
                    Sandbox::ProcessIsolated(ProcessSandbox::new(memory_limit))
                }
                #[cfg(not(unix))]
                {
                    if mode == IsolationMode::Process {
                        warn!("process isolation unsupported on this platform, using threads");
                    }
                    if memory_limit.is_some() {
                        warn!("memory limit ignored under thread isolation");
                    }
                    Sandbox::ThreadIsolated(ThreadSandbox::new())
                }
            }
        }
    }

    /// True when hooks run in a separate process.
    pub fn is_process_isolated(&self) -> bool {
        match self {
            #[cfg(unix)]
            Sandbox::ProcessIsolated(_) => true,
            Sandbox::ThreadIsolated(_) => false,
        }
    }

    /// Runs a blocking hook under the selected strategy.
    pub fn run<T, F>(&self, f: F, timeout: Duration) -> Result<T, SandboxError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        match self {
            #[cfg(unix)]
            Sandbox::ProcessIsolated(sandbox) => sandbox.run(f, timeout),
            Sandbox::ThreadIsolated(sandbox) => sandbox.run(f, timeout),
        }
    }
}

impl fmt::Display for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_process_isolated() {
            write!(f, "process-isolated")
        } else {
            write!(f, "thread-isolated")
        }
    }
}

// == Async Hooks ==
/// Runs an async hook on the current tokio runtime with a deadline.
///
/// The hook runs as its own task so a panic is contained; on timeout the
/// task is aborted at its next await point.
pub async fn run_async<Fut>(fut: Fut, timeout: Duration) -> Result<(), SandboxError>
where
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut task = tokio::spawn(fut);
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(SandboxError::Failure(err)),
        Ok(Err(join_err)) => Err(SandboxError::Failure(anyhow!(
            "async hook aborted: {}",
            join_err
        ))),
        Err(_) => {
            task.abort();
            warn!(?timeout, "async hook exceeded deadline, task aborted");
            Err(SandboxError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_thread_mode() {
        let sandbox = Sandbox::detect(IsolationMode::Thread, Some(1024));
        assert!(!sandbox.is_process_isolated());
        assert_eq!(sandbox.to_string(), "thread-isolated");
    }

    #[test]
    fn test_auto_follows_platform() {
        let sandbox = Sandbox::detect(IsolationMode::Auto, None);
        assert_eq!(sandbox.is_process_isolated(), process_isolation_supported());
    }

    #[test]
    fn test_uniform_run_contract() {
        for mode in [IsolationMode::Auto, IsolationMode::Thread] {
            let sandbox = Sandbox::detect(mode, None);
            assert_eq!(sandbox.run(|| Ok(7u32), Duration::from_secs(5)).unwrap(), 7);
            let failed: Result<u32, _> =
                sandbox.run(|| Err(anyhow!("nope")), Duration::from_secs(5));
            assert!(matches!(failed, Err(SandboxError::Failure(_))));
        }
    }

    #[test]
    fn test_parse_isolation_mode() {
        assert_eq!("Process".parse::<IsolationMode>().unwrap(), IsolationMode::Process);
        assert!("vm".parse::<IsolationMode>().is_err());
    }

    #[tokio::test]
    async fn test_async_hook_timeout() {
        let result = run_async(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(SandboxError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_async_hook_panic_is_contained() {
        let result = run_async(
            async {
                if true {
                    panic!("async kaboom");
                }
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(SandboxError::Failure(_))));
    }
}
