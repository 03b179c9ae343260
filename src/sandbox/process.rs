//! Process isolation (unix)
//!
//! Forks a child that applies an address-space ceiling, runs the hook and
//! reports `Result<T, String>` as JSON over a pipe. A child still alive at
//! the deadline is killed with SIGKILL and reaped.
//!
//! The child is a copy of the caller's memory: side effects a hook makes on
//! shared state are not visible to the parent. Only the returned value is.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::thread::panic_message;
use crate::error::SandboxError;

/// Interval between liveness checks on the child.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Held from pipe creation until the parent closes its write end, so a
/// concurrent fork never inherits another run's write end and stalls its EOF.
static FORK_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Strong isolation strategy backed by a forked child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSandbox {
    /// Address-space headroom granted to the child, in bytes
    memory_limit: Option<u64>,
}

impl ProcessSandbox {
    pub fn new(memory_limit: Option<u64>) -> Self {
        Self { memory_limit }
    }

    /// Runs `f` in a forked child with a deadline and optional memory ceiling.
    pub fn run<T, F>(&self, f: F, timeout: Duration) -> Result<T, SandboxError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        // The ceiling counts on top of what the forked image already maps
        let ceiling = self
            .memory_limit
            .map(|extra| current_address_space().saturating_add(extra));

        let fork_guard = FORK_LOCK.lock();
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe() writes
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(SandboxError::Spawn(io::Error::last_os_error().to_string()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        // SAFETY: the child only runs the hook, writes to its pipe and _exits
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: both descriptors were just created and are owned here
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(SandboxError::Spawn(err.to_string()));
        }

        if pid == 0 {
            // SAFETY: read end is unused in the child
            unsafe { libc::close(read_fd) };
            let outcome = run_child(f, ceiling);
            let payload = serde_json::to_vec(&outcome).unwrap_or_default();
            // SAFETY: write_fd is a valid descriptor owned by this process
            let mut pipe = unsafe { File::from_raw_fd(write_fd) };
            let _ = pipe.write_all(&payload);
            drop(pipe);
            // SAFETY: skip atexit handlers and destructors inherited from the parent
            unsafe { libc::_exit(0) };
        }

        // SAFETY: write end belongs to the child now
        unsafe { libc::close(write_fd) };
        drop(fork_guard);
        drop(f);

        // SAFETY: read_fd is a valid descriptor owned by the parent
        let mut pipe = unsafe { File::from_raw_fd(read_fd) };
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        });

        let status = match wait_until(pid, timeout) {
            Some(status) => status,
            None => {
                warn!(pid, ?timeout, "killing overrunning sandbox process");
                // SAFETY: pid is our unreaped child
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    let mut status = 0;
                    libc::waitpid(pid, &mut status, 0);
                }
                let _ = reader.join();
                return Err(SandboxError::Timeout(timeout));
            }
        };

        let bytes = reader.join().unwrap_or_default();
        if bytes.is_empty() {
            return Err(SandboxError::Failure(anyhow!(
                "sandbox process {}",
                describe_status(status)
            )));
        }
        match serde_json::from_slice::<std::result::Result<T, String>>(&bytes) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SandboxError::Failure(anyhow!(message))),
            Err(e) => Err(SandboxError::Failure(anyhow!(
                "malformed sandbox reply: {}",
                e
            ))),
        }
    }
}

/// Body of the forked child.
fn run_child<T, F>(f: F, ceiling: Option<u64>) -> std::result::Result<T, String>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    if let Some(limit) = ceiling {
        let rlim = libc::rlimit {
            rlim_cur: limit as libc::rlim_t,
            rlim_max: limit as libc::rlim_t,
        };
        // SAFETY: rlim is a valid rlimit value
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &rlim) } != 0 {
            return Err(format!(
                "could not apply memory limit: {}",
                io::Error::last_os_error()
            ));
        }
    }
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{:#}", err)),
        Err(payload) => Err(format!("hook panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Polls the child until it exits or the deadline passes.
///
/// Returns the raw wait status, or `None` if the child is still running.
fn wait_until(pid: libc::pid_t, timeout: Duration) -> Option<libc::c_int> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut status = 0;
        // SAFETY: pid is our child; status is a valid out pointer
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            return Some(status);
        }
        if rc < 0 {
            debug!(pid, error = %io::Error::last_os_error(), "waitpid failed");
            return Some(status);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn describe_status(status: libc::c_int) -> String {
    if libc::WIFSIGNALED(status) {
        format!("terminated by signal {}", libc::WTERMSIG(status))
    } else if libc::WIFEXITED(status) {
        format!("exited with status {} without reporting", libc::WEXITSTATUS(status))
    } else {
        "ended without reporting".to_string()
    }
}

/// Current virtual address space size of this process, in bytes.
#[cfg(target_os = "linux")]
fn current_address_space() -> u64 {
    let pages = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|p| p.parse::<u64>().ok()))
        .unwrap_or(0);
    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * page_size.max(0) as u64
}

#[cfg(not(target_os = "linux"))]
fn current_address_space() -> u64 {
    0
}
