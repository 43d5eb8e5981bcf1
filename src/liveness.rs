//! Process liveness.
//!
//! The analyzer must not outlive the process that supervises it. A probe
//! checks both our own pid and the parent pid; a watch task runs the probe on
//! an interval and cancels the root token when either is gone. Everything
//! else only looks at the token.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// True if a process with this pid exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // signal 0: existence check only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // exists but owned by someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Pid of the process that started us.
#[cfg(unix)]
pub fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

#[cfg(not(unix))]
pub fn parent_pid() -> u32 {
    0
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessProbe {
    own_pid: u32,
    parent_pid: Option<u32>,
}

impl LivenessProbe {
    /// `parent_pid = None` disables the parent check (own pid is still probed).
    pub fn new(parent_pid: Option<u32>) -> Self {
        Self {
            own_pid: std::process::id(),
            parent_pid,
        }
    }

    pub fn check(&self) -> bool {
        process_alive(self.own_pid) && self.parent_pid.is_none_or(process_alive)
    }

    /// Poll `check` every `interval` and cancel `token` once it fails.
    pub fn watch(self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.check() {
                            error!(parent = ?self.parent_pid, "parent process is gone, stopping");
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(LivenessProbe::new(None).check());
        assert!(LivenessProbe::new(Some(parent_pid())).check());
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!process_alive(pid));
        assert!(!LivenessProbe::new(Some(pid)).check());
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_watch_cancels_token() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let token = CancellationToken::new();
        let handle = LivenessProbe::new(Some(pid)).watch(Duration::from_millis(10), token.clone());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
