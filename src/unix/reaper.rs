//! The per-process reaper thread.
//!
//! The thread that forks is the thread that waits: it runs the launch plan,
//! reports the pid (or the launch error) back to `start`, then blocks until
//! the child exits and publishes the status on the process's exit latch.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, killpg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::launcher::LaunchPlan;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::status::{ExitStatus, Signal, UNKNOWN_EXIT_CODE};

/// Spawns the reaper thread, launches the child on it and waits for the
/// launch outcome. `on_exit` runs on the reaper after the status is published.
pub(crate) fn launch(
    plan: LaunchPlan,
    latch: Arc<ExitLatch>,
    on_exit: impl FnOnce(ExitStatus) + Send + 'static,
) -> Result<Pid> {
    let (launched_tx, launched_rx) = mpsc::sync_channel::<Result<Pid>>(1);
    let name = format!("ptyspawn-reaper:{}", plan.program());

    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let pid = match plan.spawn() {
                Ok(pid) => pid,
                Err(err) => {
                    let _ = launched_tx.send(Err(err));
                    return;
                },
            };
            // The receiver only goes away if `start` itself panicked.
            let _ = launched_tx.send(Ok(pid));

            let status = wait_for_exit(pid, &latch);
            debug!(pid = pid.as_raw(), %status, "child exited");
            on_exit(status);
        })
        .map_err(PtyError::Fork)?;

    launched_rx
        .recv()
        .map_err(|_| PtyError::Fork(io::Error::other("reaper thread died before launching")))?
}

/// Blocks until `pid` exits, then reaps it and publishes the status.
///
/// The zombie is only reaped while the latch is held, so
/// [`raise`] can never signal a recycled pid.
pub(crate) fn wait_for_exit(pid: Pid, latch: &ExitLatch) -> ExitStatus {
    loop {
        // SAFETY: zeroed siginfo_t is a valid out-parameter for waitid
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: plain syscall on our own child
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            break;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            errno => {
                warn!(pid = pid.as_raw(), %errno, "waitid failed, exit code unknown");
                latch.publish(ExitStatus::Exited(UNKNOWN_EXIT_CODE));
                return latch.status();
            },
        }
    }

    latch.complete_with(|| reap(pid));
    latch.status()
}

fn reap(pid: Pid) -> ExitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitStatus::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitStatus::Signaled(signal as i32),
            // Stop/continue notifications are not requested; keep waiting.
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                warn!(pid = pid.as_raw(), %errno, "waitpid failed, exit code unknown");
                return ExitStatus::Exited(UNKNOWN_EXIT_CODE);
            },
        }
    }
}

/// Sends `signal` to the child's process group, falling back to the child
/// alone. A no-op once the child has been reaped.
pub(crate) fn raise(pid: Pid, latch: &ExitLatch, signal: Signal) -> Result<()> {
    let sig = signal.to_nix();
    let sent = latch.while_running(|| match killpg(pid, sig) {
        Ok(()) => Ok(()),
        Err(_) => kill(pid, sig),
    });
    match sent {
        None | Some(Ok(())) => Ok(()),
        // Exited but not reaped yet.
        Some(Err(Errno::ESRCH)) => Ok(()),
        Some(Err(errno)) => Err(PtyError::Io(crate::error::errno_to_io(errno))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn test_wait_decodes_exit_code() {
        let child = Command::new("/bin/sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let latch = ExitLatch::new();
        assert_eq!(wait_for_exit(pid, &latch), ExitStatus::Exited(3));
        assert_eq!(latch.status(), ExitStatus::Exited(3));
    }

    #[test]
    fn test_raise_terminates_and_is_noop_after() {
        let child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let latch = Arc::new(ExitLatch::new());

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || wait_for_exit(pid, &latch))
        };
        // sleep is not a group leader here, so killpg fails and kill is used
        raise(pid, &latch, Signal::Terminate).unwrap();
        let status = waiter.join().unwrap();
        assert_eq!(status, ExitStatus::Signaled(libc::SIGTERM));

        raise(pid, &latch, Signal::Kill).unwrap();
        assert_eq!(latch.wait_timeout(Duration::ZERO), Some(status));
    }
}
