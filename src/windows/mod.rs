//! Windows backends: the native pseudo console and the winpty agent, plus
//! the named pipes both of them (and the emulated backend) talk through.

mod channel;
mod cmdline;
pub(crate) mod conpty;
pub(crate) mod named_pipe;
mod procthreadattr;
pub(crate) mod winpty;

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};
use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::ERROR_ACCESS_DENIED;
use winapi::um::processthreadsapi::{GetExitCodeProcess, GetProcessId, TerminateProcess};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

pub use self::cmdline::find_executable;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::status::{ExitStatus, UNKNOWN_EXIT_CODE};

/// Exit code `TerminateProcess` leaves behind.
pub const TERMINATED_EXIT_CODE: u32 = 1;

/// NUL-terminated UTF-16 copy of `s`.
pub(crate) fn wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(Some(0)).collect()
}

/// A child process handle.
///
/// Holding the handle keeps the pid from being reused, so it is closed only
/// when the last owner lets go after the watcher published the exit.
pub(crate) struct ChildProcess {
    handle: OwnedHandle,
    pid: u32,
}

impl ChildProcess {
    /// # Safety
    /// `handle` must be an open process handle owned by the caller.
    pub(crate) unsafe fn from_raw(handle: HANDLE) -> Self {
        let pid = GetProcessId(handle);
        ChildProcess {
            handle: OwnedHandle::from_raw_handle(handle as _),
            pid,
        }
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Terminates the process unless its exit was already published.
    pub(crate) fn terminate(&self, latch: &ExitLatch) -> Result<()> {
        // SAFETY: the handle is open for the lifetime of `self`
        let done = latch.while_running(|| unsafe { TerminateProcess(self.raw(), TERMINATED_EXIT_CODE) });
        match done {
            None => Ok(()),
            Some(0) => {
                let err = io::Error::last_os_error();
                // Already exiting.
                if err.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                    Ok(())
                } else {
                    Err(PtyError::Io(err))
                }
            },
            Some(_) => Ok(()),
        }
    }

    /// Blocks until the process has exited and publishes its exit code.
    pub(crate) fn wait(&self, latch: &ExitLatch) -> ExitStatus {
        // SAFETY: the handle is open for the lifetime of `self`
        let result = unsafe { WaitForSingleObject(self.raw(), INFINITE) };
        if result != WAIT_OBJECT_0 {
            let err = io::Error::last_os_error();
            if result == WAIT_FAILED {
                warn!(pid = self.pid, %err, "waiting for process failed");
            } else {
                warn!(pid = self.pid, result, "unexpected wait result");
            }
            latch.publish(ExitStatus::Exited(UNKNOWN_EXIT_CODE));
            return latch.status();
        }

        latch.complete_with(|| {
            let mut code: DWORD = 0;
            // SAFETY: `code` outlives the call
            if unsafe { GetExitCodeProcess(self.raw(), &mut code) } == 0 {
                debug!(pid = self.pid, err = %io::Error::last_os_error(), "no exit code");
                ExitStatus::Exited(UNKNOWN_EXIT_CODE)
            } else {
                ExitStatus::Exited(code as i32)
            }
        });
        latch.status()
    }
}

/// Starts the thread that waits for `child`, publishes its exit on `latch`
/// and then runs `on_exit`.
pub(crate) fn watch<F>(child: Arc<ChildProcess>, latch: Arc<ExitLatch>, on_exit: F) -> Result<()>
where
    F: FnOnce(ExitStatus) + Send + 'static,
{
    let pid = child.pid();
    thread::Builder::new()
        .name(format!("ptyspawn-watcher:{pid}"))
        .spawn(move || {
            let status = child.wait(&latch);
            debug!(pid, %status, "process exited");
            on_exit(status);
        })
        .map(drop)
        .map_err(PtyError::Io)
}
