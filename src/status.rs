//! Exit status, lifecycle state and signal kinds.

use serde::{Deserialize, Serialize};

/// Exit code reported when the OS could not tell us the real one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// How a child process ended, or that it has not ended yet.
///
/// Moves from `NotExited` to one of the terminal variants exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitStatus {
    NotExited,
    /// Normal termination with the given exit code
    Exited(i32),
    /// Terminated by the given signal number
    Signaled(i32),
}

impl ExitStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExitStatus::NotExited)
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// The status folded into a single integer the way shells report it:
    /// the exit code, or `128 + signal` for a signal death.
    pub fn code(&self) -> Option<i32> {
        match *self {
            ExitStatus::NotExited => None,
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(sig) => Some(128 + sig),
        }
    }

    /// Decodes a raw `waitpid` status word.
    #[cfg(unix)]
    pub fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatus::Exited(UNKNOWN_EXIT_CODE)
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ExitStatus::Signaled(sig);
            }
        }
        ExitStatus::Exited(UNKNOWN_EXIT_CODE)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::NotExited => write!(f, "running"),
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

/// Lifecycle of a [`PtyProcess`](crate::PtyProcess).
///
/// `Created` only exists while `start` runs; a handle that callers can see
/// is always `Running` or `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Running,
    Exited,
}

/// Signals that can be requested through [`PtyProcess::signal`](crate::PtyProcess::signal).
///
/// Backends without POSIX signals treat every kind as a forceful kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Terminate,
    Kill,
    Interrupt,
    Hangup,
}

impl Signal {
    #[cfg(unix)]
    pub(crate) fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Sig;
        match self {
            Signal::Terminate => Sig::SIGTERM,
            Signal::Kill => Sig::SIGKILL,
            Signal::Interrupt => Sig::SIGINT,
            Signal::Hangup => Sig::SIGHUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_variants() {
        assert!(!ExitStatus::NotExited.is_terminal());
        assert!(ExitStatus::Exited(0).is_terminal());
        assert!(ExitStatus::Signaled(9).is_terminal());
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(3).success());
    }

    #[test]
    fn test_code_folds_signal() {
        assert_eq!(ExitStatus::NotExited.code(), None);
        assert_eq!(ExitStatus::Exited(7).code(), Some(7));
        assert_eq!(ExitStatus::Signaled(15).code(), Some(143));
    }

    #[cfg(unix)]
    #[test]
    fn test_decode_wait_status() {
        // exit(3): code in the second byte
        assert_eq!(ExitStatus::from_wait_status(3 << 8), ExitStatus::Exited(3));
        // killed by SIGKILL, no core dump
        assert_eq!(ExitStatus::from_wait_status(9), ExitStatus::Signaled(9));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_std_status() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(2 << 8);
        assert_eq!(ExitStatus::from(status), ExitStatus::Exited(2));
        let status = std::process::ExitStatus::from_raw(15);
        assert_eq!(ExitStatus::from(status), ExitStatus::Signaled(15));
    }
}
