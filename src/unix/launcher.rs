//! fork/exec of a child attached to a PTY slave.
//!
//! Everything the child needs is prepared in a [`LaunchPlan`] before the
//! fork. After the fork the child only calls async-signal-safe libc
//! functions and never returns into Rust code: any failure ends in
//! `_exit(127)`.

use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::libc::{self, c_char};
use nix::unistd::{access, AccessFlags, Pid};

use crate::error::{PtyError, Result};
use crate::options::{SpawnOptions, DEFAULT_TERM};

/// Exit code of a child that failed between fork and exec.
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Looks `name` up the way a shell would, using `PATH` from the child's
/// environment. Names containing a slash are only checked for execute
/// permission, relative to `directory` when one is given.
pub fn find_executable(
    name: &str,
    path_var: Option<&OsStr>,
    directory: Option<&Path>,
) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = match directory {
            Some(dir) if !name.starts_with('/') => dir.join(name),
            _ => PathBuf::from(name),
        };
        return is_executable(&candidate).then(|| PathBuf::from(name));
    }

    let path_var = path_var?;
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn cstring(bytes: impl Into<Vec<u8>>, what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| PtyError::InvalidCommand(format!("{what} contains NUL")))
}

/// Child-side inputs of one launch, fully materialized before `fork`.
pub(crate) struct LaunchPlan {
    program: String,
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    directory: Option<CString>,
    slave_name: CString,
    console: bool,
    master_fd: RawFd,
    /// Write end of the stderr pipe; closed in the parent after the fork
    stderr_tx: Option<OwnedFd>,
    max_fd: RawFd,
}

impl LaunchPlan {
    pub(crate) fn new(
        options: &SpawnOptions,
        slave_name: CString,
        master_fd: RawFd,
        stderr_tx: Option<OwnedFd>,
    ) -> Result<Self> {
        let mut env = options.resolved_environment();
        env.entry(OsString::from("TERM"))
            .or_insert_with(|| OsString::from(DEFAULT_TERM));

        let program = options.program().to_string();
        let resolved = find_executable(
            &program,
            env.get(OsStr::new("PATH")).map(OsString::as_os_str),
            options.directory.as_deref(),
        )
        .ok_or_else(|| PtyError::ExecutableNotFound(program.clone()))?;

        let argv = options
            .command
            .iter()
            .map(|arg| cstring(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                cstring(entry, "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;
        let directory = options
            .directory
            .as_ref()
            .map(|dir| cstring(dir.as_os_str().as_bytes(), "directory"))
            .transpose()?;

        // SAFETY: sysconf has no preconditions
        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max_fd = if open_max <= 0 {
            1024
        } else {
            open_max.min(RawFd::MAX as libc::c_long) as RawFd
        };

        Ok(LaunchPlan {
            program,
            path: cstring(resolved.into_os_string().into_vec(), "program path")?,
            argv,
            envp,
            directory,
            slave_name,
            console: options.console,
            master_fd,
            stderr_tx,
            max_fd,
        })
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    /// Forks and execs. Returns the child's pid in the parent.
    ///
    /// Must run on the thread that will later wait for the child.
    pub(crate) fn spawn(mut self) -> Result<Pid> {
        let argv = null_terminated(&self.argv);
        let envp = null_terminated(&self.envp);
        let stderr_fd = self.stderr_tx.as_ref().map(AsRawFd::as_raw_fd);

        // SAFETY: the child branch only calls async-signal-safe functions on
        // memory prepared above and ends in execve or _exit.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(PtyError::Fork(std::io::Error::last_os_error()));
        }
        if pid == 0 {
            // SAFETY: see above
            unsafe { self.exec_child(&argv, &envp, stderr_fd) }
        }

        // Parent keeps only the read end of the stderr pipe.
        drop(self.stderr_tx.take());
        Ok(Pid::from_raw(pid))
    }

    unsafe fn exec_child(
        &self,
        argv: &[*const c_char],
        envp: &[*const c_char],
        stderr_fd: Option<RawFd>,
    ) -> ! {
        // Restore default dispositions the parent may have changed.
        for sig in [libc::SIGPIPE, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            libc::signal(sig, libc::SIG_DFL);
        }
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::pthread_sigmask(libc::SIG_SETMASK, &unblock, ptr::null_mut());

        if let Some(dir) = &self.directory {
            if libc::chdir(dir.as_ptr()) < 0 {
                libc::_exit(EXEC_FAILED_EXIT_CODE);
            }
        }

        if !self.console && libc::setsid() < 0 {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }

        let slave = libc::open(self.slave_name.as_ptr(), libc::O_RDWR);
        if slave < 0 {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }

        if self.console {
            let mut attrs: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(slave, &mut attrs) == 0 {
                attrs.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
                libc::tcsetattr(slave, libc::TCSANOW, &attrs);
            }
            if libc::setpgid(0, 0) < 0 {
                libc::_exit(EXEC_FAILED_EXIT_CODE);
            }
        } else {
            // Opening the slave after setsid already made it the controlling
            // terminal on Linux; BSDs need the ioctl.
            libc::ioctl(slave, libc::TIOCSCTTY as _, 0);
        }

        libc::close(self.master_fd);

        if libc::dup2(slave, libc::STDIN_FILENO) < 0
            || libc::dup2(slave, libc::STDOUT_FILENO) < 0
            || libc::dup2(stderr_fd.unwrap_or(slave), libc::STDERR_FILENO) < 0
        {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }

        close_descriptors_from(3, self.max_fd);

        libc::execve(self.path.as_ptr(), argv.as_ptr(), envp.as_ptr());
        libc::_exit(EXEC_FAILED_EXIT_CODE)
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

unsafe fn close_descriptors_from(first: RawFd, max_fd: RawFd) {
    #[cfg(target_os = "linux")]
    {
        if libc::syscall(libc::SYS_close_range, first as libc::c_uint, libc::c_uint::MAX, 0) == 0 {
            return;
        }
    }
    for fd in first..max_fd {
        libc::close(fd);
    }
}
