//! POSIX PTY backend.

mod channel;
pub(crate) mod fifo;
pub(crate) mod launcher;
mod pty;
pub(crate) mod reaper;

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::{pipe, Pid};
use tracing::{debug, warn};

use self::channel::FdChannel;
pub use self::launcher::{find_executable, EXEC_FAILED_EXIT_CODE};
use self::launcher::LaunchPlan;
use self::pty::{get_window_size, set_cloexec, set_noecho, set_window_size, PtyPair};
use crate::backend::BackendOps;
use crate::drain::ReadActivity;
use crate::error::{errno_to_io, PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::SpawnOptions;
use crate::platform::BackendKind;
use crate::size::WindowSize;
use crate::status::Signal;
use crate::stream::{ChannelRead, ChannelWrite};

/// Attempts at setting the initial size while the fresh slave still
/// reports `ENOTTY`.
const INITIAL_SIZE_ATTEMPTS: usize = 1000;

/// A child running on a PTY master/slave pair.
pub(crate) struct UnixPty {
    pid: Pid,
    latch: Arc<ExitLatch>,
    master: Arc<FdChannel>,
    stderr: Option<Arc<FdChannel>>,
    /// Read-only slave descriptor held by the parent
    slave: Arc<Mutex<Option<OwnedFd>>>,
    output_activity: Arc<ReadActivity>,
    error_activity: Arc<ReadActivity>,
    console: bool,
}

impl UnixPty {
    pub(crate) fn spawn(options: &SpawnOptions, latch: Arc<ExitLatch>) -> Result<Self> {
        let pair = PtyPair::open()?;

        let split_stderr = options.console && !options.redirect_error_stream;
        let (stderr_rx, stderr_tx) = if split_stderr {
            let (rx, tx) = pipe().map_err(|e| PtyError::Pipe(errno_to_io(e)))?;
            set_cloexec(&rx)?;
            set_cloexec(&tx)?;
            (Some(rx), Some(tx))
        } else {
            (None, None)
        };

        // Keeps the PTY from hanging up before the child opens its side,
        // and holds late output after exit.
        let slave = Arc::new(Mutex::new(Some(pair.open_slave_reader()?)));
        let plan = LaunchPlan::new(options, pair.slave_name.clone(), pair.master.as_raw_fd(), stderr_tx)?;

        let master = Arc::new(FdChannel::new(pair.master, "pty")?);
        let stderr = stderr_rx
            .map(|rx| FdChannel::new(rx, "stderr").map(Arc::new))
            .transpose()?;

        let pid = {
            let master = Arc::clone(&master);
            let stderr = stderr.clone();
            let slave = Arc::clone(&slave);
            let preserve = options.preserve_output_after_exit;
            reaper::launch(plan, Arc::clone(&latch), move |_| {
                if !preserve {
                    drop(lock_slave(&slave).take());
                }
                master.break_read();
                if let Some(stderr) = &stderr {
                    stderr.break_read();
                }
            })?
        };

        let process = UnixPty {
            pid,
            latch,
            master,
            stderr,
            slave,
            output_activity: Arc::new(ReadActivity::new()),
            error_activity: Arc::new(ReadActivity::new()),
            console: options.console,
        };

        if let Some(size) = options.initial_size {
            if let Err(err) = process.set_initial_size(size) {
                warn!(pid = pid.as_raw(), %err, "could not apply initial window size");
            }
        }
        if options.console {
            let echo = process.master.with_fd(|fd| {
                // SAFETY: the channel keeps `fd` open for the closure's duration
                set_noecho(unsafe { BorrowedFd::borrow_raw(fd) })
            });
            if let Some(Err(err)) = echo {
                debug!(%err, "could not turn off echo on master");
            }
        }

        debug!(pid = pid.as_raw(), command = ?options.command, "spawned on pty");
        Ok(process)
    }

    fn set_initial_size(&self, size: WindowSize) -> Result<()> {
        for _ in 0..INITIAL_SIZE_ATTEMPTS {
            match self.master.with_fd(|fd| set_window_size(fd, size)) {
                Some(Err(PtyError::SetWindowSize(e)))
                    if e.raw_os_error() == Some(Errno::ENOTTY as i32) =>
                {
                    std::thread::yield_now();
                },
                Some(result) => return result,
                None => return Err(PtyError::Closed),
            }
        }
        Err(PtyError::SetWindowSize(errno_to_io(Errno::ENOTTY)))
    }
}

fn lock_slave(slave: &Mutex<Option<OwnedFd>>) -> std::sync::MutexGuard<'_, Option<OwnedFd>> {
    slave.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackendOps for UnixPty {
    fn kind(&self) -> BackendKind {
        BackendKind::PosixPty
    }

    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn output(&self) -> (Arc<dyn ChannelRead>, Arc<ReadActivity>) {
        (self.master.clone(), Arc::clone(&self.output_activity))
    }

    fn input(&self) -> Arc<dyn ChannelWrite> {
        self.master.clone()
    }

    fn error(&self) -> Option<(Arc<dyn ChannelRead>, Arc<ReadActivity>)> {
        self.stderr.as_ref().map(|stderr| {
            (
                Arc::clone(stderr) as Arc<dyn ChannelRead>,
                Arc::clone(&self.error_activity),
            )
        })
    }

    fn resize(&self, size: WindowSize) -> Result<()> {
        self.master
            .with_fd(|fd| set_window_size(fd, size))
            .unwrap_or(Err(PtyError::Closed))?;
        // Some programs only re-query the size on SIGWINCH.
        let _ = self.latch.while_running(|| kill(self.pid, NixSignal::SIGWINCH));
        Ok(())
    }

    fn window_size(&self) -> Result<WindowSize> {
        self.master
            .with_fd(get_window_size)
            .unwrap_or(Err(PtyError::Closed))
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        reaper::raise(self.pid, &self.latch, signal)
    }

    #[cfg(target_os = "linux")]
    fn working_directory(&self) -> Result<std::path::PathBuf> {
        let link = format!("/proc/{}/cwd", self.pid);
        // Under the latch, so the link never belongs to a recycled pid.
        self.latch
            .while_running(|| std::fs::read_link(&link))
            .ok_or(PtyError::AlreadyExited)?
            .map_err(PtyError::Io)
    }

    fn close_unused(&self, reader: bool, writer: bool, error_reader: bool) {
        if !error_reader {
            if let Some(stderr) = &self.stderr {
                stderr.shutdown();
            }
        }
        if !reader && !writer {
            self.master.shutdown();
        }
    }

    fn close(&self) {
        self.master.shutdown();
        if let Some(stderr) = &self.stderr {
            stderr.shutdown();
        }
        drop(lock_slave(&self.slave).take());
    }

    fn enter_key_code(&self) -> u8 {
        b'\r'
    }

    fn is_console(&self) -> bool {
        self.console
    }
}
