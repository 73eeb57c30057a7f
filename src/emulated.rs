//! Pipe-emulated PTY backend.
//!
//! Three named pipes (Unix: FIFOs, Windows: named pipe server ends) and an
//! external launcher that attaches the real program to them, see
//! [`EmulatedLauncher`](crate::EmulatedLauncher). This is the fallback when
//! neither a PTY device nor a pseudo console is available.
//!
//! I/O is polled: a read checks how many bytes the pipe holds, and if none
//! sleeps [`POLL_INTERVAL`] before checking again. Output therefore arrives
//! with up to one interval of extra latency. Reads and writes share one
//! mutex that is held around a single peek-and-read or a single write,
//! never across the sleep.

use std::io;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::backend::BackendOps;
use crate::drain::ReadActivity;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::SpawnOptions;
use crate::platform::BackendKind;
use crate::size::WindowSize;
use crate::status::Signal;
use crate::stream::{ChannelRead, ChannelWrite};

#[cfg(unix)]
use crate::unix::fifo::{Fifo as PipeEnd, FifoSet as PipeSet};
#[cfg(windows)]
use crate::windows::named_pipe::{ServerPipe as PipeEnd, ServerPipeSet as PipeSet};

/// Delay between two "bytes available" checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a non-blocking look at a pipe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Available {
    Bytes(usize),
    Empty,
    /// The other side closed its end
    Hangup,
}

/// A pipe end that can be polled without blocking.
pub(crate) trait PolledPipe: Send + Sync {
    fn available(&self) -> io::Result<Available>;

    /// Reads at most what `available` reported.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// May fail with `WouldBlock` when the pipe is full.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One direction of the emulated channel.
pub(crate) struct PollingPipe<P> {
    pipe: Mutex<Option<Arc<P>>>,
    io_lock: Arc<Mutex<()>>,
    latch: Arc<ExitLatch>,
    label: &'static str,
}

impl<P: PolledPipe> PollingPipe<P> {
    pub(crate) fn new(
        pipe: P,
        io_lock: Arc<Mutex<()>>,
        latch: Arc<ExitLatch>,
        label: &'static str,
    ) -> Self {
        PollingPipe {
            pipe: Mutex::new(Some(Arc::new(pipe))),
            io_lock,
            latch,
            label,
        }
    }

    fn pipe(&self) -> Option<Arc<P>> {
        lock(&self.pipe).clone()
    }

    fn shutdown(&self) {
        if lock(&self.pipe).take().is_some() {
            trace!(pipe = self.label, "pipe closed");
        }
    }

    fn is_shut(&self) -> bool {
        lock(&self.pipe).is_none()
    }
}

impl<P: PolledPipe> ChannelRead for PollingPipe<P> {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let Some(pipe) = self.pipe() else {
                return Ok(0);
            };
            // Sampled before the peek: output written before exit is
            // already in the pipe when the peek runs.
            let exited = self.latch.is_exited();
            {
                let _io = lock(&self.io_lock);
                match pipe.available() {
                    Ok(Available::Bytes(n)) => {
                        let len = n.min(buf.len());
                        match pipe.read(&mut buf[..len]) {
                            Ok(n) => return Ok(n),
                            Err(e)
                                if matches!(
                                    e.kind(),
                                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                                ) => {},
                            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(0),
                            Err(e) => return Err(e.into()),
                        }
                    },
                    Ok(Available::Hangup) => return Ok(0),
                    Ok(Available::Empty) if exited => return Ok(0),
                    Ok(Available::Empty) => {},
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(0),
                    Err(e) => return Err(e.into()),
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.is_shut()
    }
}

impl<P: PolledPipe> ChannelWrite for PollingPipe<P> {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let pipe = self.pipe().ok_or(PtyError::Closed)?;
            {
                let _io = lock(&self.io_lock);
                match pipe.write(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        return Err(PtyError::Closed)
                    },
                    Err(e) => return Err(e.into()),
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.is_shut()
    }
}

/// A child started through an emulation launcher.
pub(crate) struct EmulatedPty {
    launcher: sys::Launcher,
    latch: Arc<ExitLatch>,
    input: Arc<PollingPipe<PipeEnd>>,
    output: Arc<PollingPipe<PipeEnd>>,
    error: Arc<PollingPipe<PipeEnd>>,
    output_activity: Arc<ReadActivity>,
    error_activity: Arc<ReadActivity>,
    console: bool,
    _pipes: PipeSet,
}

impl EmulatedPty {
    pub(crate) fn spawn(options: &SpawnOptions, latch: Arc<ExitLatch>) -> Result<Self> {
        let config = options
            .emulated
            .as_ref()
            .ok_or(PtyError::BackendUnavailable(BackendKind::Emulated))?;
        let (launcher, launcher_args) = config
            .launcher
            .split_first()
            .ok_or_else(|| PtyError::InvalidCommand("empty emulation launcher".into()))?;

        let mut pipes = PipeSet::create()?;
        let [in_name, out_name, err_name] = pipes.names();

        let mut command = Command::new(launcher);
        command
            .args(launcher_args)
            .arg(in_name)
            .arg(out_name)
            .arg(err_name)
            .args(&options.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !options.inherit_environment {
            command.env_clear();
        }
        command.envs(&options.environment);
        if let Some(dir) = &options.directory {
            command.current_dir(dir);
        }
        sys::prepare(&mut command);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PtyError::ExecutableNotFound(launcher.clone()),
            _ => PtyError::launch(launcher, e),
        })?;

        let [input, output, error] = match pipes.connect(&mut child, config.connect_timeout) {
            Ok(ends) => ends,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            },
        };

        let launcher = sys::Launcher::watch(child, Arc::clone(&latch))?;
        let io_lock = Arc::new(Mutex::new(()));
        let pipe = |end, label| {
            Arc::new(PollingPipe::new(
                end,
                Arc::clone(&io_lock),
                Arc::clone(&latch),
                label,
            ))
        };

        debug!(pid = launcher.pid(), command = ?options.command, "spawned through emulation launcher");
        Ok(EmulatedPty {
            input: pipe(input, "in"),
            output: pipe(output, "out"),
            error: pipe(error, "err"),
            launcher,
            latch,
            output_activity: Arc::new(ReadActivity::new()),
            error_activity: Arc::new(ReadActivity::new()),
            console: options.console,
            _pipes: pipes,
        })
    }
}

impl BackendOps for EmulatedPty {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulated
    }

    fn pid(&self) -> u32 {
        self.launcher.pid()
    }

    fn output(&self) -> (Arc<dyn ChannelRead>, Arc<ReadActivity>) {
        (self.output.clone(), Arc::clone(&self.output_activity))
    }

    fn input(&self) -> Arc<dyn ChannelWrite> {
        self.input.clone()
    }

    fn error(&self) -> Option<(Arc<dyn ChannelRead>, Arc<ReadActivity>)> {
        Some((self.error.clone(), Arc::clone(&self.error_activity)))
    }

    fn resize(&self, _size: WindowSize) -> Result<()> {
        Err(PtyError::WindowSizeUnsupported(BackendKind::Emulated))
    }

    fn window_size(&self) -> Result<WindowSize> {
        Err(PtyError::WindowSizeUnsupported(BackendKind::Emulated))
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.launcher.signal(&self.latch, signal)
    }

    fn close(&self) {
        self.input.shutdown();
        self.output.shutdown();
        self.error.shutdown();
    }

    /// The launcher sets the terminal up with `igncr`.
    fn enter_key_code(&self) -> u8 {
        b'\n'
    }

    fn is_console(&self) -> bool {
        self.console
    }
}

#[cfg(unix)]
mod sys {
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};
    use std::sync::Arc;
    use std::thread;

    use nix::unistd::Pid;

    use crate::error::{PtyError, Result};
    use crate::exit::ExitLatch;
    use crate::status::Signal;
    use crate::unix::reaper;

    pub(super) fn prepare(command: &mut Command) {
        // Own process group, so signals reach whatever the launcher starts.
        command.process_group(0);
    }

    pub(super) struct Launcher {
        pid: Pid,
    }

    impl Launcher {
        pub(super) fn watch(child: Child, latch: Arc<ExitLatch>) -> Result<Self> {
            let pid = Pid::from_raw(child.id() as i32);
            // Reaped by the watcher; the std handle must not wait on it.
            drop(child);
            thread::Builder::new()
                .name(format!("ptyspawn-watcher:{pid}"))
                .spawn(move || {
                    let status = reaper::wait_for_exit(pid, &latch);
                    tracing::debug!(pid = pid.as_raw(), %status, "launcher exited");
                })
                .map_err(PtyError::Io)?;
            Ok(Launcher { pid })
        }

        pub(super) fn pid(&self) -> u32 {
            self.pid.as_raw() as u32
        }

        pub(super) fn signal(&self, latch: &ExitLatch, signal: Signal) -> Result<()> {
            reaper::raise(self.pid, latch, signal)
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::os::windows::io::AsRawHandle;
    use std::process::{Child, Command};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::INFINITE;

    use super::lock;
    use crate::error::{PtyError, Result};
    use crate::exit::ExitLatch;
    use crate::status::{ExitStatus, Signal, UNKNOWN_EXIT_CODE};

    pub(super) fn prepare(_command: &mut Command) {}

    pub(super) struct Launcher {
        pid: u32,
        child: Arc<Mutex<Child>>,
    }

    struct SendHandle(usize);

    impl Launcher {
        pub(super) fn watch(child: Child, latch: Arc<ExitLatch>) -> Result<Self> {
            let pid = child.id();
            let handle = SendHandle(child.as_raw_handle() as usize);
            let child = Arc::new(Mutex::new(child));
            let watched = Arc::clone(&child);
            thread::Builder::new()
                .name(format!("ptyspawn-watcher:{pid}"))
                .spawn(move || {
                    let handle = handle;
                    // SAFETY: `watched` keeps the process handle open
                    unsafe { WaitForSingleObject(handle.0 as _, INFINITE) };
                    latch.complete_with(|| match lock(&watched).wait() {
                        Ok(status) => status.into(),
                        Err(_) => ExitStatus::Exited(UNKNOWN_EXIT_CODE),
                    });
                    tracing::debug!(pid, status = %latch.status(), "launcher exited");
                })
                .map_err(PtyError::Io)?;
            Ok(Launcher { pid, child })
        }

        pub(super) fn pid(&self) -> u32 {
            self.pid
        }

        /// Without signals every kind terminates the launcher.
        pub(super) fn signal(&self, latch: &ExitLatch, _signal: Signal) -> Result<()> {
            match latch.while_running(|| lock(&self.child).kill()) {
                None | Some(Ok(())) => Ok(()),
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Some(Err(e)) => Err(PtyError::Io(e)),
            }
        }
    }
}
