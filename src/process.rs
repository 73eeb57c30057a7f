//! The backend-agnostic process handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::{PtyProcessBuilder, SpawnOptions};
use crate::platform::{BackendKind, PlatformAdapter};
use crate::size::WindowSize;
use crate::status::{ExitStatus, LifecycleState, Signal};
use crate::stream::{PtyReader, PtyWriter};

/// A child process attached to a terminal channel.
///
/// Created by [`PtyProcess::start`] (or [`PtyProcessBuilder::start`]) in the
/// `Running` state; moves to `Exited` when the backend's watcher publishes
/// the exit status. Dropping the handle closes every stream without sending
/// a signal itself; call [`destroy`](Self::destroy) to end the child. On the
/// POSIX backend closing the master hangs up the terminal, so a child that
/// does not ignore `SIGHUP` still dies from the hangup.
pub struct PtyProcess {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    latch: Arc<ExitLatch>,
    destroy_grace: Duration,
    reader: OnceLock<Arc<PtyReader>>,
    writer: OnceLock<Arc<PtyWriter>>,
    error_reader: OnceLock<Arc<PtyReader>>,
    resize_warned: AtomicBool,
    escalating: AtomicBool,
}

impl PtyProcess {
    /// Launches `options.command` on the backend `adapter` selects.
    ///
    /// On error nothing stays allocated.
    pub fn start(adapter: &PlatformAdapter, options: SpawnOptions) -> Result<Self> {
        options.validate()?;
        let kind = adapter.select(&options)?;
        let latch = Arc::new(ExitLatch::new());
        let backend = Backend::start(kind, &options, Arc::clone(&latch))?;

        info!(
            pid = backend.ops().pid(),
            backend = %kind,
            command = ?options.command,
            "process started"
        );

        Ok(PtyProcess {
            inner: Arc::new(Inner {
                backend,
                latch,
                destroy_grace: options.destroy_grace,
                reader: OnceLock::new(),
                writer: OnceLock::new(),
                error_reader: OnceLock::new(),
                resize_warned: AtomicBool::new(false),
                escalating: AtomicBool::new(false),
            }),
        })
    }

    /// Shorthand for [`PtyProcessBuilder::new`].
    pub fn builder<I, S>(command: I) -> PtyProcessBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PtyProcessBuilder::new(command)
    }

    /// The child's output. Every call returns the same reader.
    pub fn reader(&self) -> Arc<PtyReader> {
        let inner = &self.inner;
        Arc::clone(inner.reader.get_or_init(|| {
            let (channel, activity) = inner.backend.ops().output();
            Arc::new(PtyReader::new(channel, activity))
        }))
    }

    /// The child's input. Every call returns the same writer.
    pub fn writer(&self) -> Arc<PtyWriter> {
        let inner = &self.inner;
        Arc::clone(
            inner
                .writer
                .get_or_init(|| Arc::new(PtyWriter::new(inner.backend.ops().input()))),
        )
    }

    /// The child's separate error stream, or an empty stream when stderr is
    /// merged into the output. Every call returns the same reader.
    pub fn error_reader(&self) -> Arc<PtyReader> {
        let inner = &self.inner;
        Arc::clone(inner.error_reader.get_or_init(|| {
            match inner.backend.ops().error() {
                Some((channel, activity)) => Arc::new(PtyReader::new(channel, activity)),
                None => Arc::new(PtyReader::null()),
            }
        }))
    }

    /// Changes the terminal size.
    ///
    /// Best effort: returns whether the size was applied. The first failure
    /// of a process is logged as a warning, later ones at debug level.
    pub fn resize(&self, size: WindowSize) -> bool {
        if self.inner.latch.is_exited() {
            debug!(pid = self.pid(), %size, "resize after exit ignored");
            return false;
        }
        match self.inner.backend.ops().resize(size) {
            Ok(()) => true,
            Err(err) => {
                if !self.inner.resize_warned.swap(true, Ordering::SeqCst) {
                    warn!(pid = self.pid(), %size, %err, "resize failed");
                } else {
                    debug!(pid = self.pid(), %size, %err, "resize failed");
                }
                false
            },
        }
    }

    /// Current terminal size, or the last size set where the OS cannot
    /// be asked.
    pub fn window_size(&self) -> Result<WindowSize> {
        self.inner.backend.ops().window_size()
    }

    /// The child's current working directory.
    ///
    /// Answered on Linux through `/proc` and by the agent backend; other
    /// backends fail with [`PtyError::QueryUnsupported`]. Fails with
    /// [`PtyError::AlreadyExited`] once the child is gone.
    pub fn working_directory(&self) -> Result<PathBuf> {
        self.inner.backend.ops().working_directory()
    }

    /// Number of processes attached to the child's console. Agent backend
    /// only.
    pub fn console_process_count(&self) -> Result<usize> {
        self.inner.backend.ops().console_process_count()
    }

    /// Sends `signal`. A no-op once the process has exited.
    ///
    /// Backends without POSIX signals terminate the process for every kind.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.inner.backend.ops().signal(signal)
    }

    /// Asks the process to terminate and makes sure it does.
    ///
    /// Sends [`Signal::Terminate`] and returns. If the process is still
    /// running after the destroy grace period it is killed. Streams the
    /// caller never asked for are closed. Safe to call repeatedly and after
    /// exit.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.latch.is_exited() {
            return;
        }

        inner.backend.ops().close_unused(
            inner.reader.get().is_some(),
            inner.writer.get().is_some(),
            inner.error_reader.get().is_some(),
        );

        if let Err(err) = self.signal(Signal::Terminate) {
            debug!(pid = self.pid(), %err, "terminate failed");
        }

        if inner.escalating.swap(true, Ordering::SeqCst) {
            return;
        }
        let escalation = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name(format!("ptyspawn-destroy:{}", self.pid()))
            .spawn(move || escalation.kill_after_grace());
        if let Err(err) = spawned {
            debug!(%err, "could not start destroy escalation, killing now");
            inner.kill();
        }
    }

    /// Blocks until the process has exited.
    pub fn wait_for(&self) -> ExitStatus {
        self.inner.latch.wait()
    }

    /// Blocks until the process has exited or `timeout` elapsed.
    pub fn wait_for_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        self.inner.latch.wait_timeout(timeout)
    }

    /// Exit status; fails with [`PtyError::NotExited`] while running.
    pub fn exit_value(&self) -> Result<ExitStatus> {
        match self.inner.latch.status() {
            ExitStatus::NotExited => Err(PtyError::NotExited),
            status => Ok(status),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.backend.ops().pid()
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.latch.is_exited()
    }

    pub fn state(&self) -> LifecycleState {
        if self.inner.latch.is_exited() {
            LifecycleState::Exited
        } else {
            LifecycleState::Running
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.backend.ops().kind()
    }

    /// Byte the terminal expects for Enter.
    pub fn enter_key_code(&self) -> u8 {
        self.inner.backend.ops().enter_key_code()
    }

    pub fn is_console_mode(&self) -> bool {
        self.inner.backend.ops().is_console()
    }

    /// Shared exit latch, for callers that want to wait without the handle.
    pub fn exit_latch(&self) -> Arc<ExitLatch> {
        Arc::clone(&self.inner.latch)
    }

    /// Closes every stream. Idempotent; does not signal the child.
    pub fn close(&self) {
        self.inner.backend.ops().close();
    }
}

impl Inner {
    fn kill(&self) {
        if let Err(err) = self.backend.ops().signal(Signal::Kill) {
            debug!(pid = self.backend.ops().pid(), %err, "kill failed");
        }
    }

    fn kill_after_grace(&self) {
        if self.latch.wait_timeout(self.destroy_grace).is_none() {
            debug!(
                pid = self.backend.ops().pid(),
                grace = ?self.destroy_grace,
                "still running after terminate, killing"
            );
            self.kill();
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid())
            .field("backend", &self.backend())
            .field("status", &self.inner.latch.status())
            .finish()
    }
}
