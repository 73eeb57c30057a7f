//! The closed set of channel backends.

use std::path::PathBuf;
use std::sync::Arc;

use crate::drain::ReadActivity;
use crate::emulated::EmulatedPty;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::SpawnOptions;
use crate::platform::BackendKind;
use crate::size::WindowSize;
use crate::status::Signal;
use crate::stream::{ChannelRead, ChannelWrite};

#[cfg(unix)]
use crate::unix::UnixPty;
#[cfg(windows)]
use crate::windows::{conpty::ConPtyProcess, winpty::WinPtyProcess};

/// What every backend provides to [`PtyProcess`](crate::PtyProcess).
///
/// Backends publish the exit status on the latch they were started with;
/// `signal` must be a no-op once that happened.
pub(crate) trait BackendOps: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn pid(&self) -> u32;

    fn output(&self) -> (Arc<dyn ChannelRead>, Arc<ReadActivity>);

    fn input(&self) -> Arc<dyn ChannelWrite>;

    /// Separate error stream, if stderr is not merged into the output.
    fn error(&self) -> Option<(Arc<dyn ChannelRead>, Arc<ReadActivity>)>;

    fn resize(&self, size: WindowSize) -> Result<()>;

    fn window_size(&self) -> Result<WindowSize>;

    fn signal(&self, signal: Signal) -> Result<()>;

    /// The child's current working directory, where the host can tell.
    fn working_directory(&self) -> Result<PathBuf> {
        Err(PtyError::QueryUnsupported {
            backend: self.kind(),
            query: "working directory queries",
        })
    }

    /// Processes attached to the child's console, the child included.
    fn console_process_count(&self) -> Result<usize> {
        Err(PtyError::QueryUnsupported {
            backend: self.kind(),
            query: "console process counts",
        })
    }

    /// Called by `destroy` with the streams the caller asked for.
    fn close_unused(&self, _reader: bool, _writer: bool, _error_reader: bool) {}

    /// Closes every channel; idempotent.
    fn close(&self);

    fn enter_key_code(&self) -> u8 {
        b'\r'
    }

    fn is_console(&self) -> bool;
}

pub(crate) enum Backend {
    #[cfg(unix)]
    Posix(UnixPty),
    #[cfg(windows)]
    ConsoleHost(ConPtyProcess),
    #[cfg(windows)]
    Agent(WinPtyProcess),
    Emulated(EmulatedPty),
}

impl Backend {
    pub(crate) fn start(
        kind: BackendKind,
        options: &SpawnOptions,
        latch: Arc<ExitLatch>,
    ) -> Result<Self> {
        match kind {
            #[cfg(unix)]
            BackendKind::PosixPty => Ok(Backend::Posix(UnixPty::spawn(options, latch)?)),
            #[cfg(windows)]
            BackendKind::ConsoleHost => {
                Ok(Backend::ConsoleHost(ConPtyProcess::spawn(options, latch)?))
            },
            #[cfg(windows)]
            BackendKind::Agent => Ok(Backend::Agent(WinPtyProcess::spawn(options, latch)?)),
            BackendKind::Emulated => Ok(Backend::Emulated(EmulatedPty::spawn(options, latch)?)),
            #[allow(unreachable_patterns)]
            other => Err(PtyError::BackendUnavailable(other)),
        }
    }

    pub(crate) fn ops(&self) -> &dyn BackendOps {
        match self {
            #[cfg(unix)]
            Backend::Posix(backend) => backend,
            #[cfg(windows)]
            Backend::ConsoleHost(backend) => backend,
            #[cfg(windows)]
            Backend::Agent(backend) => backend,
            Backend::Emulated(backend) => backend,
        }
    }
}
