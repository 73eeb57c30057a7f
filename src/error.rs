//! Error types for PTY process operations.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::platform::BackendKind;

/// Coarse classification of a [`PtyError`].
///
/// Callers usually only care which phase failed: creating the terminal
/// channel, launching the child, a rendezvous timeout, runtime I/O, a
/// resize, or calling an operation in the wrong lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ChannelCreation,
    Launch,
    ConnectTimeout,
    Io,
    Resize,
    IllegalState,
}

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] io::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] io::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] io::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] io::Error),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Failed to create pseudo console: {0}")]
    PseudoConsole(String),

    #[error("Failed to start PTY agent: {0}")]
    Agent(String),

    #[error("{0} backend is not available on this host")]
    BackendUnavailable(BackendKind),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unable to find executable {0:?}")]
    ExecutableNotFound(String),

    #[error("Failed to fork: {0}")]
    Fork(#[source] io::Error),

    #[error("Failed to launch {program:?}: {reason}")]
    Launch { program: String, reason: String },

    #[error("Timed out after {timeout:?} connecting to {name}")]
    ConnectTimeout { name: String, timeout: Duration },

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] io::Error),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] io::Error),

    #[error("{0} backend does not support window size queries")]
    WindowSizeUnsupported(BackendKind),

    #[error("Channel is closed")]
    Closed,

    #[error("Process has not exited")]
    NotExited,

    #[error("Process has already exited")]
    AlreadyExited,

    #[error("{backend} backend does not support {query}")]
    QueryUnsupported {
        backend: BackendKind,
        query: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PtyError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PtyError::OpenMaster(_)
            | PtyError::GrantPty(_)
            | PtyError::UnlockPty(_)
            | PtyError::PtsName(_)
            | PtyError::Pipe(_)
            | PtyError::PseudoConsole(_)
            | PtyError::Agent(_)
            | PtyError::BackendUnavailable(_) => ErrorCategory::ChannelCreation,
            PtyError::InvalidCommand(_)
            | PtyError::ExecutableNotFound(_)
            | PtyError::Fork(_)
            | PtyError::Launch { .. } => ErrorCategory::Launch,
            PtyError::ConnectTimeout { .. } => ErrorCategory::ConnectTimeout,
            PtyError::SetWindowSize(_)
            | PtyError::GetWindowSize(_)
            | PtyError::WindowSizeUnsupported(_) => ErrorCategory::Resize,
            PtyError::Closed | PtyError::Io(_) => ErrorCategory::Io,
            PtyError::NotExited
            | PtyError::AlreadyExited
            | PtyError::QueryUnsupported { .. } => ErrorCategory::IllegalState,
        }
    }

    pub(crate) fn launch(program: &str, reason: impl ToString) -> Self {
        PtyError::Launch {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<PtyError> for io::Error {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Io(e) => e,
            PtyError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, PtyError::Closed),
            PtyError::ConnectTimeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::other(other),
        }
    }
}

/// Converts a nix errno into the std error it wraps.
#[cfg(unix)]
pub(crate) fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, PtyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = PtyError::OpenMaster(io::Error::from_raw_os_error(24));
        assert_eq!(err.category(), ErrorCategory::ChannelCreation);

        let err = PtyError::ExecutableNotFound("nope".into());
        assert_eq!(err.category(), ErrorCategory::Launch);

        let err = PtyError::ConnectTimeout {
            name: "in".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.category(), ErrorCategory::ConnectTimeout);
        assert_eq!(PtyError::NotExited.category(), ErrorCategory::IllegalState);
        assert_eq!(PtyError::Closed.category(), ErrorCategory::Io);
        assert_eq!(PtyError::AlreadyExited.category(), ErrorCategory::IllegalState);

        let err = PtyError::QueryUnsupported {
            backend: BackendKind::Emulated,
            query: "working directory queries",
        };
        assert_eq!(err.category(), ErrorCategory::IllegalState);
        assert_eq!(
            err.to_string(),
            format!("{} backend does not support working directory queries", BackendKind::Emulated)
        );
    }

    #[test]
    fn test_closed_maps_to_broken_pipe() {
        let err: io::Error = PtyError::Closed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<PtyError>());
        assert!(matches!(inner, Some(PtyError::Closed)));
    }

    #[test]
    fn test_io_passthrough() {
        let err: io::Error = PtyError::Io(io::Error::from(io::ErrorKind::NotFound)).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
