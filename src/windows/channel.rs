//! Stream channels over [`NamedPipe`]s.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::named_pipe::NamedPipe;
use crate::error::{PtyError, Result};
use crate::stream::{ChannelRead, ChannelWrite};

/// A pipe shared between the process handle and its stream adapters.
///
/// Closing takes the pipe out and shuts it down; the handle is released
/// once the last in-flight read or write has returned.
pub(crate) struct PipeChannel {
    pipe: Mutex<Option<Arc<NamedPipe>>>,
}

impl PipeChannel {
    pub(crate) fn new(pipe: NamedPipe) -> Self {
        PipeChannel {
            pipe: Mutex::new(Some(Arc::new(pipe))),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<NamedPipe>>> {
        self.pipe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipe(&self) -> Option<Arc<NamedPipe>> {
        self.slot().clone()
    }

    pub(crate) fn shutdown(&self) {
        let taken = self.slot().take();
        if let Some(pipe) = taken {
            pipe.shutdown();
            tracing::trace!(pipe = pipe.name(), "channel closed");
        }
    }
}

impl ChannelRead for PipeChannel {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.pipe() {
            Some(pipe) => pipe.read(buf).map_err(PtyError::Io),
            None => Ok(0),
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.slot().is_none()
    }
}

impl ChannelWrite for PipeChannel {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let pipe = self.pipe().ok_or(PtyError::Closed)?;
        match pipe.write(buf) {
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Err(PtyError::Closed),
            other => other.map_err(PtyError::Io),
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.slot().is_none()
    }
}
