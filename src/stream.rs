//! Stream adapters handed out by [`PtyProcess`](crate::PtyProcess).
//!
//! The adapters do not own the channel. Closing one goes through the
//! channel's single-close protocol, so closing twice, or closing while the
//! process closes the channel too, is a no-op.

use std::io;
use std::sync::Arc;

use crate::drain::ReadActivity;
use crate::error::Result;

/// Readable side of a backend channel.
///
/// `read` blocks until data arrives and returns `Ok(0)` at end of stream,
/// including after `close`.
pub(crate) trait ChannelRead: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Writable side of a backend channel.
///
/// `write` after `close` fails with [`PtyError::Closed`](crate::PtyError::Closed).
pub(crate) trait ChannelWrite: Send + Sync {
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Reader of a stream that was never split out (stderr merged into stdout).
#[derive(Debug, Default)]
pub(crate) struct NullChannel;

impl ChannelRead for NullChannel {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        true
    }
}

/// Output (or error) stream of a child process.
pub struct PtyReader {
    channel: Arc<dyn ChannelRead>,
    activity: Arc<ReadActivity>,
}

impl PtyReader {
    pub(crate) fn new(channel: Arc<dyn ChannelRead>, activity: Arc<ReadActivity>) -> Self {
        activity.track();
        PtyReader { channel, activity }
    }

    pub(crate) fn null() -> Self {
        PtyReader::new(Arc::new(NullChannel), Arc::new(ReadActivity::new()))
    }

    /// Close the stream; idempotent.
    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    fn read_channel(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.channel.read(buf);
        self.activity.record_read();
        Ok(result?)
    }
}

impl io::Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_channel(buf)
    }
}

impl io::Read for &PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_channel(buf)
    }
}

impl std::fmt::Debug for PtyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyReader")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Input stream of a child process.
pub struct PtyWriter {
    channel: Arc<dyn ChannelWrite>,
}

impl PtyWriter {
    pub(crate) fn new(channel: Arc<dyn ChannelWrite>) -> Self {
        PtyWriter { channel }
    }

    /// Close the stream; idempotent.
    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl io::Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.channel.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.channel.flush()?)
    }
}

impl io::Write for &PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.channel.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.channel.flush()?)
    }
}

impl std::fmt::Debug for PtyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
