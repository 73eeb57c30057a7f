//! Cancellable blocking I/O on a descriptor.
//!
//! Every [`FdChannel`] carries a private wake pipe. A blocked reader polls
//! the descriptor and the wake pipe together; writing one byte to the wake
//! pipe makes the poll return so the reader can notice that the channel was
//! closed (or that the child is gone) instead of blocking forever. The wake
//! byte is never consumed, so once woken every later poll returns at once.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read, write};

use crate::error::{errno_to_io, PtyError, Result};
use crate::stream::{ChannelRead, ChannelWrite};

struct Endpoint {
    fd: OwnedFd,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl Endpoint {
    fn wake(&self) {
        // A full pipe already holds a wake byte.
        let _ = write(&self.wake_tx, &[0u8]);
    }
}

/// Descriptor shared between the process handle and its stream adapters.
///
/// The descriptor is released when the channel is closed and the last
/// in-flight read or write has returned.
pub(crate) struct FdChannel {
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    write_lock: Mutex<()>,
    label: &'static str,
}

impl FdChannel {
    pub(crate) fn new(fd: OwnedFd, label: &'static str) -> Result<Self> {
        let (wake_rx, wake_tx) = pipe().map_err(|e| PtyError::Pipe(errno_to_io(e)))?;
        for end in [&wake_rx, &wake_tx] {
            fcntl(end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|e| PtyError::Pipe(errno_to_io(e)))?;
        }
        fcntl(wake_tx.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| PtyError::Pipe(errno_to_io(e)))?;

        Ok(FdChannel {
            endpoint: Mutex::new(Some(Arc::new(Endpoint {
                fd,
                wake_rx,
                wake_tx,
            }))),
            write_lock: Mutex::new(()),
            label,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Endpoint>>> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.slot().clone()
    }

    /// Runs `f` with the raw descriptor if the channel is still open.
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(RawFd) -> R) -> Option<R> {
        self.endpoint().map(|ep| f(ep.fd.as_raw_fd()))
    }

    /// Wakes blocked readers without closing. Readers drain what is left
    /// and then see end of stream.
    pub(crate) fn break_read(&self) {
        if let Some(ep) = self.endpoint() {
            ep.wake();
        }
    }

    /// Closes the channel; a second call is a no-op.
    pub(crate) fn shutdown(&self) {
        let taken = self.slot().take();
        if let Some(ep) = taken {
            ep.wake();
            tracing::trace!(channel = self.label, "channel closed");
        }
    }

    fn read_endpoint(ep: &Endpoint, buf: &mut [u8]) -> Result<usize> {
        loop {
            let (woken, readable) = {
                let mut fds = [
                    PollFd::new(ep.wake_rx.as_fd(), PollFlags::POLLIN),
                    PollFd::new(ep.fd.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {},
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                    Err(e) => return Err(errno_to_io(e).into()),
                }
                let woken = fds[0].revents().is_some_and(|r| !r.is_empty());
                let revents = fds[1].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLNVAL) {
                    return Ok(0);
                }
                let readable = revents.contains(PollFlags::POLLIN);
                let hung_up = revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);
                (woken || hung_up, readable)
            };

            if !readable {
                if woken {
                    return Ok(0);
                }
                continue;
            }

            match read(ep.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                // Slave side closed: end of stream on Linux.
                Err(Errno::EIO) => return Ok(0),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(errno_to_io(e).into()),
            }
        }
    }
}

impl ChannelRead for FdChannel {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.endpoint() {
            Some(ep) => Self::read_endpoint(&ep, buf),
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

impl ChannelWrite for FdChannel {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let ep = self.endpoint().ok_or(PtyError::Closed)?;
        let _serialized = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match write(&ep.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EIO) | Err(Errno::EPIPE) => return Err(PtyError::Closed),
                Err(e) => return Err(errno_to_io(e).into()),
            }
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.slot().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pipe_channel() -> (FdChannel, OwnedFd) {
        let (rx, tx) = pipe().unwrap();
        (FdChannel::new(rx, "test").unwrap(), tx)
    }

    #[test]
    fn test_read_returns_data() {
        let (channel, tx) = pipe_channel();
        write(&tx, b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(channel.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (channel, _tx) = pipe_channel();
        let channel = Arc::new(channel);
        let reader = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                channel.read(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        ChannelRead::close(&*channel);
        let n = reader.join().unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_break_read_drains_then_eof() {
        let (channel, tx) = pipe_channel();
        write(&tx, b"tail").unwrap();
        channel.break_read();

        let mut buf = [0u8; 16];
        assert_eq!(channel.read(&mut buf).unwrap(), 4);
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
        assert!(!ChannelRead::is_closed(&channel));
    }

    #[test]
    fn test_double_close_is_noop() {
        let (channel, _tx) = pipe_channel();
        ChannelRead::close(&channel);
        ChannelWrite::close(&channel);
        assert!(ChannelRead::is_closed(&channel));
        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
        assert!(channel.with_fd(|fd| fd).is_none());
    }

    #[test]
    fn test_write_after_close_fails() {
        let (rx, tx) = pipe().unwrap();
        let channel = FdChannel::new(tx, "test").unwrap();
        assert_eq!(channel.write(b"ab").unwrap(), 2);
        channel.shutdown();
        assert!(matches!(channel.write(b"c"), Err(PtyError::Closed)));
        drop(rx);
    }

    #[test]
    fn test_writer_hangup_is_eof() {
        let (channel, tx) = pipe_channel();
        drop(tx);
        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
    }
}
