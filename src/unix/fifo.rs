//! FIFOs for the pipe-emulated backend.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, read, write};
use tempfile::TempDir;

use crate::emulated::{Available, PolledPipe, POLL_INTERVAL};
use crate::error::{errno_to_io, PtyError, Result};

const NAMES: [&str; 3] = ["in", "out", "err"];

/// The three FIFOs of one emulated process, in a private directory that
/// is removed on drop.
pub(crate) struct FifoSet {
    dir: TempDir,
    /// Read ends of `out` and `err`, opened before the launcher starts
    readers: Option<[OwnedFd; 2]>,
}

impl FifoSet {
    pub(crate) fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ptyspawn-")
            .tempdir()
            .map_err(PtyError::Pipe)?;
        for name in NAMES {
            mkfifo(&dir.path().join(name), Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| PtyError::Pipe(errno_to_io(e)))?;
        }

        // Opening the read ends first lets the launcher's blocking
        // write-opens succeed right away.
        let out = open_fifo(&dir.path().join("out"), OFlag::O_RDONLY)?;
        let err = open_fifo(&dir.path().join("err"), OFlag::O_RDONLY)?;

        Ok(FifoSet {
            dir,
            readers: Some([out, err]),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Paths passed to the launcher: in, out, err.
    pub(crate) fn names(&self) -> [OsString; 3] {
        NAMES.map(|name| self.path(name).into_os_string())
    }

    /// Waits until the launcher opened the input FIFO.
    ///
    /// Returns the engine's ends as `[in, out, err]`.
    pub(crate) fn connect(&mut self, launcher: &mut Child, timeout: Duration) -> Result<[Fifo; 3]> {
        let path = self.path("in");
        let deadline = Instant::now() + timeout;

        let input = loop {
            match open_fifo(&path, OFlag::O_WRONLY) {
                Ok(fd) => break fd,
                // No reader yet.
                Err(PtyError::Pipe(e)) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {},
                Err(err) => return Err(err),
            }
            if let Ok(Some(status)) = launcher.try_wait() {
                return Err(PtyError::launch(
                    &path.display().to_string(),
                    format!("launcher exited before connecting ({status})"),
                ));
            }
            if Instant::now() >= deadline {
                return Err(PtyError::ConnectTimeout {
                    name: path.display().to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let [out, err] = self.readers.take().ok_or(PtyError::Closed)?;
        Ok([Fifo { fd: input }, Fifo { fd: out }, Fifo { fd: err }])
    }
}

fn open_fifo(path: &std::path::Path, access: OFlag) -> Result<OwnedFd> {
    let fd = open(path, access | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| PtyError::Pipe(errno_to_io(e)))?;
    // SAFETY: `open` just returned this descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Non-blocking FIFO end.
pub(crate) struct Fifo {
    fd: OwnedFd,
}

impl PolledPipe for Fifo {
    fn available(&self) -> io::Result<Available> {
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one int through the pointer
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::FIONREAD as _, &mut pending) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if pending > 0 {
            return Ok(Available::Bytes(pending as usize));
        }

        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(_) | Err(Errno::EINTR) => {},
            Err(e) => return Err(errno_to_io(e)),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            Ok(Available::Hangup)
        } else {
            Ok(Available::Empty)
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd.as_raw_fd(), buf).map_err(errno_to_io)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        write(&self.fd, buf).map_err(errno_to_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_fifos_created_and_removed() {
        let set = FifoSet::create().unwrap();
        let names = set.names();
        let dir = set.dir.path().to_path_buf();
        for name in &names {
            let meta = std::fs::metadata(name).unwrap();
            use std::os::unix::fs::FileTypeExt;
            assert!(meta.file_type().is_fifo());
        }
        drop(set);
        assert!(!dir.exists());
    }

    #[test]
    fn test_connect_times_out_without_reader() {
        let mut set = FifoSet::create().unwrap();
        let mut child = Command::new("/bin/sleep").arg("5").spawn().unwrap();
        let start = Instant::now();
        let err = set
            .connect(&mut child, Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(matches!(err, PtyError::ConnectTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(100));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_connect_and_exchange() {
        let mut set = FifoSet::create().unwrap();
        let [input, output, error] = set.names();
        // Echo one line from the input FIFO to the output FIFO.
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exec <\"$1\" >\"$2\" 2>\"$3\"; read line; echo \"got $line\"", "sh"])
            .arg(input)
            .arg(output)
            .arg(error)
            .spawn()
            .unwrap();

        let [input, output, _error] = set.connect(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(input.write(b"ping\n").unwrap(), 5);
        drop(input);
        child.wait().unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match output.available().unwrap() {
                Available::Bytes(n) => {
                    let len = n.min(buf.len());
                    let read = output.read(&mut buf[..len]).unwrap();
                    collected.extend_from_slice(&buf[..read]);
                },
                Available::Hangup => break,
                Available::Empty => thread::sleep(POLL_INTERVAL),
            }
        }
        assert_eq!(collected, b"got ping\n");
    }
}
