//! PTY master/slave allocation and window size ioctls.
//!
//! Uses the POSIX PTY API:
//! - posix_openpt() to open the master
//! - grantpt() to set permissions
//! - unlockpt() to unlock the slave
//! - ptsname() to get the slave device path

use std::ffi::CString;
use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};

use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, LocalFlags, SetArg};

use crate::error::{errno_to_io, PtyError, Result};
use crate::size::WindowSize;

/// `ptsname` returns a pointer into static storage.
static PTSNAME_LOCK: Mutex<()> = Mutex::new(());

/// Freshly allocated master plus the path of its slave.
pub(crate) struct PtyPair {
    pub master: OwnedFd,
    pub slave_name: CString,
}

impl PtyPair {
    pub(crate) fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(|e| PtyError::OpenMaster(errno_to_io(e)))?;

        // An early return drops `master`, which closes it.
        grantpt(&master).map_err(|e| PtyError::GrantPty(errno_to_io(e)))?;
        unlockpt(&master).map_err(|e| PtyError::UnlockPty(errno_to_io(e)))?;

        let slave_name = {
            let _guard = PTSNAME_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
            // SAFETY: serialized by PTSNAME_LOCK and copied out before unlocking
            unsafe { ptsname(&master) }.map_err(|e| PtyError::PtsName(errno_to_io(e)))?
        };
        let slave_name = CString::new(slave_name)
            .map_err(|e| PtyError::PtsName(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // SAFETY: into_raw_fd hands over ownership of a valid descriptor
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        set_cloexec(&master)?;

        Ok(PtyPair { master, slave_name })
    }

    /// Opens the slave read-only in the parent. Holding it keeps output
    /// written right before the child exits readable from the master.
    pub(crate) fn open_slave_reader(&self) -> Result<OwnedFd> {
        let fd = open(
            self.slave_name.as_c_str(),
            OFlag::O_RDONLY | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| PtyError::OpenMaster(errno_to_io(e)))?;
        // SAFETY: `open` just returned this descriptor
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

pub(crate) fn set_cloexec(fd: &impl std::os::fd::AsRawFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(|e| PtyError::Io(errno_to_io(e)))
}

/// Set the window size on a PTY file descriptor
pub(crate) fn set_window_size(fd: RawFd, size: WindowSize) -> Result<()> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ reads one winsize from the pointer
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) };

    if result < 0 {
        Err(PtyError::SetWindowSize(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Get the window size from a PTY file descriptor
pub(crate) fn get_window_size(fd: RawFd) -> Result<WindowSize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ writes one winsize through the pointer
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) };

    if result < 0 {
        Err(PtyError::GetWindowSize(io::Error::last_os_error()))
    } else {
        Ok(WindowSize::from_winsize(winsize))
    }
}

/// Turns off echo on a terminal descriptor.
pub(crate) fn set_noecho(fd: BorrowedFd<'_>) -> Result<()> {
    let mut attrs = termios::tcgetattr(fd).map_err(|e| PtyError::Io(errno_to_io(e)))?;
    attrs.local_flags.remove(
        LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL,
    );
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(|e| PtyError::Io(errno_to_io(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, AsRawFd};

    #[test]
    fn test_open_pair() {
        let pair = PtyPair::open().unwrap();
        let name = pair.slave_name.to_str().unwrap();
        assert!(name.starts_with("/dev/"), "unexpected slave path {name}");
        let flags = fcntl(pair.master.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_window_size_roundtrip() {
        let pair = PtyPair::open().unwrap();
        let size = WindowSize::with_pixels(132, 43, 800, 600);
        set_window_size(pair.master.as_raw_fd(), size).unwrap();
        assert_eq!(get_window_size(pair.master.as_raw_fd()).unwrap(), size);
    }

    #[test]
    fn test_concurrent_open() {
        for _ in 0..20 {
            let handles: Vec<_> = (0..8).map(|_| std::thread::spawn(PtyPair::open)).collect();
            // Every pair stays open so the kernel cannot hand out a slave twice.
            let pairs: Vec<PtyPair> = handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();
            let mut names: Vec<_> = pairs.iter().map(|p| p.slave_name.clone()).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), pairs.len());
        }
    }

    #[test]
    fn test_noecho_on_slave() {
        let pair = PtyPair::open().unwrap();
        let slave = open(
            pair.slave_name.as_c_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .unwrap();
        let slave = unsafe { OwnedFd::from_raw_fd(slave) };
        set_noecho(slave.as_fd()).unwrap();
        let attrs = termios::tcgetattr(&slave).unwrap();
        assert!(!attrs.local_flags.contains(LocalFlags::ECHO));
    }
}
