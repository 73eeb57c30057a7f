//! Overlapped named pipes.
//!
//! Every [`NamedPipe`] owns a manual-reset shutdown event. Reads and writes
//! are issued overlapped and wait on their completion event together with
//! the shutdown event, so [`NamedPipe::shutdown`] aborts a blocked call. A
//! pending operation is always cancelled and collected before returning;
//! the kernel never writes into a stack `OVERLAPPED` that is gone.

use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::process::{self, Child};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::winerror::{
    ERROR_BROKEN_PIPE, ERROR_IO_PENDING, ERROR_NO_DATA, ERROR_OPERATION_ABORTED,
    ERROR_PIPE_CONNECTED, ERROR_PIPE_NOT_CONNECTED, WAIT_TIMEOUT,
};
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::ioapiset::{CancelIo, GetOverlappedResult};
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::namedpipeapi::{ConnectNamedPipe, CreateNamedPipeW, PeekNamedPipe};
use winapi::um::synchapi::{CreateEventW, SetEvent, WaitForMultipleObjects, WaitForSingleObject};
use winapi::um::winbase::{
    FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED, INFINITE, PIPE_ACCESS_INBOUND,
    PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE,
    PIPE_WAIT, WAIT_OBJECT_0,
};
use winapi::um::winnt::{GENERIC_READ, GENERIC_WRITE, HANDLE};

use super::wide;
use crate::emulated::{Available, PolledPipe, POLL_INTERVAL};
use crate::error::{PtyError, Result};

const BUFFER_SIZE: DWORD = 128 * 1024;

static PIPE_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// `\\.\pipe\ptyspawn-<pid>-<n>-<tag>`, unique within this host.
pub(crate) fn unique_name(tag: &str) -> String {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    format!(r"\\.\pipe\ptyspawn-{}-{}-{}", process::id(), serial, tag)
}

/// Data flow as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// We read
    Inbound,
    /// We write
    Outbound,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(|code| code as DWORD),
        Some(ERROR_BROKEN_PIPE) | Some(ERROR_PIPE_NOT_CONNECTED) | Some(ERROR_NO_DATA)
    )
}

struct Event(OwnedHandle);

impl Event {
    fn new() -> io::Result<Self> {
        // SAFETY: anonymous manual-reset event, initially unset
        let handle = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: just created and owned by nobody else
        Ok(Event(unsafe { OwnedHandle::from_raw_handle(handle as _) }))
    }

    fn raw(&self) -> HANDLE {
        self.0.as_raw_handle() as HANDLE
    }

    fn set(&self) {
        // SAFETY: the event is open for the lifetime of `self`
        unsafe { SetEvent(self.raw()) };
    }
}

/// Either end of a named pipe, opened for overlapped I/O.
pub(crate) struct NamedPipe {
    handle: OwnedHandle,
    name: String,
    shutdown: Event,
    shut: AtomicBool,
    read_event: Mutex<Event>,
    write_event: Mutex<Event>,
}

impl NamedPipe {
    fn from_handle(handle: OwnedHandle, name: &str) -> io::Result<Self> {
        Ok(NamedPipe {
            handle,
            name: name.to_owned(),
            shutdown: Event::new()?,
            shut: AtomicBool::new(false),
            read_event: Mutex::new(Event::new()?),
            write_event: Mutex::new(Event::new()?),
        })
    }

    /// Creates the only instance of the pipe `name`.
    pub(crate) fn create_server(name: &str, direction: Direction) -> io::Result<Self> {
        let access = match direction {
            Direction::Inbound => PIPE_ACCESS_INBOUND,
            Direction::Outbound => PIPE_ACCESS_OUTBOUND,
        };
        // SAFETY: `wide(name)` is NUL-terminated and outlives the call
        let handle = unsafe {
            CreateNamedPipeW(
                wide(name).as_ptr(),
                access | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                1,
                BUFFER_SIZE,
                BUFFER_SIZE,
                0,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: just created and owned by nobody else
        Self::from_handle(unsafe { OwnedHandle::from_raw_handle(handle as _) }, name)
    }

    /// Connects to an existing server pipe.
    pub(crate) fn connect_client(name: &str, direction: Direction) -> io::Result<Self> {
        let handle = open_client(name, direction, FILE_FLAG_OVERLAPPED)?;
        Self::from_handle(handle, name)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    pub(crate) fn is_shut(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    /// Aborts blocked reads and writes and fails every later one. The
    /// handle itself is closed on drop.
    pub(crate) fn shutdown(&self) {
        if !self.shut.swap(true, Ordering::SeqCst) {
            self.shutdown.set();
        }
    }

    /// Runs one overlapped operation to completion, or until shutdown.
    fn overlapped_io(
        &self,
        event: &Event,
        start: impl FnOnce(*mut OVERLAPPED, *mut DWORD) -> i32,
    ) -> io::Result<usize> {
        // SAFETY: all-zero is a valid OVERLAPPED
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = event.raw();
        let mut transferred: DWORD = 0;

        if start(&mut overlapped, &mut transferred) != 0 {
            return Ok(transferred as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
            return Err(err);
        }

        let handles = [event.raw(), self.shutdown.raw()];
        // SAFETY: both events stay open across the wait
        let woke = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), FALSE, INFINITE) };
        if woke != WAIT_OBJECT_0 {
            // SAFETY: cancels only this thread's I/O on our handle
            unsafe { CancelIo(self.raw()) };
        }
        // Waits until the kernel is done with `overlapped`.
        // SAFETY: `overlapped` and `transferred` are still alive
        if unsafe { GetOverlappedResult(self.raw(), &mut overlapped, &mut transferred, TRUE) } == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32) {
                return Ok(transferred as usize);
            }
            return Err(err);
        }
        Ok(transferred as usize)
    }

    /// Reads into `buf`; `Ok(0)` once the peer is gone or after shutdown.
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let event = lock(&self.read_event);
        if self.is_shut() || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(DWORD::MAX as usize) as DWORD;
        let handle = self.raw();
        let result = self.overlapped_io(&event, |overlapped, transferred| unsafe {
            // SAFETY: `buf` outlives the operation, see `overlapped_io`
            ReadFile(handle, buf.as_mut_ptr() as _, len, transferred, overlapped)
        });
        match result {
            Err(err) if is_disconnect(&err) => Ok(0),
            other => other,
        }
    }

    /// Writes from `buf`. A gone peer is [`io::ErrorKind::BrokenPipe`].
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let event = lock(&self.write_event);
        if self.is_shut() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(DWORD::MAX as usize) as DWORD;
        let handle = self.raw();
        let result = self.overlapped_io(&event, |overlapped, transferred| unsafe {
            // SAFETY: `buf` outlives the operation, see `overlapped_io`
            WriteFile(handle, buf.as_ptr() as _, len, transferred, overlapped)
        });
        match result {
            Err(err) if is_disconnect(&err) => Err(io::ErrorKind::BrokenPipe.into()),
            Ok(0) if self.is_shut() => Err(io::ErrorKind::BrokenPipe.into()),
            other => other,
        }
    }

    /// Bytes waiting to be read, or `None` if the peer is gone.
    pub(crate) fn peek(&self) -> io::Result<Option<usize>> {
        let mut available: DWORD = 0;
        // SAFETY: only the byte count is written
        let ok = unsafe {
            PeekNamedPipe(
                self.raw(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            return if is_disconnect(&err) { Ok(None) } else { Err(err) };
        }
        Ok(Some(available as usize))
    }

    /// Waits for a client to connect to this server end.
    ///
    /// `check` runs every [`POLL_INTERVAL`] and can abort the wait. On
    /// timeout or abort the pending connect is cancelled before returning.
    pub(crate) fn accept(
        &self,
        deadline: Instant,
        timeout: Duration,
        check: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let event = lock(&self.read_event);
        // SAFETY: all-zero is a valid OVERLAPPED
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = event.raw();

        // SAFETY: `overlapped` is collected below before it goes out of scope
        if unsafe { ConnectNamedPipe(self.raw(), &mut overlapped) } != 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error().map(|code| code as DWORD) {
            Some(ERROR_PIPE_CONNECTED) => return Ok(()),
            Some(ERROR_IO_PENDING) => {},
            _ => return Err(PtyError::Pipe(err)),
        }

        let outcome = loop {
            let slice = POLL_INTERVAL.as_millis() as DWORD;
            // SAFETY: the event stays open across the wait
            match unsafe { WaitForSingleObject(event.raw(), slice) } {
                WAIT_OBJECT_0 => break Ok(()),
                WAIT_TIMEOUT => {},
                _ => break Err(PtyError::Pipe(io::Error::last_os_error())),
            }
            if let Err(err) = check() {
                break Err(err);
            }
            if Instant::now() >= deadline {
                break Err(PtyError::ConnectTimeout {
                    name: self.name.clone(),
                    timeout,
                });
            }
        };

        if outcome.is_err() {
            // SAFETY: cancels only our pending connect
            unsafe { CancelIo(self.raw()) };
        }
        let mut ignored: DWORD = 0;
        // SAFETY: `overlapped` is still alive; waits for the kernel to let go
        let collected = unsafe { GetOverlappedResult(self.raw(), &mut overlapped, &mut ignored, TRUE) };
        match outcome {
            Ok(()) if collected == 0 => Err(PtyError::Pipe(io::Error::last_os_error())),
            other => other,
        }
    }
}

/// Opens the client end of `name` for the given direction.
pub(crate) fn open_client(name: &str, direction: Direction, flags: DWORD) -> io::Result<OwnedHandle> {
    let access = match direction {
        Direction::Inbound => GENERIC_READ,
        Direction::Outbound => GENERIC_WRITE,
    };
    // SAFETY: `wide(name)` is NUL-terminated and outlives the call
    let handle = unsafe {
        CreateFileW(
            wide(name).as_ptr(),
            access,
            0,
            ptr::null_mut(),
            OPEN_EXISTING,
            flags,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: just opened and owned by nobody else
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as _) })
}

/// A connected pipe: our overlapped server end and a synchronous client end
/// for another party (the pseudo console host) to use.
///
/// `direction` is the flow as seen from our end.
pub(crate) fn pair(tag: &str, direction: Direction) -> Result<(NamedPipe, OwnedHandle)> {
    let name = unique_name(tag);
    let ours = NamedPipe::create_server(&name, direction).map_err(PtyError::Pipe)?;
    let peer = match direction {
        Direction::Inbound => Direction::Outbound,
        Direction::Outbound => Direction::Inbound,
    };
    let theirs = open_client(&name, peer, 0).map_err(PtyError::Pipe)?;
    // The client is already there, so this returns at once.
    let timeout = Duration::ZERO;
    ours.accept(Instant::now(), timeout, &mut || Ok(()))?;
    Ok((ours, theirs))
}

/// Server end used by the emulated backend.
pub(crate) type ServerPipe = NamedPipe;

impl PolledPipe for NamedPipe {
    fn available(&self) -> io::Result<Available> {
        Ok(match self.peek()? {
            None => Available::Hangup,
            Some(0) => Available::Empty,
            Some(n) => Available::Bytes(n),
        })
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        NamedPipe::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        NamedPipe::write(self, buf)
    }
}

const TAGS: [&str; 3] = ["in", "out", "err"];

/// The three server pipes of one emulated process.
pub(crate) struct ServerPipeSet {
    names: [String; 3],
    pipes: Option<[NamedPipe; 3]>,
}

impl ServerPipeSet {
    pub(crate) fn create() -> Result<Self> {
        let names = TAGS.map(unique_name);
        let [input, output, error] = &names;
        let pipes = [
            NamedPipe::create_server(input, Direction::Outbound),
            NamedPipe::create_server(output, Direction::Inbound),
            NamedPipe::create_server(error, Direction::Inbound),
        ];
        let [input, output, error] = pipes;
        Ok(ServerPipeSet {
            pipes: Some([
                input.map_err(PtyError::Pipe)?,
                output.map_err(PtyError::Pipe)?,
                error.map_err(PtyError::Pipe)?,
            ]),
            names,
        })
    }

    /// Pipe names passed to the launcher: in, out, err.
    pub(crate) fn names(&self) -> [OsString; 3] {
        self.names.clone().map(OsString::from)
    }

    /// Waits until the launcher connected to all three pipes.
    ///
    /// Returns the engine's ends as `[in, out, err]`.
    pub(crate) fn connect(&mut self, launcher: &mut Child, timeout: Duration) -> Result<[ServerPipe; 3]> {
        let pipes = self.pipes.take().ok_or(PtyError::Closed)?;
        let deadline = Instant::now() + timeout;
        for pipe in &pipes {
            let name = pipe.name().to_owned();
            pipe.accept(deadline, timeout, &mut || match launcher.try_wait() {
                Ok(Some(status)) => Err(PtyError::launch(
                    &name,
                    format!("launcher exited before connecting ({status})"),
                )),
                _ => Ok(()),
            })?;
        }
        Ok(pipes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unique_names() {
        let a = unique_name("in");
        let b = unique_name("in");
        assert_ne!(a, b);
        assert!(a.starts_with(r"\\.\pipe\ptyspawn-"));
        assert!(a.ends_with("-in"));
    }

    #[test]
    fn test_pair_round_trip() {
        let (ours, theirs) = pair("test", Direction::Inbound).unwrap();
        let name = ours.name().to_owned();
        drop(theirs);
        // Peer closed: end of stream, and the pipe reports hangup.
        let mut buf = [0u8; 8];
        assert_eq!(ours.read(&mut buf).unwrap(), 0);
        assert!(matches!(ours.available().unwrap(), Available::Hangup));
        assert!(name.contains("-test"));
    }

    #[test]
    fn test_shutdown_unblocks_read() {
        let (ours, _theirs) = pair("read", Direction::Inbound).unwrap();
        let ours = Arc::new(ours);
        let reader = {
            let ours = Arc::clone(&ours);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                ours.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(50));
        ours.shutdown();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
        assert_eq!(
            ours.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_accept_times_out() {
        let pipe = NamedPipe::create_server(&unique_name("lonely"), Direction::Inbound).unwrap();
        let timeout = Duration::from_millis(50);
        let err = pipe
            .accept(Instant::now() + timeout, timeout, &mut || Ok(()))
            .unwrap_err();
        assert!(matches!(err, PtyError::ConnectTimeout { .. }));
    }
}
