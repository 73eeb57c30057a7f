//! Native pseudo console backend.
//!
//! The console host is bound to two named pipes: it reads keystrokes from
//! one and writes the rendered terminal stream to the other. Closing the
//! pseudo console discards output nobody read yet, so after the child
//! exits the watcher first gives the caller a short window to drain the
//! output pipe.

use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use shared_library::shared_library;
use tracing::{debug, warn};
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::shared::ntdef::NTSTATUS;
use winapi::shared::ntstatus::STATUS_SUCCESS;
use winapi::shared::winerror::{
    ERROR_DIRECTORY, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, HRESULT, S_OK,
};
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::processthreadsapi::{CreateProcessW, PROCESS_INFORMATION};
use winapi::um::winbase::{
    CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, STARTF_USESTDHANDLES,
    STARTUPINFOEXW,
};
use winapi::um::wincon::COORD;
use winapi::um::winnt::{HANDLE, OSVERSIONINFOW};

use super::channel::PipeChannel;
use super::cmdline::{self, find_executable, Environment};
use super::named_pipe::{self, Direction};
use super::procthreadattr::ProcThreadAttributeList;
use super::{watch, wide, ChildProcess};
use crate::backend::BackendOps;
use crate::drain::{self, ReadActivity};
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::SpawnOptions;
use crate::platform::BackendKind;
use crate::size::WindowSize;
use crate::status::Signal;
use crate::stream::{ChannelRead, ChannelWrite};

pub(crate) type HPCON = HANDLE;

const PSEUDOCONSOLE_RESIZE_QUIRK: DWORD = 0x2;

/// First Windows 10 build (1809) with a usable pseudo console.
pub const MIN_CONPTY_BUILD: u32 = 17_763;

const DEFAULT_SIZE: WindowSize = WindowSize {
    cols: 80,
    rows: 25,
    pixel_width: 0,
    pixel_height: 0,
};

shared_library!(ConPtyFuncs,
    pub fn CreatePseudoConsole(
        size: COORD,
        hInput: HANDLE,
        hOutput: HANDLE,
        flags: DWORD,
        hpc: *mut HPCON
    ) -> HRESULT,
    pub fn ResizePseudoConsole(hpc: HPCON, size: COORD) -> HRESULT,
    pub fn ClosePseudoConsole(hpc: HPCON),
);

shared_library!(Ntdll,
    pub fn RtlGetVersion(
        version_info: *mut OSVERSIONINFOW
    ) -> NTSTATUS,
);

/// A side-loaded `conpty.dll` wins over the one built into kernel32.
fn load_conpty() -> Option<ConPtyFuncs> {
    ConPtyFuncs::open(Path::new("conpty.dll"))
        .or_else(|_| ConPtyFuncs::open(Path::new("kernel32.dll")))
        .ok()
}

lazy_static! {
    static ref CONPTY: Option<ConPtyFuncs> = load_conpty();
}

fn conpty() -> Result<&'static ConPtyFuncs> {
    CONPTY
        .as_ref()
        .ok_or(PtyError::BackendUnavailable(BackendKind::ConsoleHost))
}

pub(crate) fn windows_build_number() -> Option<u32> {
    let ntdll = Ntdll::open(Path::new("ntdll.dll")).ok()?;
    // SAFETY: all-zero is a valid OSVERSIONINFOW
    let mut info: OSVERSIONINFOW = unsafe { mem::zeroed() };
    info.dwOSVersionInfoSize = mem::size_of::<OSVERSIONINFOW>() as u32;
    // SAFETY: `info` is sized and outlives the call
    let status = unsafe { (ntdll.RtlGetVersion)(&mut info) };
    (status == STATUS_SUCCESS).then_some(info.dwBuildNumber)
}

pub(crate) fn is_available() -> bool {
    windows_build_number().is_some_and(|build| build >= MIN_CONPTY_BUILD) && CONPTY.is_some()
}

fn coord(size: WindowSize) -> COORD {
    let clamp = |n: u16| n.clamp(1, i16::MAX as u16) as i16;
    COORD {
        X: clamp(size.cols),
        Y: clamp(size.rows),
    }
}

fn hresult_error(call: &str, result: HRESULT) -> io::Error {
    io::Error::other(format!("{call} failed: HRESULT {result:#010x}"))
}

struct ConsoleHandle(HPCON);

// SAFETY: a pseudo console handle may be used from any thread
unsafe impl Send for ConsoleHandle {}

struct PseudoConsole {
    handle: Mutex<Option<ConsoleHandle>>,
}

impl PseudoConsole {
    fn new(size: WindowSize, input: &OwnedHandle, output: &OwnedHandle) -> Result<Self> {
        let mut handle: HPCON = INVALID_HANDLE_VALUE;
        // SAFETY: the console host duplicates both pipe handles
        let result = unsafe {
            (conpty()?.CreatePseudoConsole)(
                coord(size),
                input.as_raw_handle() as HANDLE,
                output.as_raw_handle() as HANDLE,
                PSEUDOCONSOLE_RESIZE_QUIRK,
                &mut handle,
            )
        };
        if result != S_OK {
            return Err(PtyError::PseudoConsole(
                hresult_error("CreatePseudoConsole", result).to_string(),
            ));
        }
        Ok(PseudoConsole {
            handle: Mutex::new(Some(ConsoleHandle(handle))),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<ConsoleHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resize(&self, size: WindowSize) -> Result<()> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::Closed)?;
        // SAFETY: the handle stays open while `slot` is held
        let result = unsafe { (conpty()?.ResizePseudoConsole)(handle.0, coord(size)) };
        if result != S_OK {
            return Err(PtyError::SetWindowSize(hresult_error("ResizePseudoConsole", result)));
        }
        Ok(())
    }

    /// Closes the console host, which ends every process attached to it.
    fn close(&self) {
        let taken = self.slot().take();
        if let (Some(handle), Some(funcs)) = (taken, CONPTY.as_ref()) {
            // SAFETY: taken out of the slot, so closed exactly once
            unsafe { (funcs.ClosePseudoConsole)(handle.0) };
        }
    }

    fn spawn(&self, program: &Path, options: &SpawnOptions, env: &Environment) -> Result<ChildProcess> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::Closed)?;

        // SAFETY: all-zero is a valid STARTUPINFOEXW
        let mut si: STARTUPINFOEXW = unsafe { mem::zeroed() };
        si.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        si.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        si.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdError = INVALID_HANDLE_VALUE;

        let mut attrs = ProcThreadAttributeList::with_capacity(1)?;
        attrs.set_pseudo_console(handle.0)?;
        si.lpAttributeList = attrs.as_mut_ptr();

        let application = wide(program);
        let mut command_line = cmdline::command_line(program, &options.command);
        let mut env_block = env.block();
        let cwd = cmdline::working_directory(options);
        // SAFETY: all-zero is a valid PROCESS_INFORMATION
        let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

        // SAFETY: every buffer is NUL-terminated and outlives the call
        let ok = unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                FALSE,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                env_block.as_mut_ptr() as _,
                cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
                &mut si.StartupInfo,
                &mut pi,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error().map(|code| code as DWORD) {
                Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PATH_NOT_FOUND) => {
                    PtyError::ExecutableNotFound(options.program().to_owned())
                },
                Some(ERROR_DIRECTORY) => PtyError::launch(
                    options.program(),
                    format!("invalid working directory {:?}", options.directory),
                ),
                _ => PtyError::launch(options.program(), err),
            });
        }

        // SAFETY: both handles were just returned to us
        unsafe {
            drop(OwnedHandle::from_raw_handle(pi.hThread as _));
            Ok(ChildProcess::from_raw(pi.hProcess))
        }
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        self.close();
    }
}

/// A child attached to a pseudo console.
pub(crate) struct ConPtyProcess {
    child: Arc<ChildProcess>,
    latch: Arc<ExitLatch>,
    console: Arc<PseudoConsole>,
    input: Arc<PipeChannel>,
    output: Arc<PipeChannel>,
    output_activity: Arc<ReadActivity>,
    /// Last size applied; the console host cannot be asked
    size: Mutex<WindowSize>,
    console_mode: bool,
}

impl ConPtyProcess {
    pub(crate) fn spawn(options: &SpawnOptions, latch: Arc<ExitLatch>) -> Result<Self> {
        let env = Environment::from_options(options);
        let program = find_executable(
            options.program(),
            env.get("PATH"),
            env.get("PATHEXT"),
            options.directory.as_deref(),
        )
        .ok_or_else(|| PtyError::ExecutableNotFound(options.program().to_owned()))?;
        let size = options.initial_size.unwrap_or(DEFAULT_SIZE);

        let (input, input_peer) = named_pipe::pair("conin", Direction::Outbound)?;
        let (output, output_peer) = named_pipe::pair("conout", Direction::Inbound)?;
        let console = Arc::new(PseudoConsole::new(size, &input_peer, &output_peer)?);
        let child = Arc::new(console.spawn(&program, options, &env)?);
        // The console host holds its own copies; ours would keep the
        // pipes open after it is gone.
        drop(input_peer);
        drop(output_peer);

        let input = Arc::new(PipeChannel::new(input));
        let output = Arc::new(PipeChannel::new(output));
        let output_activity = Arc::new(ReadActivity::new());

        let watched = {
            let pid = child.pid();
            let console = Arc::clone(&console);
            let output = Arc::clone(&output);
            let activity = Arc::clone(&output_activity);
            watch(Arc::clone(&child), Arc::clone(&latch), move |_| {
                let unread = drain::await_output_read([activity.as_ref()]);
                if unread > 0 || !activity.is_tracked() {
                    if unread > 0 {
                        warn!(pid, "output was not read before the pseudo console closed");
                    }
                    // Nobody drains the pipe, which can stall the host on close.
                    output.shutdown();
                }
                console.close();
                debug!(pid, "pseudo console closed");
            })
        };
        if let Err(err) = watched {
            let _ = child.terminate(&latch);
            return Err(err);
        }

        debug!(pid = child.pid(), command = ?options.command, "spawned on pseudo console");
        Ok(ConPtyProcess {
            child,
            latch,
            console,
            input,
            output,
            output_activity,
            size: Mutex::new(size),
            console_mode: options.console,
        })
    }

    fn last_size(&self) -> MutexGuard<'_, WindowSize> {
        self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackendOps for ConPtyProcess {
    fn kind(&self) -> BackendKind {
        BackendKind::ConsoleHost
    }

    fn pid(&self) -> u32 {
        self.child.pid()
    }

    fn output(&self) -> (Arc<dyn ChannelRead>, Arc<ReadActivity>) {
        (self.output.clone(), Arc::clone(&self.output_activity))
    }

    fn input(&self) -> Arc<dyn ChannelWrite> {
        self.input.clone()
    }

    /// The console host renders stderr into the output stream.
    fn error(&self) -> Option<(Arc<dyn ChannelRead>, Arc<ReadActivity>)> {
        None
    }

    fn resize(&self, size: WindowSize) -> Result<()> {
        let mut last = self.last_size();
        self.console.resize(size)?;
        *last = size;
        Ok(())
    }

    fn window_size(&self) -> Result<WindowSize> {
        Ok(*self.last_size())
    }

    fn signal(&self, _signal: Signal) -> Result<()> {
        self.child.terminate(&self.latch)
    }

    fn close(&self) {
        self.input.shutdown();
        self.output.shutdown();
    }

    fn is_console(&self) -> bool {
        self.console_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_clamps() {
        let c = coord(WindowSize::new(0, u16::MAX));
        assert_eq!((c.X, c.Y), (1, i16::MAX));
        let c = coord(WindowSize::new(120, 40));
        assert_eq!((c.X, c.Y), (120, 40));
    }

    #[test]
    fn test_build_number_is_known() {
        assert!(windows_build_number().is_some());
    }
}
