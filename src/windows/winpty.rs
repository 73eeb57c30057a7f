//! winpty agent backend.
//!
//! `winpty.dll` starts a helper agent that owns a hidden console and
//! exposes it as named pipes. We connect to those pipes, ask the agent to
//! spawn the child, and watch the child's process handle. Freeing the agent
//! closes the hidden console, so that only happens once the child has
//! exited and its output was drained.

use std::ffi::OsString;
use std::os::raw::c_int;
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use shared_library::shared_library;
use tracing::{debug, warn};
use winapi::shared::minwindef::{BOOL, DWORD};
use winapi::shared::winerror::{ERROR_FILE_NOT_FOUND, ERROR_PIPE_BUSY};
use winapi::um::winnt::{HANDLE, LPCWSTR, LPWSTR, PVOID};

use super::channel::PipeChannel;
use super::cmdline::{self, find_executable, Environment};
use super::named_pipe::{Direction, NamedPipe};
use super::{watch, ChildProcess};
use crate::backend::BackendOps;
use crate::drain::{self, ReadActivity};
use crate::emulated::POLL_INTERVAL;
use crate::error::{PtyError, Result};
use crate::exit::ExitLatch;
use crate::options::{AgentConfig, SpawnOptions};
use crate::platform::BackendKind;
use crate::size::WindowSize;
use crate::status::Signal;
use crate::stream::{ChannelRead, ChannelWrite};

const WINPTY_FLAG_CONERR: u64 = 0x1;
const WINPTY_FLAG_PLAIN_OUTPUT: u64 = 0x2;
const WINPTY_FLAG_COLOR_ESCAPES: u64 = 0x4;

const WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN: u64 = 0x1;
const WINPTY_SPAWN_FLAG_EXIT_AFTER_SHUTDOWN: u64 = 0x2;

const DEFAULT_SIZE: WindowSize = WindowSize {
    cols: 80,
    rows: 1,
    pixel_width: 0,
    pixel_height: 0,
};

/// Repeated resizes right after opening keep the agent from emitting
/// stray blank lines.
const SETTLE_RESIZES: usize = 5;
const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Initial buffer for the child's working directory, in UTF-16 units.
const DIRECTORY_CAPACITY: usize = 1024;
/// Most console processes reported by one query.
const MAX_CONSOLE_PROCESSES: usize = 64;

type WinptyError = PVOID;

shared_library!(WinPtyFuncs,
    pub fn winpty_error_code(err: WinptyError) -> DWORD,
    pub fn winpty_error_msg(err: WinptyError) -> LPCWSTR,
    pub fn winpty_error_free(err: WinptyError),
    pub fn winpty_config_new(flags: u64, err: *mut WinptyError) -> PVOID,
    pub fn winpty_config_free(cfg: PVOID),
    pub fn winpty_config_set_initial_size(cfg: PVOID, cols: c_int, rows: c_int),
    pub fn winpty_config_set_agent_timeout(cfg: PVOID, timeout_ms: DWORD),
    pub fn winpty_open(cfg: PVOID, err: *mut WinptyError) -> PVOID,
    pub fn winpty_conin_name(wp: PVOID) -> LPCWSTR,
    pub fn winpty_conout_name(wp: PVOID) -> LPCWSTR,
    pub fn winpty_conerr_name(wp: PVOID) -> LPCWSTR,
    pub fn winpty_spawn_config_new(
        flags: u64,
        appname: LPCWSTR,
        cmdline: LPCWSTR,
        cwd: LPCWSTR,
        env: LPCWSTR,
        err: *mut WinptyError
    ) -> PVOID,
    pub fn winpty_spawn_config_free(cfg: PVOID),
    pub fn winpty_spawn(
        wp: PVOID,
        cfg: PVOID,
        process_handle: *mut HANDLE,
        thread_handle: *mut HANDLE,
        create_process_error: *mut DWORD,
        err: *mut WinptyError
    ) -> BOOL,
    pub fn winpty_set_size(wp: PVOID, cols: c_int, rows: c_int, err: *mut WinptyError) -> BOOL,
    pub fn winpty_get_console_process_list(
        wp: PVOID,
        process_list: *mut c_int,
        process_count: c_int,
        err: *mut WinptyError
    ) -> c_int,
    pub fn winpty_get_current_directory(
        wp: PVOID,
        buffer_len: DWORD,
        buffer: LPWSTR,
        err: *mut WinptyError
    ) -> DWORD,
    pub fn winpty_free(wp: PVOID),
);

/// Whether the agent library named in `config` loads.
pub(crate) fn is_available(config: &AgentConfig) -> bool {
    WinPtyFuncs::open(&config.library).is_ok()
}

/// Copies a NUL-terminated wide string owned by the library.
///
/// # Safety
/// `s` must be null or point at a NUL-terminated UTF-16 string.
unsafe fn from_wide(s: LPCWSTR) -> String {
    if s.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *s.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(s, len))
}

/// Frees an error object the library may have filled on success.
fn discard_error(funcs: &WinPtyFuncs, err: WinptyError) {
    if !err.is_null() {
        // SAFETY: `err` came from the library and is freed exactly once
        unsafe { (funcs.winpty_error_free)(err) };
    }
}

/// Message of a library error object, which is freed.
fn take_error(funcs: &WinPtyFuncs, err: WinptyError) -> String {
    if err.is_null() {
        return "unknown winpty error".to_owned();
    }
    // SAFETY: `err` came from the library and is freed exactly once
    unsafe {
        let message = format!(
            "{} (code {})",
            from_wide((funcs.winpty_error_msg)(err)),
            (funcs.winpty_error_code)(err)
        );
        (funcs.winpty_error_free)(err);
        message
    }
}

fn size_args(size: WindowSize) -> (c_int, c_int) {
    (c_int::from(size.cols.max(1)), c_int::from(size.rows.max(1)))
}

#[derive(Clone, Copy)]
enum AgentPipe {
    Conin,
    Conout,
    Conerr,
}

struct AgentHandle(PVOID);

// SAFETY: winpty handles are not tied to the creating thread
unsafe impl Send for AgentHandle {}

/// The connection to one agent process.
struct Agent {
    funcs: WinPtyFuncs,
    handle: Mutex<Option<AgentHandle>>,
}

impl Agent {
    fn open(config: &AgentConfig, console: bool, size: WindowSize) -> Result<Self> {
        let funcs = WinPtyFuncs::open(&config.library).map_err(|e| {
            PtyError::Agent(format!("cannot load {}: {e:?}", config.library.display()))
        })?;

        let mut flags = 0;
        if console {
            flags |= WINPTY_FLAG_CONERR | WINPTY_FLAG_PLAIN_OUTPUT;
            if config.color_escapes {
                flags |= WINPTY_FLAG_COLOR_ESCAPES;
            }
        }

        let mut err: WinptyError = ptr::null_mut();
        // SAFETY: plain library calls; `cfg` is freed on every path
        let handle = unsafe {
            let cfg = (funcs.winpty_config_new)(flags, &mut err);
            if cfg.is_null() {
                return Err(PtyError::Agent(take_error(&funcs, err)));
            }
            let (cols, rows) = size_args(size);
            (funcs.winpty_config_set_initial_size)(cfg, cols, rows);
            let timeout_ms = config.connect_timeout.as_millis().min(DWORD::MAX as u128) as DWORD;
            (funcs.winpty_config_set_agent_timeout)(cfg, timeout_ms);
            let handle = (funcs.winpty_open)(cfg, &mut err);
            (funcs.winpty_config_free)(cfg);
            handle
        };
        if handle.is_null() {
            return Err(PtyError::Agent(take_error(&funcs, err)));
        }

        Ok(Agent {
            funcs,
            handle: Mutex::new(Some(AgentHandle(handle))),
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<AgentHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipe_name(&self, pipe: AgentPipe) -> Result<String> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::Closed)?;
        // SAFETY: the name is owned by the open agent handle
        Ok(unsafe {
            from_wide(match pipe {
                AgentPipe::Conin => (self.funcs.winpty_conin_name)(handle.0),
                AgentPipe::Conout => (self.funcs.winpty_conout_name)(handle.0),
                AgentPipe::Conerr => (self.funcs.winpty_conerr_name)(handle.0),
            })
        })
    }

    fn set_size(&self, size: WindowSize) -> Result<()> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::Closed)?;
        let (cols, rows) = size_args(size);
        let mut err: WinptyError = ptr::null_mut();
        // SAFETY: the handle stays open while `slot` is held
        if unsafe { (self.funcs.winpty_set_size)(handle.0, cols, rows, &mut err) } == 0 {
            let message = take_error(&self.funcs, err);
            return Err(PtyError::SetWindowSize(std::io::Error::other(message)));
        }
        Ok(())
    }

    /// Working directory of the process running in the agent's console.
    fn current_directory(&self) -> Result<PathBuf> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::AlreadyExited)?;
        let mut buffer = vec![0u16; DIRECTORY_CAPACITY];
        loop {
            let mut err: WinptyError = ptr::null_mut();
            // SAFETY: the buffer length passed matches the allocation
            let len = unsafe {
                (self.funcs.winpty_get_current_directory)(
                    handle.0,
                    buffer.len() as DWORD,
                    buffer.as_mut_ptr(),
                    &mut err,
                )
            } as usize;
            if len == 0 {
                let message = take_error(&self.funcs, err);
                return Err(PtyError::Io(std::io::Error::other(message)));
            }
            discard_error(&self.funcs, err);
            // Too small: `len` is the size needed, terminator included.
            if len >= buffer.len() {
                buffer.resize(len + 1, 0);
                continue;
            }
            buffer.truncate(len);
            return Ok(PathBuf::from(OsString::from_wide(&buffer)));
        }
    }

    fn console_process_count(&self) -> Result<usize> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::AlreadyExited)?;
        let mut pids: [c_int; MAX_CONSOLE_PROCESSES] = [0; MAX_CONSOLE_PROCESSES];
        let mut err: WinptyError = ptr::null_mut();
        // SAFETY: the count passed matches the array
        let count = unsafe {
            (self.funcs.winpty_get_console_process_list)(
                handle.0,
                pids.as_mut_ptr(),
                MAX_CONSOLE_PROCESSES as c_int,
                &mut err,
            )
        };
        if count <= 0 {
            let message = take_error(&self.funcs, err);
            return Err(PtyError::Io(std::io::Error::other(message)));
        }
        discard_error(&self.funcs, err);
        Ok(count as usize)
    }

    fn spawn(&self, program: &Path, options: &SpawnOptions, env: &Environment) -> Result<ChildProcess> {
        let slot = self.slot();
        let handle = slot.as_ref().ok_or(PtyError::Closed)?;

        let command_line = cmdline::command_line(program, &options.command);
        let cwd = cmdline::working_directory(options);
        let env_block = env.block();
        let mut err: WinptyError = ptr::null_mut();
        let mut process: HANDLE = ptr::null_mut();
        let mut create_error: DWORD = 0;

        // SAFETY: buffers are NUL-terminated and outlive the calls; the
        // spawn config is freed on every path
        unsafe {
            let cfg = (self.funcs.winpty_spawn_config_new)(
                WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN | WINPTY_SPAWN_FLAG_EXIT_AFTER_SHUTDOWN,
                ptr::null(),
                command_line.as_ptr(),
                cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
                env_block.as_ptr(),
                &mut err,
            );
            if cfg.is_null() {
                return Err(PtyError::Agent(take_error(&self.funcs, err)));
            }
            let ok = (self.funcs.winpty_spawn)(
                handle.0,
                cfg,
                &mut process,
                ptr::null_mut(),
                &mut create_error,
                &mut err,
            );
            (self.funcs.winpty_spawn_config_free)(cfg);
            if ok == 0 {
                let reason = take_error(&self.funcs, err);
                return Err(PtyError::launch(
                    options.program(),
                    format!("{reason}, CreateProcess error {create_error}"),
                ));
            }
            Ok(ChildProcess::from_raw(process))
        }
    }

    /// Disconnects; the agent then closes its console.
    fn close(&self) {
        let taken = self.slot().take();
        if let Some(handle) = taken {
            // SAFETY: taken out of the slot, so freed exactly once
            unsafe { (self.funcs.winpty_free)(handle.0) };
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connects to an agent pipe, retrying while the agent has not created it
/// or all instances are busy.
fn connect_pipe(name: &str, direction: Direction, timeout: Duration) -> Result<NamedPipe> {
    let deadline = Instant::now() + timeout;
    loop {
        match NamedPipe::connect_client(name, direction) {
            Ok(pipe) => return Ok(pipe),
            Err(err)
                if matches!(
                    err.raw_os_error().map(|code| code as DWORD),
                    Some(ERROR_PIPE_BUSY) | Some(ERROR_FILE_NOT_FOUND)
                ) => {},
            Err(err) => return Err(PtyError::Agent(format!("connecting to {name}: {err}"))),
        }
        if Instant::now() >= deadline {
            return Err(PtyError::ConnectTimeout {
                name: name.to_owned(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// A child running inside a winpty agent's console.
pub(crate) struct WinPtyProcess {
    child: Arc<ChildProcess>,
    latch: Arc<ExitLatch>,
    agent: Arc<Agent>,
    input: Arc<PipeChannel>,
    output: Arc<PipeChannel>,
    error: Option<Arc<PipeChannel>>,
    output_activity: Arc<ReadActivity>,
    error_activity: Arc<ReadActivity>,
    /// Last size applied; the agent cannot be asked
    size: Mutex<WindowSize>,
    console: bool,
}

impl WinPtyProcess {
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
        let config = &options.agent;

        // Dropping `agent` on any error below frees it.
        let agent = Arc::new(Agent::open(config, options.console, size)?);
        let timeout = config.connect_timeout;
        let input = connect_pipe(
            &agent.pipe_name(AgentPipe::Conin)?,
            Direction::Outbound,
            timeout,
        )?;
        let output = connect_pipe(
            &agent.pipe_name(AgentPipe::Conout)?,
            Direction::Inbound,
            timeout,
        )?;
        let error = if options.console {
            Some(connect_pipe(
                &agent.pipe_name(AgentPipe::Conerr)?,
                Direction::Inbound,
                timeout,
            )?)
        } else {
            None
        };

        for _ in 0..SETTLE_RESIZES {
            if let Err(err) = agent.set_size(size) {
                debug!(%err, "settling resize failed");
                break;
            }
            thread::sleep(SETTLE_DELAY);
        }

        let child = Arc::new(agent.spawn(&program, options, &env)?);

        let input = Arc::new(PipeChannel::new(input));
        let output = Arc::new(PipeChannel::new(output));
        let error = error.map(|pipe| Arc::new(PipeChannel::new(pipe)));
        let output_activity = Arc::new(ReadActivity::new());
        let error_activity = Arc::new(ReadActivity::new());

        let watched = {
            let pid = child.pid();
            let agent = Arc::clone(&agent);
            let activities = [Arc::clone(&output_activity), Arc::clone(&error_activity)];
            watch(Arc::clone(&child), Arc::clone(&latch), move |_| {
                let unread = drain::await_output_read(activities.iter().map(Arc::as_ref));
                if unread > 0 {
                    warn!(pid, unread, "output was not read before the agent closed");
                }
                agent.close();
                debug!(pid, "agent closed");
            })
        };
        if let Err(err) = watched {
            let _ = child.terminate(&latch);
            return Err(err);
        }

        debug!(pid = child.pid(), command = ?options.command, "spawned through winpty agent");
        Ok(WinPtyProcess {
            child,
            latch,
            agent,
            input,
            output,
            error,
            output_activity,
            error_activity,
            size: Mutex::new(size),
            console: options.console,
        })
    }

    fn last_size(&self) -> MutexGuard<'_, WindowSize> {
        self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackendOps for WinPtyProcess {
    fn kind(&self) -> BackendKind {
        BackendKind::Agent
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

    fn error(&self) -> Option<(Arc<dyn ChannelRead>, Arc<ReadActivity>)> {
        let error = self.error.clone()?;
        Some((error, Arc::clone(&self.error_activity)))
    }

    fn resize(&self, size: WindowSize) -> Result<()> {
        let mut last = self.last_size();
        self.agent.set_size(size)?;
        *last = size;
        Ok(())
    }

    fn window_size(&self) -> Result<WindowSize> {
        Ok(*self.last_size())
    }

    fn signal(&self, _signal: Signal) -> Result<()> {
        self.child.terminate(&self.latch)
    }

    fn working_directory(&self) -> Result<PathBuf> {
        self.agent.current_directory()
    }

    fn console_process_count(&self) -> Result<usize> {
        self.agent.console_process_count()
    }

    fn close(&self) {
        self.input.shutdown();
        self.output.shutdown();
        if let Some(error) = &self.error {
            error.shutdown();
        }
    }

    fn is_console(&self) -> bool {
        self.console
    }
}
