//! Spawn child processes attached to a pseudo-terminal.
//!
//! One lifecycle contract over four channel backends:
//! - POSIX PTY (master/slave pair, fork/exec)
//! - Windows pseudo console (console host bound to two pipes)
//! - Windows agent (a helper process owning a hidden console)
//! - pipe emulation (named pipes plus an external launcher, polled)
//!
//! ```no_run
//! use std::io::Read;
//! use ptyspawn::{PlatformAdapter, PtyProcessBuilder};
//!
//! let adapter = PlatformAdapter::detect();
//! let process = PtyProcessBuilder::new(["/bin/echo", "hello"]).start(&adapter)?;
//! let mut output = String::new();
//! process.reader().as_ref().read_to_string(&mut output)?;
//! println!("{output:?} {}", process.wait_for());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod backend;
pub mod drain;
mod emulated;
pub mod error;
pub mod exit;
pub mod options;
pub mod platform;
mod process;
pub mod size;
pub mod status;
mod stream;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

pub use emulated::POLL_INTERVAL;
pub use error::{ErrorCategory, PtyError, Result};
pub use exit::ExitLatch;
pub use options::{AgentConfig, BackendPreference, EmulatedLauncher, PtyProcessBuilder, SpawnOptions};
pub use platform::{BackendKind, Capabilities, PlatformAdapter};
pub use process::PtyProcess;
pub use size::WindowSize;
pub use status::{ExitStatus, LifecycleState, Signal, UNKNOWN_EXIT_CODE};
pub use stream::{PtyReader, PtyWriter};
