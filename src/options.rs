//! Spawn request and its builder.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, Result};
use crate::platform::PlatformAdapter;
use crate::process::PtyProcess;
use crate::size::WindowSize;

/// `TERM` given to children on the POSIX backend unless overridden.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default delay between the graceful and the forceful signal of `destroy`.
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(2);

/// Which channel strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Best backend the host supports
    #[default]
    Auto,
    PosixPty,
    ConsoleHost,
    Agent,
    Emulated,
}

/// External launcher used by the pipe-emulated backend.
///
/// The launcher is run as `launcher... <in> <out> <err> <program> <args...>`
/// and must attach the program's standard streams to the three pipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatedLauncher {
    pub launcher: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

impl EmulatedLauncher {
    pub fn new<I, S>(launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EmulatedLauncher {
            launcher: launcher.into_iter().map(Into::into).collect(),
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Settings of the agent-based backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent library to load
    pub library: PathBuf,
    /// Deadline for connecting to the agent's pipes
    pub connect_timeout: Duration,
    /// Ask the agent for color escapes in console mode
    pub color_escapes: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            library: PathBuf::from("winpty.dll"),
            connect_timeout: Duration::from_secs(10),
            color_escapes: false,
        }
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Variables set for the child, overriding inherited ones
    pub environment: BTreeMap<String, String>,
    /// Start from the parent's environment
    pub inherit_environment: bool,
    /// Working directory, the parent's when unset
    pub directory: Option<PathBuf>,
    pub initial_size: Option<WindowSize>,
    /// Console mode: no controlling terminal, echo off and stderr split
    pub console: bool,
    /// Merge stderr into the output stream
    pub redirect_error_stream: bool,
    pub backend: BackendPreference,
    /// Keep the slave open in the parent so late output stays readable
    pub preserve_output_after_exit: bool,
    pub destroy_grace: Duration,
    pub emulated: Option<EmulatedLauncher>,
    pub agent: AgentConfig,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        SpawnOptions {
            command: Vec::new(),
            environment: BTreeMap::new(),
            inherit_environment: true,
            directory: None,
            initial_size: None,
            console: false,
            redirect_error_stream: false,
            backend: BackendPreference::Auto,
            preserve_output_after_exit: false,
            destroy_grace: DEFAULT_DESTROY_GRACE,
            emulated: None,
            agent: AgentConfig::default(),
        }
    }
}

impl SpawnOptions {
    /// Rejects requests that cannot be launched before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        let program = self
            .command
            .first()
            .ok_or_else(|| PtyError::InvalidCommand("empty command".into()))?;
        if program.is_empty() {
            return Err(PtyError::InvalidCommand("empty program name".into()));
        }
        if let Some(arg) = self.command.iter().find(|a| a.contains('\0')) {
            return Err(PtyError::InvalidCommand(format!(
                "argument contains NUL: {arg:?}"
            )));
        }
        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(PtyError::InvalidCommand(format!(
                    "invalid environment key {key:?}"
                )));
            }
            if value.contains('\0') {
                return Err(PtyError::InvalidCommand(format!(
                    "environment value of {key} contains NUL"
                )));
            }
        }
        Ok(())
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// The child's final environment: inherited variables, then overrides.
    pub fn resolved_environment(&self) -> BTreeMap<OsString, OsString> {
        let mut env: BTreeMap<OsString, OsString> = if self.inherit_environment {
            std::env::vars_os().collect()
        } else {
            BTreeMap::new()
        };
        for (key, value) in &self.environment {
            env.insert(key.into(), value.into());
        }
        env
    }
}

/// Consuming builder over [`SpawnOptions`].
///
/// ```no_run
/// use ptyspawn::{PlatformAdapter, PtyProcessBuilder, WindowSize};
///
/// let adapter = PlatformAdapter::detect();
/// let process = PtyProcessBuilder::new(["/bin/sh", "-c", "echo hi"])
///     .env("LANG", "C")
///     .initial_size(WindowSize::new(120, 40))
///     .start(&adapter)?;
/// # Ok::<(), ptyspawn::PtyError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct PtyProcessBuilder {
    options: SpawnOptions,
}

impl PtyProcessBuilder {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PtyProcessBuilder {
            options: SpawnOptions {
                command: command.into_iter().map(Into::into).collect(),
                ..SpawnOptions::default()
            },
        }
    }

    pub fn from_options(options: SpawnOptions) -> Self {
        PtyProcessBuilder { options }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.options.command.push(arg.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.environment.insert(key.into(), value.into());
        self
    }

    /// Replace all explicitly set environment variables
    pub fn environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.options.environment = env;
        self
    }

    /// Do not inherit the parent's environment
    pub fn env_clear(mut self) -> Self {
        self.options.inherit_environment = false;
        self.options.environment.clear();
        self
    }

    pub fn directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.options.directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn initial_size(mut self, size: WindowSize) -> Self {
        self.options.initial_size = Some(size);
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.options.console = console;
        self
    }

    pub fn redirect_error_stream(mut self, redirect: bool) -> Self {
        self.options.redirect_error_stream = redirect;
        self
    }

    pub fn backend(mut self, backend: BackendPreference) -> Self {
        self.options.backend = backend;
        self
    }

    pub fn preserve_output_after_exit(mut self, preserve: bool) -> Self {
        self.options.preserve_output_after_exit = preserve;
        self
    }

    pub fn destroy_grace(mut self, grace: Duration) -> Self {
        self.options.destroy_grace = grace;
        self
    }

    pub fn emulated(mut self, launcher: EmulatedLauncher) -> Self {
        self.options.emulated = Some(launcher);
        self
    }

    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.options.agent = agent;
        self
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    pub fn into_options(self) -> SpawnOptions {
        self.options
    }

    /// Spawn the process
    pub fn start(self, adapter: &PlatformAdapter) -> Result<PtyProcess> {
        PtyProcess::start(adapter, self.options)
    }
}
