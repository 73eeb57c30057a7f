//! Host capability probing and backend selection.
//!
//! A [`PlatformAdapter`] is built once (usually with [`PlatformAdapter::detect`])
//! and passed to every [`PtyProcess::start`](crate::PtyProcess::start). Tests
//! substitute one built from explicit [`Capabilities`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PtyError, Result};
use crate::options::{AgentConfig, BackendPreference, SpawnOptions};

/// The channel strategy a process was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Master/slave pair from the PTY multiplexer
    PosixPty,
    /// Native pseudo console bound to two pipes
    ConsoleHost,
    /// Helper agent owning a hidden console
    Agent,
    /// Named pipes plus an external launcher, polled
    Emulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::PosixPty => "posix-pty",
            BackendKind::ConsoleHost => "console-host",
            BackendKind::Agent => "agent",
            BackendKind::Emulated => "emulated",
        })
    }
}

/// What the host can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub posix_pty: bool,
    pub console_host: bool,
    pub agent: bool,
    /// Pipes for the emulated backend can be created. A launcher still has
    /// to be configured per spawn.
    pub emulated: bool,
}

impl Capabilities {
    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::PosixPty => self.posix_pty,
            BackendKind::ConsoleHost => self.console_host,
            BackendKind::Agent => self.agent,
            BackendKind::Emulated => self.emulated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlatformAdapter {
    capabilities: Capabilities,
}

impl PlatformAdapter {
    /// Inspects the running host with the default agent configuration.
    pub fn detect() -> Self {
        Self::detect_with(&AgentConfig::default())
    }

    /// Inspects the running host, loading the agent library named in `agent`.
    #[cfg(unix)]
    pub fn detect_with(_agent: &AgentConfig) -> Self {
        Self::with_capabilities(Capabilities {
            posix_pty: true,
            console_host: false,
            agent: false,
            emulated: true,
        })
    }

    /// Inspects the running host, loading the agent library named in `agent`.
    #[cfg(windows)]
    pub fn detect_with(agent: &AgentConfig) -> Self {
        Self::with_capabilities(Capabilities {
            posix_pty: false,
            console_host: crate::windows::conpty::is_available(),
            agent: crate::windows::winpty::is_available(agent),
            emulated: true,
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        PlatformAdapter { capabilities }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Picks the backend for one spawn request.
    pub fn select(&self, options: &SpawnOptions) -> Result<BackendKind> {
        let caps = &self.capabilities;
        let kind = match options.backend {
            BackendPreference::Auto => {
                if caps.posix_pty {
                    BackendKind::PosixPty
                } else if caps.console_host {
                    BackendKind::ConsoleHost
                } else if caps.agent {
                    BackendKind::Agent
                } else if caps.emulated && options.emulated.is_some() {
                    BackendKind::Emulated
                } else {
                    return Err(PtyError::BackendUnavailable(BackendKind::PosixPty));
                }
            },
            BackendPreference::PosixPty => BackendKind::PosixPty,
            BackendPreference::ConsoleHost => BackendKind::ConsoleHost,
            BackendPreference::Agent => BackendKind::Agent,
            BackendPreference::Emulated => BackendKind::Emulated,
        };

        if !caps.supports(kind) {
            return Err(PtyError::BackendUnavailable(kind));
        }
        if kind == BackendKind::Emulated && options.emulated.is_none() {
            return Err(PtyError::BackendUnavailable(kind));
        }

        debug!(backend = %kind, preference = ?options.backend, "selected backend");
        Ok(kind)
    }
}

impl Default for PlatformAdapter {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EmulatedLauncher;

    fn caps(posix_pty: bool, console_host: bool, agent: bool, emulated: bool) -> Capabilities {
        Capabilities {
            posix_pty,
            console_host,
            agent,
            emulated,
        }
    }

    fn options(backend: BackendPreference) -> SpawnOptions {
        SpawnOptions {
            command: vec!["sh".into()],
            backend,
            ..SpawnOptions::default()
        }
    }

    #[test]
    fn test_auto_prefers_posix() {
        let adapter = PlatformAdapter::with_capabilities(caps(true, true, true, true));
        assert_eq!(
            adapter.select(&options(BackendPreference::Auto)).unwrap(),
            BackendKind::PosixPty
        );
    }

    #[test]
    fn test_auto_order_on_windows_like_host() {
        let adapter = PlatformAdapter::with_capabilities(caps(false, true, true, true));
        assert_eq!(
            adapter.select(&options(BackendPreference::Auto)).unwrap(),
            BackendKind::ConsoleHost
        );

        let adapter = PlatformAdapter::with_capabilities(caps(false, false, true, true));
        assert_eq!(
            adapter.select(&options(BackendPreference::Auto)).unwrap(),
            BackendKind::Agent
        );
    }

    #[test]
    fn test_auto_emulated_needs_launcher() {
        let adapter = PlatformAdapter::with_capabilities(caps(false, false, false, true));
        let err = adapter.select(&options(BackendPreference::Auto)).unwrap_err();
        assert!(matches!(err, PtyError::BackendUnavailable(_)));

        let mut opts = options(BackendPreference::Auto);
        opts.emulated = Some(EmulatedLauncher::new(["launcher"]));
        assert_eq!(adapter.select(&opts).unwrap(), BackendKind::Emulated);
    }

    #[test]
    fn test_explicit_unavailable_backend_fails() {
        let adapter = PlatformAdapter::with_capabilities(caps(true, false, false, true));
        let err = adapter
            .select(&options(BackendPreference::ConsoleHost))
            .unwrap_err();
        assert!(matches!(
            err,
            PtyError::BackendUnavailable(BackendKind::ConsoleHost)
        ));
        assert_eq!(err.category(), crate::ErrorCategory::ChannelCreation);
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::PosixPty.to_string(), "posix-pty");
        assert_eq!(BackendKind::Emulated.to_string(), "emulated");
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_unix() {
        let caps = PlatformAdapter::detect().capabilities();
        assert!(caps.posix_pty);
        assert!(!caps.console_host);
    }
}
