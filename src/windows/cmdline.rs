//! Command line, environment block and executable lookup for
//! `CreateProcessW` and the winpty agent.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::options::SpawnOptions;

/// The child's environment with Windows' case-insensitive keys.
pub(crate) struct Environment {
    /// Upper-cased key to the key as spelled by its last writer, and value
    vars: BTreeMap<OsString, (OsString, OsString)>,
}

fn fold(key: &OsStr) -> OsString {
    key.to_string_lossy().to_uppercase().into()
}

impl Environment {
    pub(crate) fn from_options(options: &SpawnOptions) -> Self {
        let mut vars = BTreeMap::new();
        if options.inherit_environment {
            for (key, value) in env::vars_os() {
                vars.insert(fold(&key), (key, value));
            }
        }
        for (key, value) in &options.environment {
            let key = OsString::from(key);
            vars.insert(fold(&key), (key, value.into()));
        }
        Environment { vars }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .get(&fold(OsStr::new(key)))
            .map(|(_, value)| value.as_os_str())
    }

    /// `KEY=value\0...\0\0`, sorted the way `CreateProcessW` expects.
    pub(crate) fn block(&self) -> Vec<u16> {
        let mut block = Vec::new();
        for (key, value) in self.vars.values() {
            block.extend(key.encode_wide());
            block.push(b'=' as u16);
            block.extend(value.encode_wide());
            block.push(0);
        }
        if self.vars.is_empty() {
            block.push(0);
        }
        block.push(0);
        block
    }
}

/// Resolves `name` the way a shell would: names with a directory part are
/// checked as given (relative to `directory`); bare names are searched in
/// `path`, trying each `PATHEXT` extension when the name has none.
pub fn find_executable(
    name: &str,
    path: Option<&OsStr>,
    pathext: Option<&OsStr>,
    directory: Option<&Path>,
) -> Option<PathBuf> {
    let extensions: Vec<String> = pathext
        .unwrap_or(OsStr::new(".COM;.EXE;.BAT;.CMD"))
        .to_string_lossy()
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(str::to_owned)
        .collect();
    let candidates = |base: PathBuf| {
        let mut found = vec![base.clone()];
        if base.extension().is_none() {
            for ext in &extensions {
                let mut with_ext = base.clone().into_os_string();
                with_ext.push(ext);
                found.push(PathBuf::from(with_ext));
            }
        }
        found
    };

    let given = Path::new(name);
    if given.is_absolute() || name.contains(['\\', '/']) {
        let base = match directory {
            Some(dir) if given.is_relative() => dir.join(given),
            _ => given.to_path_buf(),
        };
        return candidates(base).into_iter().find(|p| p.is_file());
    }

    env::split_paths(path?)
        .flat_map(|dir| candidates(dir.join(name)))
        .find(|p| p.is_file())
}

/// Quotes one argument so `CommandLineToArgvW` reads it back unchanged.
pub(crate) fn append_quoted(arg: &OsStr, cmdline: &mut Vec<u16>) {
    let needs_quotes = arg.is_empty()
        || arg
            .encode_wide()
            .any(|c| matches!(c, 0x20 | 0x09 | 0x0a | 0x0b | 0x22));
    if !needs_quotes {
        cmdline.extend(arg.encode_wide());
        return;
    }

    cmdline.push('"' as u16);
    let arg: Vec<u16> = arg.encode_wide().collect();
    let mut i = 0;
    while i < arg.len() {
        let mut backslashes = 0;
        while i < arg.len() && arg[i] == '\\' as u16 {
            i += 1;
            backslashes += 1;
        }

        if i == arg.len() {
            // Escape them all; the closing quote follows.
            cmdline.extend(std::iter::repeat('\\' as u16).take(backslashes * 2));
            break;
        } else if arg[i] == '"' as u16 {
            cmdline.extend(std::iter::repeat('\\' as u16).take(backslashes * 2 + 1));
        } else {
            cmdline.extend(std::iter::repeat('\\' as u16).take(backslashes));
        }
        cmdline.push(arg[i]);
        i += 1;
    }
    cmdline.push('"' as u16);
}

/// NUL-terminated command line: the resolved program followed by the
/// remaining arguments of `command`.
pub(crate) fn command_line(program: &Path, command: &[String]) -> Vec<u16> {
    let mut cmdline = Vec::new();
    append_quoted(program.as_os_str(), &mut cmdline);
    for arg in command.iter().skip(1) {
        cmdline.push(' ' as u16);
        append_quoted(OsStr::new(arg), &mut cmdline);
    }
    cmdline.push(0);
    cmdline
}

/// Absolute working directory for the child, NUL-terminated.
pub(crate) fn working_directory(options: &SpawnOptions) -> Option<Vec<u16>> {
    let dir = options.directory.as_ref()?;
    let dir = if dir.is_relative() {
        env::current_dir().map(|cwd| cwd.join(dir)).unwrap_or_else(|_| dir.clone())
    } else {
        dir.clone()
    };
    Some(super::wide(dir))
}
