//! ptyspawn-run - run a command on a pseudo-terminal and relay its I/O
//!
//! Copies stdin to the child and the child's output to stdout, then exits
//! with the child's exit code. Handy for trying backends by hand.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use ptyspawn::{
    BackendPreference, ExitStatus, PlatformAdapter, PtyProcessBuilder, SpawnOptions, WindowSize,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_help();
            return ExitCode::SUCCESS;
        },
        Err(message) => {
            eprintln!("ptyspawn-run: {message}");
            return ExitCode::FAILURE;
        },
    };

    let adapter = PlatformAdapter::detect();
    tracing::debug!(capabilities = ?adapter.capabilities(), "detected backends");

    let process = match PtyProcessBuilder::from_options(options).start(&adapter) {
        Ok(process) => process,
        Err(e) => {
            eprintln!("Failed to start: {e}");
            return ExitCode::FAILURE;
        },
    };
    tracing::info!(pid = process.pid(), backend = %process.backend(), "child started");

    // Detached: a blocked stdin read must not keep us alive.
    let writer = process.writer();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.as_ref().write_all(&buf[..n]).is_err() {
                        break;
                    }
                },
            }
        }
    });

    let error_reader = process.error_reader();
    let stderr_thread = thread::spawn(move || {
        let _ = io::copy(&mut error_reader.as_ref(), &mut io::stderr());
    });

    let reader = process.reader();
    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match reader.as_ref().read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = stdout.flush();
            },
            Err(e) => {
                tracing::error!("Read error: {}", e);
                break;
            },
        }
    }
    let _ = stderr_thread.join();

    let status = process.wait_for();
    tracing::info!(%status, "child exited");
    match status {
        ExitStatus::Exited(0) => ExitCode::SUCCESS,
        other => ExitCode::from(other.code().unwrap_or(1).clamp(1, 255) as u8),
    }
}

/// `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<SpawnOptions>, String> {
    let mut options = SpawnOptions::default();
    let mut cols = None;
    let mut rows = None;
    let mut command = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| format!("{} needs a value", args[i]))
        };
        match args[i].as_str() {
            "-o" | "--options" => {
                let path = PathBuf::from(value(i)?);
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
                let command = std::mem::take(&mut options.command);
                options = serde_json::from_str(&text)
                    .map_err(|e| format!("invalid options in {}: {e}", path.display()))?;
                if !command.is_empty() {
                    options.command = command;
                }
                i += 1;
            },
            "-c" | "--cols" => {
                cols = Some(value(i)?.parse::<u16>().map_err(|e| format!("--cols: {e}"))?);
                i += 1;
            },
            "-r" | "--rows" => {
                rows = Some(value(i)?.parse::<u16>().map_err(|e| format!("--rows: {e}"))?);
                i += 1;
            },
            "-b" | "--backend" => {
                let name = value(i)?;
                options.backend = serde_json::from_value(serde_json::Value::String(name.clone()))
                    .map_err(|_| format!("unknown backend {name:?}"))?;
                i += 1;
            },
            "--console" => options.console = true,
            "-h" | "--help" => return Ok(None),
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            },
            other if other.starts_with('-') => return Err(format!("unknown option {other}")),
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            },
        }
        i += 1;
    }

    if !command.is_empty() {
        options.command = command;
    }
    if options.command.is_empty() {
        options.command = vec![default_shell()];
    }
    if cols.is_some() || rows.is_some() {
        let current = options.initial_size.unwrap_or(WindowSize::new(80, 24));
        options.initial_size = Some(WindowSize::new(
            cols.unwrap_or(current.cols),
            rows.unwrap_or(current.rows),
        ));
    }
    if options.backend == BackendPreference::Emulated && options.emulated.is_none() {
        return Err("the emulated backend needs a launcher in --options".into());
    }
    Ok(Some(options))
}

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".into())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into())
    }
}

fn print_help() {
    println!("ptyspawn-run - run a command on a pseudo-terminal");
    println!();
    println!("Usage: ptyspawn-run [OPTIONS] [--] [COMMAND [ARGS...]]");
    println!();
    println!("Options:");
    println!("  -o, --options <FILE>  Spawn options as JSON");
    println!("  -c, --cols <N>        Terminal width");
    println!("  -r, --rows <N>        Terminal height");
    println!("  -b, --backend <NAME>  auto, posix-pty, console-host, agent or emulated");
    println!("      --console         Keep stderr separate from the terminal output");
    println!("  -h, --help            Show this help message");
    println!();
    println!("Without a command the user's shell is started. Set RUST_LOG=debug");
    println!("to see lifecycle events.");
}
