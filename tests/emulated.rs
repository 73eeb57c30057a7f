//! Pipe-emulated backend driven by a shell launcher over FIFOs.
#![cfg(unix)]

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use ptyspawn::{
    BackendKind, BackendPreference, EmulatedLauncher, ErrorCategory, ExitStatus, PlatformAdapter,
    PtyError, PtyProcessBuilder, WindowSize,
};

/// Attaches the program's streams to the three pipes, then runs it.
fn shell_launcher() -> EmulatedLauncher {
    EmulatedLauncher::new([
        "/bin/sh",
        "-c",
        "exec <\"$1\" >\"$2\" 2>\"$3\"; shift 3; exec \"$@\"",
        "launcher",
    ])
    .connect_timeout(Duration::from_secs(5))
}

fn emulated(script: &str) -> PtyProcessBuilder {
    PtyProcessBuilder::new(["/bin/sh", "-c", script])
        .backend(BackendPreference::Emulated)
        .emulated(shell_launcher())
}

fn read_all(reader: &ptyspawn::PtyReader) -> String {
    let mut text = String::new();
    let mut reader = reader;
    reader.read_to_string(&mut text).unwrap();
    text
}

#[test]
fn test_output_is_relayed() {
    let process = emulated("echo hi").start(&PlatformAdapter::detect()).expect("spawn");
    assert_eq!(process.backend(), BackendKind::Emulated);
    assert_eq!(read_all(&process.reader()), "hi\n");
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_error_stream_is_separate() {
    let process = emulated("echo out; echo err >&2; exit 4")
        .start(&PlatformAdapter::detect())
        .expect("spawn");
    let errors = process.error_reader();
    let error_thread = std::thread::spawn(move || read_all(&errors));

    assert_eq!(read_all(&process.reader()), "out\n");
    assert_eq!(error_thread.join().unwrap(), "err\n");
    assert_eq!(process.wait_for(), ExitStatus::Exited(4));
}

#[test]
fn test_input_reaches_program() {
    let process = emulated("IFS= read -r line; echo \"got $line\"")
        .start(&PlatformAdapter::detect())
        .expect("spawn");
    assert_eq!(process.enter_key_code(), b'\n');

    let writer = process.writer();
    writer.as_ref().write_all(b"x").unwrap();
    writer.as_ref().write_all(&[process.enter_key_code()]).unwrap();

    assert_eq!(read_all(&process.reader()), "got x\n");
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_window_size_is_unsupported() {
    let process = emulated("sleep 5").start(&PlatformAdapter::detect()).expect("spawn");
    assert!(!process.resize(WindowSize::new(120, 40)));
    let err = process.window_size().unwrap_err();
    assert!(matches!(err, PtyError::WindowSizeUnsupported(BackendKind::Emulated)));
    assert_eq!(err.category(), ErrorCategory::Resize);

    process.destroy();
    let status = process.wait_for_timeout(Duration::from_secs(5)).expect("exit");
    assert_eq!(status, ExitStatus::Signaled(15));
}

#[test]
fn test_console_queries_are_unsupported() {
    let process = emulated("sleep 5").start(&PlatformAdapter::detect()).expect("spawn");
    let err = process.working_directory().unwrap_err();
    assert!(matches!(
        err,
        PtyError::QueryUnsupported {
            backend: BackendKind::Emulated,
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::IllegalState);
    assert!(process.console_process_count().is_err());
    process.destroy();
    process.wait_for_timeout(Duration::from_secs(5)).expect("exit");
}

#[test]
fn test_read_ends_after_destroy() {
    let process = emulated("sleep 15").start(&PlatformAdapter::detect()).expect("spawn");
    let reader = process.reader();
    let started = Instant::now();
    process.destroy();
    assert_eq!(read_all(&reader), "");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.wait_for_timeout(Duration::from_secs(5)).is_some());
}

#[test]
fn test_launcher_never_connecting_times_out() {
    let started = Instant::now();
    let err = PtyProcessBuilder::new(["/bin/true"])
        .backend(BackendPreference::Emulated)
        .emulated(
            EmulatedLauncher::new(["/bin/sh", "-c", "sleep 5", "launcher"])
                .connect_timeout(Duration::from_millis(200)),
        )
        .start(&PlatformAdapter::detect())
        .unwrap_err();
    assert!(matches!(err, PtyError::ConnectTimeout { .. }), "{err}");
    assert_eq!(err.category(), ErrorCategory::ConnectTimeout);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_launcher_exiting_early_fails_launch() {
    let err = PtyProcessBuilder::new(["/bin/true"])
        .backend(BackendPreference::Emulated)
        .emulated(EmulatedLauncher::new(["/bin/sh", "-c", "exit 3", "launcher"]))
        .start(&PlatformAdapter::detect())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Launch, "{err}");
}

#[test]
fn test_missing_launcher() {
    let err = PtyProcessBuilder::new(["/bin/true"])
        .backend(BackendPreference::Emulated)
        .emulated(EmulatedLauncher::new(["/no/such/ptyspawn-launcher"]))
        .start(&PlatformAdapter::detect())
        .unwrap_err();
    assert!(matches!(err, PtyError::ExecutableNotFound(_)));
}

#[test]
fn test_emulated_without_launcher_is_unavailable() {
    let err = PtyProcessBuilder::new(["/bin/true"])
        .backend(BackendPreference::Emulated)
        .start(&PlatformAdapter::detect())
        .unwrap_err();
    assert!(matches!(err, PtyError::BackendUnavailable(BackendKind::Emulated)));
}
