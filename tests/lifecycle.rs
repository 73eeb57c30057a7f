//! End-to-end lifecycle tests on the POSIX PTY backend.
#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ptyspawn::{
    BackendPreference, Capabilities, ErrorCategory, ExitStatus, LifecycleState, PlatformAdapter,
    PtyError, PtyProcess, PtyProcessBuilder, PtyReader, WindowSize,
};

fn adapter() -> PlatformAdapter {
    PlatformAdapter::detect()
}

fn sh(script: &str) -> PtyProcessBuilder {
    PtyProcessBuilder::new(["/bin/sh", "-c", script])
}

/// Reads a stream on a background thread so tests can wait for patterns.
struct Collector {
    state: Arc<(Mutex<(Vec<u8>, bool)>, Condvar)>,
}

impl Collector {
    fn start(reader: Arc<PtyReader>) -> Self {
        let state = Arc::new((Mutex::new((Vec::new(), false)), Condvar::new()));
        let shared = Arc::clone(&state);
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                let n = reader.as_ref().read(&mut buf).unwrap_or(0);
                let (lock, cvar) = &*shared;
                let mut guard = lock.lock().unwrap();
                if n == 0 {
                    guard.1 = true;
                    cvar.notify_all();
                    return;
                }
                guard.0.extend_from_slice(&buf[..n]);
                cvar.notify_all();
            }
        });
        Collector { state }
    }

    fn text(&self) -> String {
        let guard = self.state.0.lock().unwrap();
        String::from_utf8_lossy(&guard.0).replace("\r\n", "\n")
    }

    /// Waits until the output contains `needle`.
    fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        loop {
            if String::from_utf8_lossy(&guard.0).contains(needle) {
                return true;
            }
            let now = Instant::now();
            if guard.1 || now >= deadline {
                return false;
            }
            guard = cvar.wait_timeout(guard, deadline - now).unwrap().0;
        }
    }

    /// Waits until the stream reached end of file.
    fn wait_eof(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().unwrap();
        let (guard, _) = cvar.wait_timeout_while(guard, timeout, |s| !s.1).unwrap();
        guard.1
    }
}

#[test]
fn test_hello_is_read_exactly() {
    let process = PtyProcessBuilder::new(["/usr/bin/env", "printf", "HELLO\\n"])
        .start(&adapter())
        .expect("spawn");
    assert_eq!(process.backend(), ptyspawn::BackendKind::PosixPty);

    let mut output = String::new();
    process.reader().as_ref().read_to_string(&mut output).unwrap();
    assert_eq!(output.replace("\r\n", "\n"), "HELLO\n");
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_destroy_long_running_process() {
    let process = PtyProcessBuilder::new(["/bin/sleep", "15"])
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());

    thread::sleep(Duration::from_millis(500));
    let started = Instant::now();
    process.destroy();

    let status = process
        .wait_for_timeout(Duration::from_secs(5))
        .expect("destroyed process did not exit");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!status.success(), "unexpected status {status}");
    assert_eq!(status, ExitStatus::Signaled(15));
    assert!(output.wait_eof(Duration::from_secs(5)));
    assert_eq!(process.state(), LifecycleState::Exited);
}

#[test]
fn test_prompt_and_echo_dialogue() {
    let script = r#"
        while true; do
            printf 'Enter:'
            IFS= read -r line || exit 1
            if [ -z "$line" ]; then
                echo 'exit: empty line'
                exit 0
            fi
            echo "Read: $line"
        done
    "#;
    let process = sh(script).start(&adapter()).expect("spawn");
    let output = Collector::start(process.reader());
    let enter = [process.enter_key_code()];
    let writer = process.writer();

    assert!(output.wait_for("Enter:", Duration::from_secs(5)));
    writer.as_ref().write_all(b"Hi").unwrap();
    writer.as_ref().write_all(&enter).unwrap();
    assert!(output.wait_for("Read: Hi", Duration::from_secs(5)));
    writer.as_ref().write_all(&enter).unwrap();
    assert!(output.wait_for("exit: empty line", Duration::from_secs(5)));

    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert!(output.wait_eof(Duration::from_secs(5)));

    let text = output.text();
    let prompt = text.find("Enter:").unwrap();
    let echoed = text.find("Hi\n").unwrap();
    let read = text.find("Read: Hi").unwrap();
    let exit = text.find("exit: empty line").unwrap();
    assert!(prompt < echoed && echoed < read && read < exit, "out of order: {text:?}");
}

#[test]
fn test_destroy_kills_process_ignoring_terminate() {
    let process = sh("trap '' TERM; echo ready; while :; do sleep 1; done")
        .destroy_grace(Duration::from_millis(300))
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());
    assert!(output.wait_for("ready", Duration::from_secs(5)));

    process.destroy();
    // Still alive after the graceful signal.
    assert!(process.wait_for_timeout(Duration::from_millis(100)).is_none());
    let status = process
        .wait_for_timeout(Duration::from_secs(5))
        .expect("escalation did not kill the process");
    assert_eq!(status, ExitStatus::Signaled(9));
}

#[test]
fn test_destroy_and_close_are_idempotent() {
    let process = PtyProcessBuilder::new(["/bin/sleep", "15"])
        .start(&adapter())
        .expect("spawn");
    process.destroy();
    process.destroy();
    let status = process.wait_for_timeout(Duration::from_secs(5)).expect("exit");
    process.destroy();
    assert_eq!(process.exit_value().unwrap(), status);

    process.close();
    process.close();
    let mut buf = [0u8; 16];
    assert_eq!(process.reader().as_ref().read(&mut buf).unwrap(), 0);
    let err = process.writer().as_ref().write(b"late").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[test]
fn test_destroy_after_natural_exit_keeps_status() {
    let process = sh("exit 5").start(&adapter()).expect("spawn");
    assert_eq!(process.wait_for(), ExitStatus::Exited(5));
    process.destroy();
    assert!(process.signal(ptyspawn::Signal::Kill).is_ok());
    assert_eq!(process.exit_value().unwrap(), ExitStatus::Exited(5));
}

#[test]
fn test_resize_is_seen_by_child() {
    let process = sh("IFS= read -r go; stty size")
        .initial_size(WindowSize::new(100, 30))
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());

    assert_eq!(process.window_size().unwrap(), WindowSize::new(100, 30));
    assert!(process.resize(WindowSize::with_pixels(80, 24, 0, 0)));
    assert_eq!(process.window_size().unwrap(), WindowSize::new(80, 24));

    process.writer().as_ref().write_all(b"go\r").unwrap();
    assert!(output.wait_for("24 80", Duration::from_secs(5)), "{:?}", output.text());
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_blocked_read_released_by_close() {
    let process = PtyProcessBuilder::new(["/bin/sleep", "15"])
        .start(&adapter())
        .expect("spawn");
    let reader = process.reader();
    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 16];
        let _ = tx.send(reader.as_ref().read(&mut buf).map_err(|e| e.kind()));
    });

    thread::sleep(Duration::from_millis(100));
    process.close();
    let result = rx.recv_timeout(Duration::from_secs(2)).expect("read still blocked");
    assert_eq!(result, Ok(0));
    process.destroy();
    process.wait_for();
}

#[test]
fn test_read_ends_at_exit_despite_background_holder() {
    // The backgrounded sleep keeps the terminal open after the shell exits.
    let process = sh("sleep 10 & echo bye; exit 0")
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());

    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert!(output.wait_eof(Duration::from_secs(3)), "read did not end at exit");
    assert!(output.text().contains("bye"));
}

#[test]
fn test_wait_timeout_while_running() {
    let process = PtyProcessBuilder::new(["/bin/sleep", "15"])
        .start(&adapter())
        .expect("spawn");
    let started = Instant::now();
    assert!(process.wait_for_timeout(Duration::from_millis(100)).is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(process.exit_value(), Err(PtyError::NotExited)));
    process.destroy();
    assert!(process.wait_for_timeout(Duration::from_secs(5)).is_some());
}

#[test]
fn test_failed_exec_step_reports_distinguished_code() {
    let process = PtyProcessBuilder::new(["/bin/sh", "-c", "exit 0"])
        .directory("/definitely/not/a/directory")
        .start(&adapter())
        .expect("spawn");
    assert_eq!(
        process.wait_for(),
        ExitStatus::Exited(ptyspawn::unix::EXEC_FAILED_EXIT_CODE)
    );
}

#[test]
fn test_environment_and_directory() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    let process = sh("echo \"$GREETING\"; pwd -P")
        .env("GREETING", "hello there")
        .directory(dir.path())
        .start(&adapter())
        .expect("spawn");

    let mut output = String::new();
    process.reader().as_ref().read_to_string(&mut output).unwrap();
    let lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    assert_eq!(lines, ["hello there", expected.to_str().unwrap()]);
    process.wait_for();
}

#[cfg(target_os = "linux")]
#[test]
fn test_working_directory_follows_child() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let expected = dir.path().join("sub").canonicalize().unwrap();
    let process = sh("cd sub; echo ready; read x")
        .directory(dir.path())
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());
    assert!(output.wait_for("ready", Duration::from_secs(5)));

    assert_eq!(process.working_directory().unwrap(), expected);

    process.writer().as_ref().write_all(b"\n").unwrap();
    process.wait_for();
    assert!(matches!(
        process.working_directory(),
        Err(PtyError::AlreadyExited)
    ));
}

#[test]
fn test_console_process_count_is_unsupported() {
    let process = sh("true").start(&adapter()).expect("spawn");
    let err = process.console_process_count().unwrap_err();
    assert!(matches!(
        err,
        PtyError::QueryUnsupported {
            backend: ptyspawn::BackendKind::PosixPty,
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::IllegalState);
    process.wait_for();
}

#[test]
fn test_env_clear_keeps_default_term() {
    let process = PtyProcessBuilder::new(["/bin/sh", "-c", "echo \"${HOME:-unset} $TERM\""])
        .env_clear()
        .start(&adapter())
        .expect("spawn");
    let mut output = String::new();
    process.reader().as_ref().read_to_string(&mut output).unwrap();
    assert_eq!(output.trim_end(), "unset xterm-256color");
    process.wait_for();
}

#[test]
fn test_console_mode_disables_echo() {
    let process = sh("IFS= read -r line; echo \"got $line\"")
        .console(true)
        .start(&adapter())
        .expect("spawn");
    let output = Collector::start(process.reader());
    process.writer().as_ref().write_all(b"secret\n").unwrap();

    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert!(output.wait_eof(Duration::from_secs(3)));
    assert_eq!(output.text().matches("secret").count(), 1, "{:?}", output.text());
}

#[test]
fn test_console_mode_redirect_merges_stderr() {
    let process = sh("echo to-err >&2")
        .console(true)
        .redirect_error_stream(true)
        .start(&adapter())
        .expect("spawn");
    let mut output = String::new();
    process.reader().as_ref().read_to_string(&mut output).unwrap();
    assert!(output.contains("to-err"));

    let mut errors = String::new();
    process.error_reader().as_ref().read_to_string(&mut errors).unwrap();
    assert!(errors.is_empty());
    process.wait_for();
}

#[test]
fn test_preserved_output_readable_after_exit() {
    let process = sh("printf 'late output'")
        .preserve_output_after_exit(true)
        .start(&adapter())
        .expect("spawn");
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));

    let output = Collector::start(process.reader());
    assert!(output.wait_for("late output", Duration::from_secs(3)));
    process.close();
    assert!(output.wait_eof(Duration::from_secs(3)));
}

#[test]
fn test_many_readers_see_one_stream() {
    let process = sh("echo one").start(&adapter()).expect("spawn");
    let a = process.reader();
    let b = process.reader();
    assert!(Arc::ptr_eq(&a, &b));
    let mut output = String::new();
    b.as_ref().read_to_string(&mut output).unwrap();
    assert!(output.contains("one"));
    process.wait_for();
}

#[test]
fn test_unavailable_backend_is_rejected() {
    let adapter = PlatformAdapter::with_capabilities(Capabilities {
        posix_pty: false,
        console_host: false,
        agent: false,
        emulated: true,
    });
    let err = PtyProcessBuilder::new(["/bin/true"]).start(&adapter).unwrap_err();
    assert!(matches!(err, PtyError::BackendUnavailable(_)));
    assert_eq!(err.category(), ErrorCategory::ChannelCreation);

    let err = PtyProcessBuilder::new(["/bin/true"])
        .backend(BackendPreference::ConsoleHost)
        .start(&PlatformAdapter::detect())
        .unwrap_err();
    assert!(matches!(
        err,
        PtyError::BackendUnavailable(ptyspawn::BackendKind::ConsoleHost)
    ));
}

#[test]
fn test_dropping_handle_sends_no_signal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");
    let script = format!("trap '' HUP; echo ready; sleep 0.3; : > '{}'", marker.display());
    let process = sh(&script).start(&adapter()).expect("spawn");
    let output = Collector::start(process.reader());
    // The trap is installed once "ready" was printed.
    assert!(output.wait_for("ready", Duration::from_secs(5)));
    let latch = process.exit_latch();
    drop(process);

    let status = latch.wait_timeout(Duration::from_secs(5)).expect("exit");
    assert_eq!(status, ExitStatus::Exited(0));
    assert!(marker.exists());
}

#[test]
fn test_dropping_handle_hangs_up_terminal() {
    let process = sh("echo ready; sleep 15").start(&adapter()).expect("spawn");
    let output = Collector::start(process.reader());
    assert!(output.wait_for("ready", Duration::from_secs(5)));
    let latch = process.exit_latch();
    drop(process);

    let status = latch.wait_timeout(Duration::from_secs(5)).expect("exit");
    assert_eq!(status, ExitStatus::Signaled(1));
}

#[test]
fn test_start_reports_missing_program() {
    let err = PtyProcess::start(
        &adapter(),
        PtyProcessBuilder::new(["no-such-program-ptyspawn"]).into_options(),
    )
    .unwrap_err();
    assert!(matches!(err, PtyError::ExecutableNotFound(_)));
}
