//! Descriptor accounting across many process lifecycles.
//!
//! Kept in its own test binary so no other test opens descriptors while
//! this one counts.
#![cfg(target_os = "linux")]

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use ptyspawn::{PlatformAdapter, PtyProcessBuilder};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Watcher threads release their descriptors shortly after exit.
fn settled_count(baseline: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let count = open_descriptors();
        if count <= baseline || Instant::now() >= deadline {
            return count;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_no_descriptor_leak_over_many_lifecycles() {
    let adapter = PlatformAdapter::detect();

    // Warm up lazily opened process-wide descriptors.
    let warmup = PtyProcessBuilder::new(["/bin/true"]).start(&adapter).unwrap();
    warmup.wait_for();
    drop(warmup);
    thread::sleep(Duration::from_millis(200));
    let baseline = open_descriptors();

    for i in 0..50 {
        let process = PtyProcessBuilder::new(["/bin/sh", "-c", "echo leak-check"])
            .console(i % 2 == 0)
            .start(&adapter)
            .unwrap();
        let mut output = String::new();
        process.reader().as_ref().read_to_string(&mut output).unwrap();
        process.wait_for();
        process.close();
    }

    for _ in 0..10 {
        let process = PtyProcessBuilder::new(["/bin/sleep", "15"]).start(&adapter).unwrap();
        process.destroy();
        process.wait_for();
    }

    let after = settled_count(baseline);
    assert!(after <= baseline, "descriptors leaked: {baseline} before, {after} after");
}
