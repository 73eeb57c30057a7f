//! Read-activity tracking used to drain output before teardown.
//!
//! The console-host and agent backends lose any output still sitting in
//! their pipes once the pseudo console or agent connection is released.
//! After the child exits, the watcher therefore waits until every stream
//! the caller opened has been read at least once and the reads have gone
//! quiet. This is best effort and always bounded.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How long to wait for the first read of a stream after exit.
pub const FIRST_READ_TIMEOUT: Duration = Duration::from_millis(2000);
/// Reads further apart than this count as "quiet".
pub const QUIET_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound for the whole drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Default)]
struct Counts {
    tracked: bool,
    reads: u64,
}

/// Read counter for one stream.
#[derive(Debug, Default)]
pub struct ReadActivity {
    counts: Mutex<Counts>,
    changed: Condvar,
}

impl ReadActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the stream as handed out to a caller; untracked streams are
    /// not waited for.
    pub fn track(&self) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked = true;
    }

    pub fn is_tracked(&self) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked
    }

    /// Records one read call.
    pub fn record_read(&self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.reads += 1;
        drop(counts);
        self.changed.notify_all();
    }

    pub fn reads(&self) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reads
    }

    /// Waits until the stream has been read at least once and then stayed
    /// quiet for [`QUIET_INTERVAL`]. Returns `false` if nobody read the
    /// stream within `first_read`.
    pub fn await_quiet(&self, first_read: Duration, quiet: Duration, limit: Duration) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if counts.reads == 0 {
            let (guard, _) = self
                .changed
                .wait_timeout_while(counts, first_read, |c| c.reads == 0)
                .unwrap_or_else(PoisonError::into_inner);
            counts = guard;
            if counts.reads == 0 {
                return false;
            }
        }

        let start = Instant::now();
        loop {
            let seen = counts.reads;
            let (guard, timeout) = self
                .changed
                .wait_timeout_while(counts, quiet, |c| c.reads == seen)
                .unwrap_or_else(PoisonError::into_inner);
            counts = guard;
            if timeout.timed_out() || start.elapsed() >= limit {
                return true;
            }
        }
    }
}

/// Drains every tracked stream in `streams` with the default timings.
///
/// Returns the number of tracked streams nobody read.
pub fn await_output_read<'a>(streams: impl IntoIterator<Item = &'a ReadActivity>) -> usize {
    let mut unread = 0;
    for activity in streams {
        if !activity.is_tracked() {
            continue;
        }
        if !activity.await_quiet(FIRST_READ_TIMEOUT, QUIET_INTERVAL, DRAIN_TIMEOUT) {
            unread += 1;
        }
    }
    unread
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unread_stream_times_out() {
        let activity = ReadActivity::new();
        let start = Instant::now();
        let read = activity.await_quiet(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        assert!(!read);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_quiet_after_reads_stop() {
        let activity = Arc::new(ReadActivity::new());
        let reader = {
            let activity = Arc::clone(&activity);
            thread::spawn(move || {
                for _ in 0..5 {
                    activity.record_read();
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let read = activity.await_quiet(
            Duration::from_millis(1000),
            Duration::from_millis(50),
            Duration::from_millis(1000),
        );
        reader.join().unwrap();
        assert!(read);
        assert_eq!(activity.reads(), 5);
    }

    #[test]
    fn test_continuous_reads_are_bounded() {
        let activity = Arc::new(ReadActivity::new());
        activity.record_read();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let activity = Arc::clone(&activity);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    activity.record_read();
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };

        let start = Instant::now();
        activity.await_quiet(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        let elapsed = start.elapsed();
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        reader.join().unwrap();
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn test_untracked_streams_are_skipped() {
        let tracked = ReadActivity::new();
        tracked.track();
        let untracked = ReadActivity::new();
        tracked.record_read();
        assert_eq!(await_output_read([&tracked, &untracked]), 0);
    }
}
