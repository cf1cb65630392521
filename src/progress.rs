//! Progress reporting – status text and `(done, total)` counters.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

/// Receiver of run progress. Implementations must be cheap; they are called
/// from the export loop.
pub trait ProgressSink {
    fn status(&self, message: &str);
    fn progress(&self, done: usize, total: usize);
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn status(&self, message: &str) {
        info!("{message}");
    }

    fn progress(&self, done: usize, total: usize) {
        info!("progress {done}/{total}");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn status(&self, _message: &str) {}
    fn progress(&self, _done: usize, _total: usize) {}
}

/// Keeps every event, for callers that want to inspect a run afterwards.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub statuses: Mutex<Vec<String>>,
    pub counters: Mutex<Vec<(usize, usize)>>,
}

impl RecordingProgress {
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn counters(&self) -> Vec<(usize, usize)> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn status(&self, message: &str) {
        if let Ok(mut s) = self.statuses.lock() {
            s.push(message.to_string());
        }
    }

    fn progress(&self, done: usize, total: usize) {
        if let Ok(mut c) = self.counters.lock() {
            c.push((done, total));
        }
    }
}

/// Reports every `interval` records and always on the last one.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    interval: usize,
    done: usize,
    started: Instant,
}

impl<'a> ProgressReporter<'a> {
    pub const DEFAULT_INTERVAL: usize = 10;

    /// Starts a fresh run at `0 / total`.
    pub fn start(sink: &'a dyn ProgressSink, total: usize) -> Self {
        sink.progress(0, total);
        Self {
            sink,
            total,
            interval: Self::DEFAULT_INTERVAL,
            done: 0,
            started: Instant::now(),
        }
    }

    /// Mark one more record as processed.
    pub fn record_done(&mut self) {
        self.done = (self.done + 1).min(self.total);
        if self.done % self.interval != 0 && self.done != self.total {
            return;
        }
        self.sink.progress(self.done, self.total);
        let remaining = estimate_remaining(self.done, self.total, self.started.elapsed())
            .and_then(format_remaining);
        let message = match remaining {
            Some(eta) => format!(
                "Processed {}/{} records, about {eta} remaining",
                self.done, self.total
            ),
            None => format!("Processed {}/{} records", self.done, self.total),
        };
        self.sink.status(&message);
    }
}

/// Linear estimate of the time left from the average time per record.
pub fn estimate_remaining(done: usize, total: usize, elapsed: Duration) -> Option<Duration> {
    if done == 0 || done >= total {
        return None;
    }
    let per_record = elapsed.as_secs_f64() / done as f64;
    Some(Duration::from_secs_f64(per_record * (total - done) as f64))
}

/// `"Xm SSs"`, or `None` for ten seconds or less.
pub fn format_remaining(remaining: Duration) -> Option<String> {
    let secs = remaining.as_secs_f64().round() as u64;
    if secs <= 10 {
        return None;
    }
    Some(format!("{}m {:02}s", secs / 60, secs % 60))
}
