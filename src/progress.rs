use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossterm::style::Stylize;

const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Default)]
pub struct ConsoleProgress {
    counter: AtomicUsize,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut stderr = io::stderr().lock();
        let line = match event.elapsed {
            Some(elapsed) => format!(
                "{} {} {}",
                format!("[{index:>4}]").dark_grey(),
                event.message,
                format!("({:.1}s)", elapsed.as_secs_f64()).dark_grey()
            ),
            None => format!("{} {}", format!("[{index:>4}]").dark_grey(), event.message),
        };
        let _ = writeln!(stderr, "{line}");
    }
}

/// Byte counter for one streamed transfer; reports at most every 500 ms.
#[derive(Debug)]
pub struct TransferTracker {
    label: String,
    total: Option<u64>,
    received: u64,
    started: Instant,
    last_report: Instant,
}

impl TransferTracker {
    pub fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total: total.filter(|total| *total > 0),
            received: 0,
            started: now,
            last_report: now,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn advance(&mut self, bytes: u64, sink: &dyn ProgressSink) {
        self.received = self.received.saturating_add(bytes);
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            sink.event(ProgressEvent::message(self.status_line()));
        }
    }

    pub fn finish(&self, sink: &dyn ProgressSink) {
        sink.event(ProgressEvent {
            message: format!("{} done, {}", self.label, bytes_to_human(self.received)),
            elapsed: Some(self.started.elapsed()),
        });
    }

    fn status_line(&self) -> String {
        let speed = format_speed(self.received, self.started.elapsed());
        match self.total {
            Some(total) => format!(
                "{} {:.1}% {}/{} {speed}",
                self.label,
                self.received as f64 * 100.0 / total as f64,
                bytes_to_human(self.received),
                bytes_to_human(total)
            ),
            None => format!("{} {} {speed}", self.label, bytes_to_human(self.received)),
        }
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

pub fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    if seconds <= f64::EPSILON {
        return "-- /s".to_string();
    }
    format!("{}/s", bytes_to_human((bytes as f64 / seconds) as u64))
}
