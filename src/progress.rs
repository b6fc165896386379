//! Progress tracking and display for objsync

use crate::types::{ActionKind, ActionOutcome, Outcome, SyncReport};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Progress tracker for sync operations.
///
/// Shared between the scheduler and its workers; every method takes `&self`.
pub struct ProgressTracker {
    /// Multi-progress container
    multi: MultiProgress,
    /// Actions settled so far
    actions: ProgressBar,
    /// Stats line
    stats: ProgressBar,
    bytes: AtomicU64,
    failed: AtomicU64,
    /// Whether progress is enabled
    enabled: bool,
}

impl ProgressTracker {
    /// Create a new progress tracker
    pub fn new(enabled: bool) -> Self {
        let multi = MultiProgress::new();

        let actions = if enabled {
            let pb = multi.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} actions {msg}")
            {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::hidden()
        };

        let stats = if enabled {
            let pb = multi.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::default_spinner().template("  {msg}") {
                pb.set_style(style);
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        Self {
            multi,
            actions,
            stats,
            bytes: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enabled,
        }
    }

    /// Show the path a worker has started on
    pub fn start(&self, kind: ActionKind, path: &str) {
        self.actions
            .set_message(format!("{} {}", kind, truncate_filename(path, 40)));
    }

    /// Count a settled action
    pub fn record(&self, outcome: &ActionOutcome) {
        let bytes = self.bytes.fetch_add(outcome.bytes, Ordering::Relaxed) + outcome.bytes;
        let failed = if matches!(outcome.outcome, Outcome::Failed(_)) {
            self.failed.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.failed.load(Ordering::Relaxed)
        };

        self.actions.inc(1);
        self.stats.set_message(format!(
            "Transferred: {} | Failed: {}",
            format_size(bytes),
            failed
        ));
    }

    /// Finish all progress bars
    pub fn finish(&self) {
        self.actions.finish_and_clear();
        self.stats.finish_and_clear();
    }

    /// Print a message (works with progress bars)
    pub fn println(&self, msg: &str) {
        if self.enabled {
            self.multi.println(msg).ok();
        } else {
            println!("{}", msg);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Truncate a filename for display
fn truncate_filename(name: &str, max_len: usize) -> String {
    let count = name.chars().count();
    if count <= max_len {
        name.to_string()
    } else {
        let tail: String = name.chars().skip(count - max_len + 3).collect();
        format!("...{}", tail)
    }
}

/// Format a file size for display
pub fn format_size(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format a duration for display
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Format transfer rate for display
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec))
}

/// Print a dry-run summary
pub fn print_dry_run_summary(report: &SyncReport) {
    println!("\n=== Dry Run Summary ===");
    println!("Would copy:   {}", report.applied_of(ActionKind::Copy));
    println!("Would delete: {}", report.applied_of(ActionKind::Delete));
    println!("Unchanged:    {}", report.skipped());
    println!("Failed:       {}", report.failed());
    print_failures(report);
}

/// Print a final summary after sync
pub fn print_summary(report: &SyncReport) {
    println!("\n=== Sync Complete ===");
    println!("Duration:          {}", format_duration(report.duration.as_secs_f64()));
    println!("Objects copied:    {}", report.applied_of(ActionKind::Copy));
    println!("Objects deleted:   {}", report.applied_of(ActionKind::Delete));
    println!("Objects skipped:   {}", report.skipped());
    println!("Errors:            {}", report.failed());
    println!();
    println!("Bytes transferred: {}", format_size(report.bytes_transferred()));
    println!("Transfer rate:     {}", format_rate(report.transfer_rate()));
    print_failures(report);
}

fn print_failures(report: &SyncReport) {
    if !report.has_failures() {
        return;
    }

    println!();
    for failure in report.failures() {
        if let Some(err) = failure.error() {
            println!("FAILED {} {}: {}", failure.kind, failure.path, err);
        }
    }
    if let Some(path) = &report.halted_by {
        println!("Stopped after the failure of {}", path);
    }
    if report.cancelled {
        println!("Interrupted before all actions were started");
    }
    for err in &report.fatal {
        println!("FATAL {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_filename() {
        assert_eq!(truncate_filename("short.txt", 20), "short.txt");
        let long = "a/very/long/path/to/some/file.bin";
        let cut = truncate_filename(long, 12);
        assert_eq!(cut.chars().count(), 12);
        assert!(cut.starts_with("...") && cut.ends_with("file.bin"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5.0), "5.0s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(7200.0), "2.0h");
    }

    #[test]
    fn test_hidden_tracker_records() {
        let tracker = ProgressTracker::new(false);
        tracker.record(&ActionOutcome::applied("a", ActionKind::Copy, 10));
        tracker.record(&ActionOutcome::applied("b", ActionKind::Copy, 5));
        assert_eq!(tracker.bytes.load(Ordering::Relaxed), 15);
    }
}
