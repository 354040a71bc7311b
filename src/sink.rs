//! Result and progress reporting.

use indicatif::ProgressBar;
use tracing::{error, info};

/// Where the session reports progress and its final outcome. The CLI
/// uses a progress bar; tests use a recording sink.
pub trait ResultSink: Send + Sync {
    /// Percent complete, 0..=100, reported on increase only.
    fn report_progress(&self, percent: u32);
    fn report_success(&self, total_bytes: u32);
    fn report_failure(&self, context: &str, message: &str);
}

/// Terminal progress bar over the 0..=100 percent range.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        ProgressBarSink {
            bar: ProgressBar::new(100),
        }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSink for ProgressBarSink {
    fn report_progress(&self, percent: u32) {
        self.bar.set_position(percent as u64);
    }

    fn report_success(&self, total_bytes: u32) {
        self.bar.finish();
        info!(total_bytes, "firmware update succeeded");
    }

    fn report_failure(&self, context: &str, message: &str) {
        self.bar.abandon();
        error!(context, message, "firmware update failed");
    }
}
