//! Image pull progress bar
//!
//! Fed from pull progress observers, which may run on the runtime's output
//! reader tasks; `indicatif` bars are cheap to clone and safe to update from
//! any thread.

use crate::ui::spinner::message_style;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use protoman_core::pull_progress::STATUS_ONLY;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Percentage bar that stays invisible until the first update and only moves forward
#[derive(Debug, Clone)]
pub struct PullBar {
    pb: ProgressBar,
}

impl PullBar {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new(100);
        pb.set_style(bar_style());
        pb.set_prefix(format!("Pulling {}", image));
        Self { pb }
    }

    /// Apply one `(percentage, status)` notification
    pub fn update(&self, percentage: f64, status: &str) {
        if percentage != STATUS_ONLY {
            let target = position(percentage);
            if target > self.pb.position() {
                self.pb.set_position(target);
            }
        }
        self.pb.set_message(status.to_string());
    }

    /// Whether any progress has been drawn
    pub fn started(&self) -> bool {
        self.pb.position() > 0 || !self.pb.message().is_empty()
    }

    pub fn finish(&self) {
        if self.started() && !self.pb.is_finished() {
            self.pb.set_style(message_style());
            self.pb
                .finish_with_message(style("Image pulled").green().to_string());
        } else {
            self.pb.finish_and_clear();
        }
    }

    pub fn abandon(&self) {
        self.pb.abandon();
    }
}

/// Bar position for a percentage, clamped to `0..=100`
fn position(percentage: f64) -> u64 {
    percentage.clamp(0.0, 100.0).round() as u64
}
