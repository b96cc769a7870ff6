//! Progress reporting for TTY and non-TTY environments
//!
//! TTY mode: one indicatif line per shard plus stage status spinners.
//! Non-TTY mode: hidden bars, log lines are the only progress indicator.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

fn counter_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<14.dim} {bar:30.green/dim} {pos:>9}/{len:9} {wide_msg:.dim}")
        .expect("invalid template")
        .progress_chars("--")
}

/// Central progress context managing the run's progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty: std::io::stderr().is_terminal(),
        }
    }

    /// Item-count bar for one shard or merge run. Hidden when not a TTY.
    pub fn counter_bar(&self, name: &str, total: u64) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(counter_style());
        let display = if name.len() > 14 { &name[..14] } else { name };
        pb.set_prefix(display.to_string());
        pb
    }

    /// Spinner status line for a pipeline stage.
    pub fn stage_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {prefix:<10.cyan.bold} {wide_msg}")
                .expect("invalid template"),
        );
        pb.set_prefix(name.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Print a line above managed progress bars.
    pub fn println(&self, msg: impl AsRef<str>) {
        if self.is_tty {
            let _ = self.multi.println(msg);
        } else {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for `ProgressContext`.
pub type SharedProgress = Arc<ProgressContext>;

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
