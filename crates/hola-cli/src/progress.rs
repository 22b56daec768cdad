//! Terminal reporting with TTY detection.
//!
//! In TTY mode a spinner ticks while drivers work (driven by the
//! scheduler's heartbeat); without a TTY everything degrades to plain
//! lines on stderr. Failures render in red either way.

use atty::Stream;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use hola::engine::{Reporter, RunReport};

/// Detects whether stderr is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stderr)
}

/// Reporter that shows a spinner in TTY mode and falls back to plain
/// text otherwise.
pub struct ProgressReporter {
    spinner: Option<ProgressBar>,
    use_color: bool,
}

impl ProgressReporter {
    pub fn new(no_color: bool) -> Self {
        let spinner = if is_tty() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Some(pb)
        } else {
            None
        };
        Self {
            spinner,
            use_color: !no_color && is_tty(),
        }
    }

    /// A reporter that never draws a spinner.
    pub fn plain() -> Self {
        Self {
            spinner: None,
            use_color: false,
        }
    }

    fn line(&self, msg: &str) {
        match &self.spinner {
            Some(pb) => pb.println(msg),
            None => eprintln!("{msg}"),
        }
    }

    /// Clear the spinner and print the run summary.
    pub fn finish(self, report: &RunReport) {
        if let Some(pb) = self.spinner {
            pb.finish_and_clear();
        }
        eprintln!(
            "converged: {} updated, {} up to date, {} skipped, {} failed in {:.1?}",
            report.updated, report.up_to_date, report.skipped, report.failed, report.duration
        );
    }
}

impl Reporter for ProgressReporter {
    fn info(&mut self, msg: &str) {
        self.line(msg);
        if let Some(pb) = &self.spinner {
            pb.set_message(msg.to_string());
        }
    }

    fn warn(&mut self, msg: &str) {
        if self.use_color {
            self.line(&format!("{}", style(msg).yellow()));
        } else {
            self.line(msg);
        }
    }

    fn error(&mut self, msg: &str) {
        if self.use_color {
            self.line(&format!("{}", style(msg).red()));
        } else {
            self.line(msg);
        }
    }

    fn heartbeat(&mut self) {
        if let Some(pb) = &self.spinner {
            pb.tick();
        }
    }
}
