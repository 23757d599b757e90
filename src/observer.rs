//! Progress rendering for apply runs.
//!
//! The executor reports each action as it starts and finishes through
//! [`ApplyObserver`]. Interactive terminals get a spinner per action, piped
//! output gets one plain line per event, JSON mode stays silent so stdout
//! carries only the final document.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::plan::Action;
use crate::report::{ActionOutcome, ActionStatus};

pub trait ApplyObserver {
    fn batch_started(&mut self, _total: usize) {}
    fn action_started(&mut self, _action: &Action) {}
    fn action_finished(&mut self, _outcome: &ActionOutcome) {}
}

/// Observer that renders nothing.
pub struct Silent;

impl ApplyObserver for Silent {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners and checkmarks on stderr.
    Interactive,
    /// No ANSI, one line per event.
    Plain,
    /// Nothing at all.
    Silent,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style(status: ActionStatus) -> ProgressStyle {
    let template = match status {
        ActionStatus::Completed => "[{prefix}] \u{2713} {msg:.green}",
        ActionStatus::Failed => "[{prefix}] \u{2717} {msg:.red}",
        ActionStatus::Skipped => "[{prefix}] - {msg:.dim}",
    };
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Numbered per-action progress, `[n/total]`.
pub struct ProgressObserver {
    mode: OutputMode,
    total: usize,
    current: usize,
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            total: 0,
            current: 0,
            bar: None,
        }
    }

    fn prefix(&self) -> String {
        format!("{}/{}", self.current, self.total)
    }
}

fn finished_label(outcome: &ActionOutcome) -> String {
    let base = format!("{} {}", outcome.action, outcome.target_name);
    match (outcome.status, &outcome.detail, &outcome.error) {
        (ActionStatus::Failed, _, Some(err)) => format!("{base}: {err}"),
        (_, Some(detail), _) => format!("{base} ({detail})"),
        _ => base,
    }
}

impl ApplyObserver for ProgressObserver {
    fn batch_started(&mut self, total: usize) {
        self.total = total;
        self.current = 0;
    }

    fn action_started(&mut self, action: &Action) {
        self.current += 1;
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => eprintln!("[{}] {action}", self.prefix()),
            OutputMode::Interactive => {
                let bar = ProgressBar::new_spinner();
                bar.set_draw_target(ProgressDrawTarget::stderr());
                bar.set_style(spinner_style());
                bar.set_prefix(self.prefix());
                bar.set_message(action.to_string());
                bar.enable_steady_tick(Duration::from_millis(80));
                self.bar = Some(bar);
            }
        }
    }

    fn action_finished(&mut self, outcome: &ActionOutcome) {
        let label = finished_label(outcome);
        match self.mode {
            OutputMode::Silent => {}
            OutputMode::Plain => {
                eprintln!("[{}] {} {label}", self.prefix(), outcome.status.as_str());
            }
            OutputMode::Interactive => {
                if let Some(bar) = self.bar.take() {
                    bar.set_style(done_style(outcome.status));
                    bar.finish_with_message(label);
                }
            }
        }
    }
}
