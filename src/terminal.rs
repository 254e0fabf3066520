use std::time::Duration;

use console::{Term, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::domain::ReviewerResult;
use crate::runner::ProgressReporter;

pub const MAX_REPORT_WIDTH: usize = 90;
pub const DEFAULT_WIDTH: usize = 80;

/// Decide the process-wide colours flag once, from stdout TTY state and
/// `NO_COLOR`.
pub fn init_colors() {
    let enabled = Term::stdout().is_term() && std::env::var_os("NO_COLOR").is_none();
    console::set_colors_enabled(enabled);
    console::set_colors_enabled_stderr(enabled && Term::stderr().is_term());
}

/// Report width: terminal columns capped at [`MAX_REPORT_WIDTH`].
pub fn report_width() -> usize {
    Term::stdout()
        .size_checked()
        .map_or(DEFAULT_WIDTH, |(_, cols)| clamp_width(usize::from(cols)))
}

fn clamp_width(cols: usize) -> usize {
    if cols == 0 {
        DEFAULT_WIDTH
    } else {
        cols.min(MAX_REPORT_WIDTH)
    }
}

pub fn ruler(width: usize) -> String {
    "─".repeat(width)
}

/// `12.3s`, or `2m 5.0s` from one minute up.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let minutes = d.as_secs() / 60;
    let rest = secs - (minutes * 60) as f64;
    format!("{minutes}m {rest:.1}s")
}

/// Greedy word wrap. Every output line starts with `indent`; existing line
/// breaks are kept and a word longer than the width gets a line of its own.
pub fn wrap_text(text: &str, width: usize, indent: &str) -> Vec<String> {
    let avail = width.saturating_sub(indent.chars().count()).max(20);
    let mut lines = Vec::new();

    for source in text.lines() {
        let mut current = String::new();
        let mut current_len = 0;
        for word in source.split_whitespace() {
            let len = word.chars().count();
            if current_len > 0 && current_len + 1 + len > avail {
                lines.push(format!("{indent}{current}"));
                current.clear();
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(word);
            current_len += len;
        }
        lines.push(format!("{indent}{current}").trim_end().to_string());
    }
    lines
}

/// Spinner on stderr showing reviewer completion. Hidden when stderr is not
/// a terminal.
pub struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        let bar = if Term::stderr().is_term() {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {msg} [{elapsed}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { bar }
    }
}

impl Default for SpinnerProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for SpinnerProgress {
    fn started(&self, total: usize) {
        self.bar
            .set_message(format!("Running reviewers (0/{total})"));
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn reviewer_finished(&self, result: &ReviewerResult, completed: usize, total: usize) {
        self.bar
            .set_message(format!("Running reviewers ({completed}/{total})"));
        if !result.timed_out && result.exit_code != 0 {
            self.bar.println(format!(
                "  {} reviewer #{} ({}) exited with code {}",
                style("!").yellow(),
                result.reviewer_id,
                result.agent_name,
                result.exit_code
            ));
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
