//! Terminal progress bars for batch transfers.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const QUEUED_TEMPLATE: &str = "  {prefix:.dim} {msg:.dim}";
const ACTIVE_TEMPLATE: &str =
    "  {prefix:.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {percent:>3}% {bytes_per_sec} eta {eta}";
const UNSIZED_TEMPLATE: &str = "  {spinner} {prefix:.bold} {bytes} {bytes_per_sec}";
const DONE_TEMPLATE: &str = "  {prefix} {msg}";

/// Display name width in the prefix column.
const PREFIX_WIDTH: usize = 32;

/// One progress bar per task, stacked in a shared [`MultiProgress`].
///
/// When disabled every bar is hidden, so callers never branch on whether
/// progress is shown.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    multi: MultiProgress,
}

impl BatchProgress {
    /// Creates a display drawing to stderr, or a hidden one.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let target = if enabled {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
        }
    }

    /// Whether bars are drawn.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.multi.is_hidden()
    }

    /// Adds a bar in the queued state.
    #[must_use]
    pub fn queued(&self, name: &str) -> TaskProgress {
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style(QUEUED_TEMPLATE));
        bar.set_prefix(fit_prefix(name));
        bar.set_message("queued");
        TaskProgress { bar }
    }
}

/// Progress handle of a single task.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    bar: ProgressBar,
}

impl TaskProgress {
    /// A handle that draws nothing.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Switches to the transfer style, starting at `position` bytes.
    pub fn start(&self, total: Option<u64>, position: u64) {
        match total {
            Some(total) => {
                self.bar.set_style(style(ACTIVE_TEMPLATE).progress_chars("=> "));
                self.bar.set_length(total.max(position));
            }
            None => self.bar.set_style(style(UNSIZED_TEMPLATE)),
        }
        self.bar.set_message("");
        self.bar.reset_eta();
        self.bar.set_position(position);
    }

    /// Records `bytes` more on disk.
    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Leaves a one-line summary in place of the bar.
    pub fn finish(&self, success: bool, note: &str) {
        self.bar.set_style(style(DONE_TEMPLATE));
        let mark = if success { "done" } else { "failed" };
        if note.is_empty() {
            self.bar.finish_with_message(mark);
        } else {
            self.bar.finish_with_message(format!("{mark}: {note}"));
        }
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn fit_prefix(name: &str) -> String {
    let count = name.chars().count();
    if count <= PREFIX_WIDTH {
        return format!("{name:<PREFIX_WIDTH$}");
    }
    let tail: String = name.chars().skip(count - (PREFIX_WIDTH - 3)).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_batch_tracks_position() {
        let progress = BatchProgress::new(false);
        assert!(progress.is_hidden());

        let task = progress.queued("lesson.mp4");
        task.start(Some(100), 40);
        task.advance(10);
        assert_eq!(task.position(), 50);
        task.finish(true, "");
    }

    #[test]
    fn test_restart_resets_position() {
        let task = TaskProgress::hidden();
        task.start(None, 0);
        task.advance(500);
        task.start(Some(1000), 0);
        assert_eq!(task.position(), 0);
    }

    #[test]
    fn test_prefix_is_padded_or_truncated_to_width() {
        assert_eq!(fit_prefix("a.pdf").chars().count(), PREFIX_WIDTH);
        let long = "01-an-extremely-long-lesson-title-that-overflows.mp4";
        let fitted = fit_prefix(long);
        assert_eq!(fitted.chars().count(), PREFIX_WIDTH);
        assert!(fitted.starts_with("..."));
        assert!(fitted.ends_with("overflows.mp4"));
    }
}
