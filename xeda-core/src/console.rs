//! Shared progress/output surface for flow execution.
//!
//! Tool invocations run under a process-wide [`indicatif::MultiProgress`]
//! so that a spinner per in-flight flow can coexist with interleaved
//! `println!`-style lines from the tools themselves, without either
//! clobbering the other's line. [`Console::println`] is the one place
//! flows and the runner should print user-facing lines from; everything
//! else goes through `tracing`.

use std::sync::OnceLock;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

static MULTI: OnceLock<MultiProgress> = OnceLock::new();

fn multi() -> &'static MultiProgress {
    MULTI.get_or_init(MultiProgress::new)
}

/// Process-wide console coordinator.
pub struct Console;

impl Console {
    /// Prints a line above any active spinners, instead of through them.
    pub fn println(line: impl Into<String>) {
        let line = line.into();
        if multi().println(&line).is_err() {
            println!("{line}");
        }
    }

    /// Registers a spinner labeled `what` that lives until dropped.
    pub fn spinner(what: impl Into<String>) -> ProgressBar {
        let bar = multi().add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(what.into());
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar
    }
}
