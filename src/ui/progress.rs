use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ui::icons::{CHECK, CLOCK, CROSS, GATE, RUNNING, SPARKLE, STOP};

/// Terminal UI for a pipeline run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Stage bar: how many stages of the pipeline have completed
/// - Phase bar: spinner with the running stage's current phase
pub struct PipelineUI {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    phase_bar: ProgressBar,
    verbose: bool,
}

/// Render a `pipeline.status_update` status such as `detection.started`.
fn describe_status(status: &str) -> String {
    match status.rsplit_once('.') {
        Some((phase, step)) => format!("{} {}", phase, step),
        None => status.to_string(),
    }
}

impl PipelineUI {
    /// Create the UI for a pipeline expected to run `total_stages` stages.
    pub fn new(total_stages: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░");

        let stage_bar = multi.add(ProgressBar::new(total_stages));
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("Stages");

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix(" Phase");

        Self {
            multi,
            stage_bar,
            phase_bar,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!`.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn pipeline_started(&self, pipeline_id: &str) {
        self.print_line(format!(
            "{}Pipeline {}",
            RUNNING,
            style(pipeline_id).cyan()
        ));
    }

    /// A manager relayed progress for a running stage.
    pub fn stage_status(&self, stage: &str, status: &str, progress: u8) {
        self.stage_bar
            .set_message(format!("{} {}%", style(stage).yellow(), progress));
        self.phase_bar.set_message(describe_status(status));
        self.phase_bar.enable_steady_tick(Duration::from_millis(100));
        if self.verbose {
            self.print_line(format!(
                "    {} {} {}",
                style("→").dim(),
                style(stage).dim(),
                style(describe_status(status)).dim()
            ));
        }
    }

    pub fn stage_complete(&self, stage: &str, issues: &[String]) {
        self.stage_bar.inc(1);
        if issues.is_empty() {
            self.print_line(format!("{}{}", CHECK, style(stage).green()));
        } else {
            self.print_line(format!(
                "{}{} {}",
                CHECK,
                style(stage).green(),
                style(format!("(issues: {})", issues.join(", "))).yellow()
            ));
        }
    }

    pub fn stage_failed(&self, stage: &str, error: &str) {
        self.print_line(format!("{}{}: {}", CROSS, style(stage).red(), error));
    }

    pub fn control_point(&self, stage: &str, options: &[String], timeout_seconds: f64) {
        self.phase_bar.set_message(format!("waiting on {}", stage));
        self.print_line(format!(
            "{}Control point for {} [{}] {}{}s",
            GATE,
            style(stage).yellow().bold(),
            options.join(" | "),
            CLOCK,
            timeout_seconds
        ));
    }

    pub fn control_point_timed_out(&self, stage: &str) {
        self.print_line(format!(
            "{}Control point for {} timed out",
            CLOCK,
            style(stage).yellow()
        ));
    }

    /// Clear the bars and print the final line.
    pub fn finish(&self, status: &str) {
        self.phase_bar.finish_and_clear();
        let icon = match status {
            "completed" => SPARKLE,
            "cancelled" => STOP,
            _ => CROSS,
        };
        self.stage_bar
            .finish_with_message(format!("{}{}", icon, status));
    }
}
