use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for synchronous operations that give no progress of their own.
pub fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠉⠙⠚⠒⠂⠂⠒⠲⠴⠤⠄⠄⠤⠠⠠⠤⠦⠖⠒⠐⠐⠒⠓⠋"),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Finish a spinner and print a success message with a checkmark
/// This clears the spinner line entirely and prints a clean message
pub fn finish_spinner_with_success(pb: ProgressBar, message: impl Into<String>) {
    pb.finish_and_clear();
    println!("✓ {}", message.into());
}

/// Bar in tenths of a percent, for jobs that report a percentage per stage.
pub fn create_percent_bar() -> ProgressBar {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    pb.enable_steady_tick(Duration::from_millis(250));
    pb
}

/// Show `stage` at `percent`. A stage without a percentage keeps the bar where it is.
pub fn set_stage(pb: &ProgressBar, stage: Option<&str>, percent: Option<f64>) {
    pb.set_message(stage.unwrap_or("waiting for output").to_string());
    if let Some(percent) = percent {
        pb.set_position(percent_position(percent));
    }
}

fn percent_position(percent: f64) -> u64 {
    (percent.clamp(0.0, 100.0) * 10.0).round() as u64
}
