//! CLI utilities: tracing setup and progress bar styling

use indicatif::ProgressStyle;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing to stderr. Quiet mode suppresses it entirely so
/// machine-readable stdout stays clean.
pub fn init_tracing(verbose: bool, quiet: bool) {
    if quiet {
        return;
    }

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive"))
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Progress bar for the giant-step sweep; the message slot carries the
/// keys/s figure.
pub fn sweep_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% ({eta}) {msg}",
        )
        .expect("Invalid progress bar template")
        .progress_chars("#>-")
}
