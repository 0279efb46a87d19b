//! Shared setup of the `drama` binaries.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Initializes `env_logger` (default filter `info`) behind a progress bar bridge.
///
/// Log lines are routed through the returned [`MultiProgress`], so they do
/// not tear progress bars drawn into it.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
