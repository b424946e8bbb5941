use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{prelude::*, reload, Registry};

use crate::errors::AppError;

const MAX_LOG_SIZE: u64 = 1024 * 1024 * 5;
const MAX_LOG_BACKUPS: usize = 2;

/// Keeps the file writer alive and lets the host change the level later.
///
/// Dropping this flushes and closes the log file.
pub struct LogHandle {
    _guard: WorkerGuard,
    level: reload::Handle<LevelFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: LevelFilter) -> Result<(), AppError> {
        self.level
            .modify(|filter| *filter = level)
            .map_err(|e| AppError::Logging(e.to_string()))
    }
}

/// Installs the global subscriber, writing to a size-rotated file at `log_path`.
///
/// Starts at `initial_level`, usually [`crate::settings::Settings::log_level`].
pub fn init_logging(log_path: &Path, initial_level: LevelFilter) -> Result<LogHandle, AppError> {
    let file_appender = BasicRollingFileAppender::new(
        log_path,
        RollingConditionBasic::new().max_size(MAX_LOG_SIZE),
        MAX_LOG_BACKUPS,
    )
    .map_err(|e| AppError::CreateFile {
        path: log_path.to_owned(),
        source: e,
    })?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let time_fmt = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_owned());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_file(false)
        .with_ansi(false)
        .with_target(true)
        .with_timer(time_fmt)
        .with_line_number(true);
    let (level_layer, level) = reload::Layer::new(initial_level);
    // btleplug is very chatty at debug
    let env_filter = tracing_subscriber::EnvFilter::new("trace,btleplug=info");

    tracing_subscriber::registry()
        .with(level_layer)
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;

    Ok(LogHandle {
        _guard: guard,
        level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_file_and_reloads_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iron-row.log");

        let handle = init_logging(&path, LevelFilter::INFO).unwrap();
        tracing::debug!("hidden");
        tracing::info!("visible");
        handle.set_level(LevelFilter::DEBUG).unwrap();
        tracing::debug!("now visible");
        // Flush
        drop(handle);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("visible"));
        assert!(contents.contains("now visible"));
        assert!(!contents.contains("hidden"));

        // Only one global subscriber per process
        assert!(init_logging(&dir.path().join("other.log"), LevelFilter::INFO).is_err());
    }
}
