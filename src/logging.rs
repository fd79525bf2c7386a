use clap::ValueEnum;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Logs to stdout, or to a daily rolling `<file_name>` under `log_path`.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_logging(
    log_path: Option<&str>,
    file_name: &str,
    log_level: LogLevel,
) -> Option<WorkerGuard> {
    if let Some(log_path) = log_path {
        println!("Logging into: {}/{}", log_path, file_name);
        let file_appender = tracing_appender::rolling::daily(log_path, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_max_level(Level::from(log_level))
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::from(log_level))
            .init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_like_tracing() {
        assert!(Level::from(LogLevel::Trace) > Level::from(LogLevel::Error));
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
    }
}
