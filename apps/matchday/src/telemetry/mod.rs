use once_cell::sync::Lazy;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static WIRE_TRACING: Lazy<bool> =
    Lazy::new(|| env_truthy("MATCHDAY_TRACE_WIRE").unwrap_or(false));

/// Raw hub frames are logged at trace level only when `MATCHDAY_TRACE_WIRE`
/// is set; they carry full state payloads on every tick.
pub fn wire_tracing() -> bool {
    *WIRE_TRACING
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    pub const FILTER_ENV: &str = "MATCHDAY_LOG_FILTER";

    /// Crate targets that follow the requested level. Everything else is
    /// capped at info.
    const OWN_TARGETS: &[&str] = &["matchday_client_core", "matchday"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {}: {source}", path.display())]
        OpenFile {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("invalid MATCHDAY_LOG_FILTER: {0}")]
        Filter(String),
        #[error("tracing subscriber already installed: {0}")]
        AlreadySet(String),
    }

    // Keeps the background writer flushing for the life of the process.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the process-wide subscriber. Only the first call does
    /// anything.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = env_filter(config.level)?;
        let (writer, guard) = writer_for(config.file.as_deref())?;

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|err| InitError::AlreadySet(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    fn writer_for(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = file else {
            return Ok(tracing_appender::non_blocking(io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::OpenFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn env_filter(level: LogLevel) -> Result<EnvFilter, InitError> {
        match std::env::var(FILTER_ENV) {
            Ok(directives) => EnvFilter::try_new(&directives)
                .map_err(|err| InitError::Filter(format!("{directives}: {err}"))),
            Err(_) => Ok(EnvFilter::new(default_directives(level))),
        }
    }

    pub(crate) fn default_directives(level: LogLevel) -> String {
        let global = level.min(LogLevel::Info);
        let mut directives = vec![global.as_str().to_string()];
        if level > global {
            directives.extend(
                OWN_TARGETS
                    .iter()
                    .map(|target| format!("{target}={}", level.as_str())),
            );
        }
        directives.join(",")
    }

}
