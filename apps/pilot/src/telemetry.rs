pub mod logging {
    use clap::ValueEnum;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    /// Overrides the computed filter outright, e.g. `pilot::transfer=trace`.
    pub const FILTER_ENV: &str = "PILOT_LOG_FILTER";
    /// Lets socket and HTTP crates log at trace alongside ours.
    pub const TRACE_DEPS_ENV: &str = "PILOT_TRACE_DEPS";

    /// Every target the client logs under; raised together at debug and trace.
    const PILOT_TARGETS: &[&str] = &["pilot", "pilot_core", "pilot_proto"];

    const TRANSPORT_TARGETS: &[&str] = &[
        "tungstenite",
        "tokio_tungstenite",
        "native_tls",
        "reqwest",
        "hyper",
        "hyper_util",
        "rustls",
        "h2",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
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
        /// Append to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        LogFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("a global subscriber is already installed: {0}")]
        AlreadySet(String),
    }

    // Flushes the non-blocking writer on exit; set once with the subscriber.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the process-wide subscriber. Repeat calls return `Ok` without
    /// touching the first installation.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }
        let (writer, guard) = open_writer(config.file.as_deref())?;
        let filter = std::env::var(FILTER_ENV)
            .map(EnvFilter::new)
            .unwrap_or_else(|_| {
                EnvFilter::new(default_filter_for(config.level, env_flag(TRACE_DEPS_ENV)))
            });

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::AlreadySet(err.to_string()))?;

        let _ = WRITER_GUARD.set(guard);
        Ok(())
    }

    fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let sink = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(sink))
    }

    /// Filter directives for `level`. Below debug everything shares one level;
    /// at debug and trace only our own targets are raised, and at trace the
    /// transport crates stay at info unless `trace_deps` is set.
    pub(crate) fn default_filter_for(level: LogLevel, trace_deps: bool) -> String {
        let name = LevelFilter::from(level).to_string().to_lowercase();
        if level < LogLevel::Debug {
            return name;
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(PILOT_TARGETS.iter().map(|target| format!("{target}={name}")));
        if level == LogLevel::Trace && !trace_deps {
            directives.extend(TRANSPORT_TARGETS.iter().map(|target| format!("{target}=info")));
        }
        directives.join(",")
    }

    fn env_flag(name: &str) -> bool {
        matches!(
            std::env::var(name).ok().as_deref().map(str::trim),
            Some(value) if !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn trace_keeps_transport_crates_quiet_by_default() {
            let quiet = default_filter_for(LogLevel::Trace, false);
            assert!(quiet.starts_with("info,pilot=trace,pilot_core=trace"));
            assert!(quiet.contains("tungstenite=info"));
            assert!(quiet.contains("reqwest=info"));

            let loud = default_filter_for(LogLevel::Trace, true);
            assert!(!loud.contains("tungstenite=info"));
        }

        #[test]
        fn debug_raises_only_pilot_targets() {
            let filter = default_filter_for(LogLevel::Debug, false);
            assert_eq!(filter, "info,pilot=debug,pilot_core=debug,pilot_proto=debug");
        }

        #[test]
        fn quieter_levels_are_a_single_directive() {
            assert_eq!(default_filter_for(LogLevel::Warn, false), "warn");
            assert_eq!(default_filter_for(LogLevel::Info, false), "info");
            assert_eq!(LevelFilter::from(LogLevel::default()), LevelFilter::INFO);
        }
    }
}
