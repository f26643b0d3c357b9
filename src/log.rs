//! Thin facade giving call sites a `log!(LogLevel::LogDebug, "...")` shape
//! over the `log` crate, initialized once from `main` with `env_logger` so
//! verbosity is controlled the ordinary way (`RUST_LOG`) plus the
//! `--log-file`/`--verbosity` options in [`crate::config`].

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
    LogEvents,
    LogContext,
}

impl LogLevel {
    fn to_level(self) -> log::Level {
        match self {
            LogLevel::LogError => log::Level::Error,
            LogLevel::LogWarn => log::Level::Warn,
            LogLevel::LogInfo => log::Level::Info,
            LogLevel::LogDebug => log::Level::Debug,
            LogLevel::LogEvents => log::Level::Trace,
            LogLevel::LogContext => log::Level::Trace,
        }
    }
}

#[doc(hidden)]
pub fn log_enabled(level: LogLevel) -> bool {
    log::log_enabled!(target: "tcf_debug_core", level.to_level())
}

#[doc(hidden)]
pub fn level_to_log(level: LogLevel) -> log::Level {
    level.to_level()
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        log::log!(target: "tcf_debug_core", $crate::log::level_to_log($level), $($arg)+)
    };
}

/// Initialize the global logger once. Safe to call more than once; later
/// calls are no-ops (mirrors `Flags::get()`'s initialize-once-at-startup
/// lifecycle, spec §6 "Process-wide state").
pub fn init(verbosity: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(verbosity))
        .format_timestamp_micros()
        .try_init();
}
