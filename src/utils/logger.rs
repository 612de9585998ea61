//! Logging utilities
//!
//! Subscriber setup for the binary. The library itself only emits events.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log level configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Level for the `--verbose` / `--quiet` flags, before any explicit override
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (true, _) => LogLevel::Debug,
            (false, true) => LogLevel::Warn,
            _ => LogLevel::Info,
        }
    }

    /// Flags win over the configured level; an unknown level falls back to info
    pub fn select(verbose: bool, quiet: bool, configured: &str) -> Self {
        if verbose || quiet {
            Self::from_flags(verbose, quiet)
        } else {
            Self::from_str(configured).unwrap_or_default()
        }
    }

    fn directive(self) -> String {
        format!("test_orchestrator={}", self.to_tracing_level())
    }
}

/// Initialize the logger with specified level
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::new(level.directive());

    // A second initialisation (tests, embedding) is not an error
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("unknown"), None);
    }

    #[test]
    fn test_level_from_flags() {
        assert_eq!(LogLevel::from_flags(true, true), LogLevel::Debug);
        assert_eq!(LogLevel::from_flags(false, true), LogLevel::Warn);
        assert_eq!(LogLevel::from_flags(false, false), LogLevel::default());
    }

    #[test]
    fn test_select_prefers_flags() {
        assert_eq!(LogLevel::select(false, true, "trace"), LogLevel::Warn);
        assert_eq!(LogLevel::select(false, false, "trace"), LogLevel::Trace);
        assert_eq!(LogLevel::select(false, false, "loud"), LogLevel::Info);
    }

    #[test]
    fn test_directive_targets_crate() {
        assert_eq!(LogLevel::Trace.directive(), "test_orchestrator=TRACE");
    }
}
