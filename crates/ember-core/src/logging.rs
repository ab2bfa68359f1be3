//! Logging system for the Ember engine
//!
//! Thin layer over `tracing`: installs the subscriber from [`LoggingConfig`]
//! and provides category-filtered, optionally rate-limited macros for the
//! hot per-frame paths.

use crate::config::LoggingConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Log levels supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log categories, one per rendering subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    Core,
    Resource,
    Descriptor,
    Command,
    Queue,
    Pass,
    Frame,
    Overlay,
}

impl LogCategory {
    /// Convert LogCategory to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Core => "core",
            LogCategory::Resource => "resource",
            LogCategory::Descriptor => "descriptor",
            LogCategory::Command => "command",
            LogCategory::Queue => "queue",
            LogCategory::Pass => "pass",
            LogCategory::Frame => "frame",
            LogCategory::Overlay => "overlay",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl LogLevel {
    /// Parse a level name, case-insensitively
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Convert LogLevel to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rate limiting state for a specific category
#[derive(Debug)]
struct RateLimitState {
    last_reset: Instant,
    count: u32,
    max_count: u32,
    duration: Duration,
}

impl RateLimitState {
    fn new(max_count: u32, duration: Duration) -> Self {
        Self {
            last_reset: Instant::now(),
            count: 0,
            max_count,
            duration,
        }
    }

    fn should_allow(&mut self) -> bool {
        let now = Instant::now();

        if now.duration_since(self.last_reset) >= self.duration {
            self.last_reset = now;
            self.count = 0;
        }

        if self.count < self.max_count {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Category filter and rate limiter state
#[derive(Debug)]
pub struct LoggerConfig {
    rate_limiters: RwLock<HashMap<String, RateLimitState>>,
    config: LoggingConfig,
}

impl LoggerConfig {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            rate_limiters: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Check if a log message should be allowed based on rate limiting
    pub fn should_allow_log(&self, category: &str) -> bool {
        let mut limiters = self.rate_limiters.write();

        let limiter = limiters.entry(category.to_string()).or_insert_with(|| {
            RateLimitState::new(
                self.config.max_rate_limit_count,
                Duration::from_secs(self.config.rate_limit_seconds),
            )
        });

        limiter.should_allow()
    }

    /// Check if a log level is enabled for a category
    pub fn is_level_enabled(&self, category: &str, level: LogLevel) -> bool {
        if let Some(category_level) = self
            .config
            .category_levels
            .get(category)
            .and_then(|l| LogLevel::parse(l))
        {
            return level >= category_level;
        }

        level >= LogLevel::Info
    }

    pub fn update_config(&mut self, config: LoggingConfig) {
        self.config = config;
        self.rate_limiters.write().clear();
    }
}

static LOGGER: OnceLock<Arc<RwLock<LoggerConfig>>> = OnceLock::new();

/// Initialize the category filter and install the tracing subscriber.
///
/// Calling this more than once keeps the first subscriber and only updates
/// the category configuration.
pub fn init(config: &LoggingConfig) {
    let logger = LOGGER.get_or_init(|| Arc::new(RwLock::new(LoggerConfig::new(config.clone()))));
    logger.write().update_config(config.clone());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.default_level));

    // A subscriber may already be installed by the host application or a test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Update logger configuration
pub fn update_config(config: LoggingConfig) {
    if let Some(logger) = LOGGER.get() {
        logger.write().update_config(config);
    }
}

/// Dispatch a message through the category filter into `tracing`
pub fn log_internal(level: LogLevel, category: LogCategory, message: &str, rate_limited: bool) {
    if let Some(logger) = LOGGER.get() {
        let logger_guard = logger.read();

        if !logger_guard.is_level_enabled(category.as_str(), level) {
            return;
        }

        if rate_limited && !logger_guard.should_allow_log(category.as_str()) {
            return;
        }
    }

    let category = category.as_str();
    match level {
        LogLevel::Trace => tracing::trace!(category, "{}", message),
        LogLevel::Debug => tracing::debug!(category, "{}", message),
        LogLevel::Info => tracing::info!(category, "{}", message),
        LogLevel::Warn => tracing::warn!(category, "{}", message),
        LogLevel::Error => tracing::error!(category, "{}", message),
    }
}

#[macro_export]
macro_rules! ember_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Trace, $category, &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! ember_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Debug, $category, &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! ember_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Info, $category, &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! ember_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category, &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! ember_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Error, $category, &format!($($arg)*), false)
    };
}

#[macro_export]
macro_rules! ember_debug_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Debug, $category, &format!($($arg)*), true)
    };
}

#[macro_export]
macro_rules! ember_warn_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_internal($crate::logging::LogLevel::Warn, $category, &format!($($arg)*), true)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("invalid"), None);

        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogCategory::Descriptor.to_string(), "descriptor");
    }

    #[test]
    fn test_rate_limiting() {
        let mut state = RateLimitState::new(2, Duration::from_millis(100));

        assert!(state.should_allow());
        assert!(state.should_allow());
        assert!(!state.should_allow());

        std::thread::sleep(Duration::from_millis(150));
        assert!(state.should_allow());
    }

    #[test]
    fn test_category_levels() {
        let mut category_levels = HashMap::new();
        category_levels.insert("frame".to_string(), "debug".to_string());

        let logger_config = LoggerConfig::new(LoggingConfig {
            category_levels,
            max_rate_limit_count: 1,
            ..LoggingConfig::default()
        });

        assert!(logger_config.is_level_enabled("frame", LogLevel::Debug));
        assert!(!logger_config.is_level_enabled("frame", LogLevel::Trace));
        // Unknown categories fall back to info
        assert!(!logger_config.is_level_enabled("queue", LogLevel::Debug));

        assert!(logger_config.should_allow_log("frame"));
        assert!(!logger_config.should_allow_log("frame"));
    }
}
