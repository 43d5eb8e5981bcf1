//! Error taxonomy for the analyzer.
//!
//! Per-item failures (malformed series, classifier refusals) never show up
//! here as hard errors; they are tallied by the workers. What remains are the
//! cycle-level and process-level conditions the scheduler has to react to.

use std::fmt;

/// Errors talking to the shared time-series store.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Could not open a connection
    Connection(String),
    /// A command was sent but failed
    Command(String),
    /// No connection is currently held (reconnect pending)
    Unavailable,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "store connection failed: {}", e),
            Self::Command(e) => write!(f, "store command failed: {}", e),
            Self::Unavailable => write!(f, "store unavailable"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read config: {}", e),
            Self::Parse(e) => write!(f, "cannot parse config: {}", e),
            Self::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level errors that end the scheduler loop.
#[derive(Debug)]
pub enum AnalyzerError {
    Config(ConfigError),
    Store(StoreError),
    /// The supervising process (or this process) is gone, or shutdown was requested
    ParentLost,
    Io(String),
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "{}", e),
            Self::ParentLost => write!(f, "supervising process lost"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for AnalyzerError {}

impl From<ConfigError> for AnalyzerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for AnalyzerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<std::io::Error> for AnalyzerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
