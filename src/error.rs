//! Error types for the passive scanner

use thiserror::Error;

/// Main error type for passive scan operations
#[derive(Debug, Error)]
pub enum PscanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Scan rule {0} not found")]
    RuleNotFound(u32),

    #[error("Scan rule {0} is already registered")]
    DuplicateRule(u32),

    #[error("Rule '{rule}' failed: {message}")]
    RuleFailed { rule: String, message: String },

    #[error("History record {0} is not available")]
    HistoryUnavailable(u64),

    #[error("Worker pool is shut down")]
    PoolShutDown,

    #[error("Worker pool queue is full")]
    PoolSaturated,

    #[error("Proxy error: {0}")]
    ProxyError(String),
}

impl PscanError {
    /// Shorthand used by rules to report analysis failures
    pub fn rule_failed(rule: impl Into<String>, message: impl Into<String>) -> Self {
        PscanError::RuleFailed {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for passive scan operations
pub type Result<T> = std::result::Result<T, PscanError>;
