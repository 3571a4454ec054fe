//! Configuration management for the passive scanner

use crate::error::{PscanError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Runtime options consulted by the scheduler, the registry and every task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveScanOptions {
    /// Size of the worker pool
    pub threads: usize,
    /// Bodies larger than this are not analyzed (0 = unlimited)
    pub max_body_size_bytes: usize,
    /// Rules raising more alerts than this get disabled (0 = unlimited)
    pub max_alerts_per_rule: u32,
    /// Only scan history records inside the testing scope
    pub scan_only_in_scope: bool,
    /// Whether auto-tag rules run
    pub enable_tags: bool,
    /// Rules slower than this are reported with a warning
    pub slow_rule_threshold_ms: u64,
    /// How long the scheduler sleeps when it has caught up
    pub poll_interval_ms: u64,
}

impl Default for PassiveScanOptions {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_body_size_bytes: 0,
            max_alerts_per_rule: 0,
            scan_only_in_scope: false,
            enable_tags: true,
            slow_rule_threshold_ms: 5_000,
            poll_interval_ms: 2_000,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PassiveScanOptions {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(PscanError::ConfigError(
                "threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn slow_rule_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_rule_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// True when a body of `len` bytes exceeds the configured limit
    pub fn body_too_big(&self, len: usize) -> bool {
        self.max_body_size_bytes > 0 && len > self.max_body_size_bytes
    }
}

/// Shared, hot-reloadable options. Readers take snapshots.
#[derive(Debug, Clone, Default)]
pub struct OptionsHandle {
    inner: Arc<RwLock<PassiveScanOptions>>,
}

impl OptionsHandle {
    pub fn new(options: PassiveScanOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(options)),
        }
    }

    pub fn snapshot(&self) -> PassiveScanOptions {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Applies `f` to the live options. Invalid results are rejected.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PassiveScanOptions),
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut candidate = guard.clone();
        f(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        Ok(())
    }
}

/// File-based configuration structure
#[derive(Debug, Deserialize)]
struct FileConfig {
    pscan: Option<PscanSection>,
    proxy: Option<ProxySection>,
}

#[derive(Debug, Deserialize)]
struct PscanSection {
    threads: Option<usize>,
    max_body_size_bytes: Option<usize>,
    max_alerts_per_rule: Option<u32>,
    scan_only_in_scope: Option<bool>,
    enable_tags: Option<bool>,
    slow_rule_threshold_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProxySection {
    scope: Option<Vec<String>>,
}

/// Everything a config file can carry
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub options: PassiveScanOptions,
    /// Regexes matched against URLs to decide scope membership
    pub scope: Vec<String>,
}

/// Loads configuration from a TOML file and merges with defaults
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(PscanError::IoError)?;
    parse_config(&content)
}

/// Parses TOML content and merges it onto the defaults
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let file_config: FileConfig = toml::from_str(content)?;

    let mut config = AppConfig::default();

    if let Some(pscan) = file_config.pscan {
        let options = &mut config.options;
        if let Some(threads) = pscan.threads {
            options.threads = threads;
        }
        if let Some(size) = pscan.max_body_size_bytes {
            options.max_body_size_bytes = size;
        }
        if let Some(max) = pscan.max_alerts_per_rule {
            options.max_alerts_per_rule = max;
        }
        if let Some(in_scope) = pscan.scan_only_in_scope {
            options.scan_only_in_scope = in_scope;
        }
        if let Some(tags) = pscan.enable_tags {
            options.enable_tags = tags;
        }
        if let Some(ms) = pscan.slow_rule_threshold_ms {
            options.slow_rule_threshold_ms = ms;
        }
        if let Some(ms) = pscan.poll_interval_ms {
            options.poll_interval_ms = ms;
        }
    }

    if let Some(proxy) = file_config.proxy {
        if let Some(scope) = proxy.scope {
            config.scope = scope;
        }
    }

    config.options.validate()?;
    Ok(config)
}

/// Merges CLI arguments into an existing configuration
pub fn merge_cli_args(
    config: &mut AppConfig,
    threads: Option<usize>,
    max_body_size: Option<usize>,
    max_alerts: Option<u32>,
    scope: Option<Vec<String>>,
) -> Result<()> {
    if let Some(t) = threads {
        config.options.threads = t;
    }
    if let Some(s) = max_body_size {
        config.options.max_body_size_bytes = s;
    }
    if let Some(m) = max_alerts {
        config.options.max_alerts_per_rule = m;
    }
    if let Some(s) = scope {
        config.options.scan_only_in_scope = !s.is_empty();
        config.scope = s;
    }
    config.options.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let config = parse_config(
            r#"
[pscan]
max_alerts_per_rule = 3
max_body_size_bytes = 1000
"#,
        )
        .expect("parse");
        assert_eq!(config.options.max_alerts_per_rule, 3);
        assert_eq!(config.options.max_body_size_bytes, 1000);
        assert!(config.options.enable_tags);
        assert_eq!(config.options.slow_rule_threshold_ms, 5_000);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = parse_config("[pscan]\nthreads = 0\n").unwrap_err();
        assert!(matches!(err, PscanError::ConfigError(_)));
    }

    #[test]
    fn test_scope_from_proxy_section() {
        let config = parse_config("[proxy]\nscope = [\"^https://app\\\\.test/\"]\n").expect("parse");
        assert_eq!(config.scope.len(), 1);
    }

    #[test]
    fn test_update_rejects_invalid_and_keeps_old_value() {
        let handle = OptionsHandle::new(PassiveScanOptions {
            threads: 2,
            ..PassiveScanOptions::default()
        });
        assert!(handle.update(|o| o.threads = 0).is_err());
        assert_eq!(handle.snapshot().threads, 2);
        handle.update(|o| o.threads = 6).expect("valid update");
        assert_eq!(handle.snapshot().threads, 6);
    }

    #[test]
    fn test_body_limit_zero_is_unlimited() {
        let options = PassiveScanOptions::default();
        assert!(!options.body_too_big(usize::MAX));
        let limited = PassiveScanOptions {
            max_body_size_bytes: 10,
            ..options
        };
        assert!(!limited.body_too_big(10));
        assert!(limited.body_too_big(11));
    }
}
