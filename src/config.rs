//! Analyzer configuration.
//!
//! Loaded from an optional JSON file; anything missing takes the default.
//! The binary applies CLI/env overrides on top and then calls `validate`.

use crate::aggregator::AggregatorConfig;
use crate::alert::{AlertRule, AlertRuleConfig};
use crate::algo::EnsembleConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub redis_url: String,
    /// Bound on connecting and on each store command except the bulk fetch
    pub store_timeout_secs: u64,
    /// Prefix of every series key; the universe set is `<full_namespace>unique_metrics`
    pub full_namespace: String,
    pub workers: usize,
    pub worker_timeout_secs: u64,

    /// Cycles faster than this are followed by `low_runtime_sleep_secs`
    pub min_cycle_secs: u64,
    pub low_runtime_sleep_secs: u64,
    pub store_retry_secs: u64,
    pub empty_universe_sleep_secs: u64,

    pub liveness_interval_secs: u64,
    /// Supervising process; defaults to our parent at startup
    pub parent_pid: Option<u32>,

    /// Series (without namespace) used to project full-scan duration
    pub canary_metric: Option<String>,

    pub graphite_host: Option<String>,
    pub carbon_port: u16,
    pub server_name: Option<String>,
    pub metric_prefix: String,

    pub enable_alerts: bool,
    pub alerts: Vec<AlertRuleConfig>,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,

    pub anomaly_dump: Option<PathBuf>,
    /// Ops HTTP endpoint (`/health`, `/metrics`, `/anomalies`)
    pub listen_addr: Option<String>,
    pub log_level: String,

    pub ensemble: EnsembleConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_timeout_secs: 10,
            full_namespace: "metrics.".to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            worker_timeout_secs: 600,
            min_cycle_secs: 5,
            low_runtime_sleep_secs: 10,
            store_retry_secs: 10,
            empty_universe_sleep_secs: 10,
            liveness_interval_secs: 5,
            parent_pid: None,
            canary_metric: Some("horizon.test.udp".to_string()),
            graphite_host: None,
            carbon_port: 2003,
            server_name: None,
            metric_prefix: "via.analyzer".to_string(),
            enable_alerts: false,
            alerts: Vec::new(),
            webhook_url: None,
            webhook_timeout_secs: 10,
            anomaly_dump: Some(PathBuf::from("webapp/static/dump/anomalies.json")),
            listen_addr: Some("0.0.0.0:1500".to_string()),
            log_level: "info".to_string(),
            ensemble: EnsembleConfig::default(),
        }
    }
}

impl AnalyzerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.worker_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker_timeout_secs must be positive".into(),
            ));
        }
        if self.store_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "store_timeout_secs must be positive".into(),
            ));
        }
        if self.alerts.iter().any(|a| a.rule_id.trim().is_empty()) {
            return Err(ConfigError::Invalid("alert rule_id must not be empty".into()));
        }
        self.alert_rules()?;
        self.ensemble.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Key of the set listing every series.
    pub fn universe_key(&self) -> String {
        format!("{}unique_metrics", self.full_namespace)
    }

    /// Full store key of the canary series.
    pub fn canary_key(&self) -> Option<String> {
        self.canary_metric
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(|c| format!("{}{}", self.full_namespace, c))
    }

    pub fn alert_rules(&self) -> Result<Vec<AlertRule>, ConfigError> {
        self.alerts
            .iter()
            .map(|a| {
                AlertRule::compile(a).map_err(|e| {
                    ConfigError::Invalid(format!("alert pattern '{}': {}", a.pattern, e))
                })
            })
            .collect()
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            workers: self.workers,
            namespace: self.full_namespace.clone(),
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
        }
    }
}
