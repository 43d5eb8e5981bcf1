//! Alert Gate
//!
//! Matches findings against alert rules and fires each (rule, metric) pair at
//! most once per cooldown window. The cooldown lives in the shared store as a
//! TTL key, so it survives restarts and is shared between analyzers.
//!
//! The cache write happens before dispatch. If dispatch then fails the alert
//! stays suppressed until the key expires: a missed alert is preferred over a
//! duplicate one.

use crate::codec::encode_point;
use crate::error::StoreError;
use crate::metrics::{ALERTS_DISPATCHED, ALERTS_FAILED, ALERTS_SUPPRESSED};
use crate::store::Store;
use crate::worker::Finding;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Alert rule as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    /// Regex tested at the start of the base metric name
    pub pattern: String,
    pub rule_id: String,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub rule_id: String,
    pub pattern: String,
    pub cooldown_secs: u64,
    regex: Regex,
}

impl AlertRule {
    /// Compile a rule. The pattern is anchored at the start of the name but
    /// not at the end, so `cpu` matches `cpu.user` and not `host.cpu`.
    pub fn compile(config: &AlertRuleConfig) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})", config.pattern))?;
        Ok(Self {
            rule_id: config.rule_id.clone(),
            pattern: config.pattern.clone(),
            cooldown_secs: config.cooldown_secs,
            regex,
        })
    }

    pub fn matches(&self, metric: &str) -> bool {
        self.regex.is_match(metric)
    }

    pub fn cooldown_key(&self, metric: &str) -> String {
        format!("last_alert.{}.{}", self.rule_id, metric)
    }
}

#[derive(Debug, Clone)]
pub enum AlertError {
    Store(StoreError),
    Dispatch(String),
}

impl fmt::Display for AlertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "cooldown cache: {}", e),
            Self::Dispatch(e) => write!(f, "dispatch failed: {}", e),
        }
    }
}

impl std::error::Error for AlertError {}

impl From<StoreError> for AlertError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Where fired alerts go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, rule: &AlertRule, finding: &Finding) -> Result<(), AlertError>;
}

/// Writes alerts to the log only.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn dispatch(&self, rule: &AlertRule, finding: &Finding) -> Result<(), AlertError> {
        warn!(
            rule = %rule.rule_id,
            metric = %finding.metric,
            timestamp = finding.point.timestamp,
            value = finding.point.value,
            "ANOMALY ALERT"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload<'a> {
    pub rule_id: &'a str,
    pub metric: &'a str,
    pub timestamp: i64,
    pub value: f64,
}

/// POSTs each alert as JSON to a fixed URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Dispatch(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn dispatch(&self, rule: &AlertRule, finding: &Finding) -> Result<(), AlertError> {
        let payload = AlertPayload {
            rule_id: &rule.rule_id,
            metric: &finding.metric,
            timestamp: finding.point.timestamp,
            value: finding.point.value,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AlertError::Dispatch(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::Dispatch(format!(
                "webhook returned {}",
                response.status()
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertStats {
    pub dispatched: u64,
    pub suppressed: u64,
    pub failed: u64,
}

enum Outcome {
    Dispatched,
    Suppressed,
}

pub struct AlertGate {
    rules: Vec<AlertRule>,
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
}

impl AlertGate {
    pub fn new(rules: Vec<AlertRule>, store: Arc<dyn Store>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { rules, store, sink }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Evaluate every rule against every finding. Errors are logged and
    /// counted; evaluation always runs to the end.
    pub async fn evaluate(&self, findings: &[Finding]) -> AlertStats {
        let mut stats = AlertStats::default();

        for rule in &self.rules {
            for finding in findings.iter().filter(|f| rule.matches(&f.metric)) {
                match self.fire(rule, finding).await {
                    Ok(Outcome::Dispatched) => {
                        ALERTS_DISPATCHED.inc();
                        stats.dispatched += 1;
                    }
                    Ok(Outcome::Suppressed) => {
                        ALERTS_SUPPRESSED.inc();
                        stats.suppressed += 1;
                    }
                    Err(e) => {
                        ALERTS_FAILED.inc();
                        stats.failed += 1;
                        error!(rule = %rule.rule_id, metric = %finding.metric, "couldn't send alert: {}", e);
                    }
                }
            }
        }

        stats
    }

    async fn fire(&self, rule: &AlertRule, finding: &Finding) -> Result<Outcome, AlertError> {
        let key = rule.cooldown_key(&finding.metric);

        if self.store.get(&key).await?.is_some() {
            debug!(rule = %rule.rule_id, metric = %finding.metric, "alert cooling down");
            return Ok(Outcome::Suppressed);
        }

        self.store
            .set_with_ttl(&key, Bytes::from(encode_point(&finding.point)), rule.cooldown_secs)
            .await?;
        self.sink.dispatch(rule, finding).await?;
        Ok(Outcome::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SeriesPoint;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl Recording {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for Recording {
        async fn dispatch(&self, rule: &AlertRule, finding: &Finding) -> Result<(), AlertError> {
            if self.fail {
                return Err(AlertError::Dispatch("smtp down".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((rule.rule_id.clone(), finding.metric.clone()));
            Ok(())
        }
    }

    fn rule(pattern: &str, rule_id: &str, cooldown_secs: u64) -> AlertRule {
        AlertRule::compile(&AlertRuleConfig {
            pattern: pattern.into(),
            rule_id: rule_id.into(),
            cooldown_secs,
        })
        .unwrap()
    }

    fn finding(metric: &str) -> Finding {
        Finding {
            point: SeriesPoint::new(1_700_000_000, 42.0),
            metric: metric.into(),
        }
    }

    #[test]
    fn test_match_is_prefix_anchored() {
        let r = rule("cpu", "smtp", 60);
        assert!(r.matches("cpu.user"));
        assert!(r.matches("cpu"));
        assert!(!r.matches("host.cpu"));

        let r = rule("stats\\..*\\.errors", "smtp", 60);
        assert!(r.matches("stats.api.errors.rate"));
        assert!(!r.matches("app.stats.api.errors"));

        let any = rule(".*", "smtp", 60);
        assert!(any.matches("anything.at.all"));
    }

    #[test]
    fn test_alternation_stays_anchored() {
        let r = rule("a|b", "smtp", 60);
        assert!(r.matches("b.metric"));
        assert!(!r.matches("x.b"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(
            AlertRule::compile(&AlertRuleConfig {
                pattern: "(".into(),
                rule_id: "smtp".into(),
                cooldown_secs: 60,
            })
            .is_err()
        );
    }

    #[test]
    fn test_cooldown_key() {
        assert_eq!(
            rule(".*", "pagerduty", 60).cooldown_key("cpu.user"),
            "last_alert.pagerduty.cpu.user"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_within_window() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(Recording::default());
        let gate = AlertGate::new(vec![rule("cpu", "smtp", 300)], store, sink.clone());

        let first = gate.evaluate(&[finding("cpu.user")]).await;
        tokio::time::advance(Duration::from_secs(120)).await;
        let second = gate.evaluate(&[finding("cpu.user")]).await;

        assert_eq!(first.dispatched, 1);
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.suppressed, 1);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_again_after_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(Recording::default());
        let gate = AlertGate::new(vec![rule("cpu", "smtp", 300)], store, sink.clone());

        gate.evaluate(&[finding("cpu.user")]).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        gate.evaluate(&[finding("cpu.user")]).await;

        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_is_per_rule_and_metric() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(Recording::default());
        let gate = AlertGate::new(
            vec![rule("cpu", "smtp", 300), rule(".*", "pagerduty", 300)],
            store,
            sink.clone(),
        );

        let stats = gate
            .evaluate(&[finding("cpu.user"), finding("cpu.system"), finding("disk.io")])
            .await;

        assert_eq!(stats.dispatched, 5);
        assert_eq!(
            sink.sent(),
            vec![
                ("smtp".to_string(), "cpu.user".to_string()),
                ("smtp".to_string(), "cpu.system".to_string()),
                ("pagerduty".to_string(), "cpu.user".to_string()),
                ("pagerduty".to_string(), "cpu.system".to_string()),
                ("pagerduty".to_string(), "disk.io".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_cools_down() {
        let store = Arc::new(MemoryStore::new());
        let failing = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let gate = AlertGate::new(vec![rule("cpu", "smtp", 300)], store.clone(), failing);

        let stats = gate.evaluate(&[finding("cpu.user")]).await;
        assert_eq!(stats.failed, 1);

        let sink = Arc::new(Recording::default());
        let retry = AlertGate::new(vec![rule("cpu", "smtp", 300)], store, sink.clone());
        let stats = retry.evaluate(&[finding("cpu.user")]).await;
        assert_eq!(stats.suppressed, 1);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_do_not_abort_evaluation() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let sink = Arc::new(Recording::default());
        let gate = AlertGate::new(
            vec![rule("cpu", "smtp", 300), rule("disk", "smtp", 300)],
            store,
            sink.clone(),
        );

        let stats = gate.evaluate(&[finding("cpu.user"), finding("disk.io")]).await;
        assert_eq!(stats.failed, 2);
        assert!(sink.sent().is_empty());
    }
}
