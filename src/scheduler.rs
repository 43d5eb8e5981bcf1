//! Cycle Scheduler
//!
//! Drives the analyzer forever, one cycle at a time:
//!
//! ```text
//! Idle -> Scanning -> Aggregating -> Alerting -> Publishing -> Sleeping -> Idle
//! ```
//!
//! Idle checks the store and fetches the metric universe. An unreachable
//! store or an empty universe ends the cycle early with a fixed backoff. Once
//! the scan is merged, findings go through the alert gate (when enabled), are
//! published as the new snapshot and the cycle numbers are emitted. Fast
//! cycles are followed by an extra pause so the store is not hammered.
//!
//! Cancellation comes only from the liveness token; every boundary and every
//! sleep checks it.

use crate::aggregator::{CycleAggregator, CycleResult};
use crate::alert::{AlertGate, AlertStats, NotificationSink};
use crate::classify::Classifier;
use crate::codec::decode;
use crate::config::AnalyzerConfig;
use crate::error::{AnalyzerError, ConfigError};
use crate::liveness::LivenessProbe;
use crate::metrics::{
    ANOMALIES, CYCLE_DURATION, CYCLES_TOTAL, FAILURES, MetricsSink, SERIES_ANALYZED,
    SERIES_TOTAL, STORE_ERRORS, VOTES, metric_prefix,
};
use crate::snapshot::SnapshotPublisher;
use crate::store::Store;
use crate::tally::{FailureCause, FailureTally, VoteTally};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Scanning,
    Aggregating,
    Alerting,
    Publishing,
    Sleeping,
}

/// Full-scan estimate derived from the canary series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanaryProjection {
    /// Time span covered by the canary, in hours
    pub duration: f64,
    /// Seconds a scan would take over a day-long window; absent for a zero span
    pub projected: Option<f64>,
}

/// `duration = span / 3600`, `projected = 24 * elapsed / duration`.
pub fn canary_projection(span_secs: i64, elapsed_secs: f64) -> CanaryProjection {
    let duration = span_secs.max(0) as f64 / 3600.0;
    let projected = (duration > 0.0).then(|| 24.0 * elapsed_secs / duration);
    CanaryProjection {
        duration,
        projected,
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub id: Uuid,
    pub elapsed: Duration,
    pub total: usize,
    pub analyzed: u64,
    pub anomalies: usize,
    pub workers_spawned: usize,
    pub workers_lost: usize,
    pub failures: FailureTally,
    pub votes: VoteTally,
    /// `None` when alerting is disabled
    pub alerts: Option<AlertStats>,
    pub canary: Option<CanaryProjection>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Ping or universe fetch failed; retry after `store_retry_secs`
    StoreUnavailable,
    /// Nothing to scan; retry after `empty_universe_sleep_secs`
    EmptyUniverse,
    Completed(CycleReport),
}

pub struct CycleScheduler {
    config: AnalyzerConfig,
    universe_key: String,
    canary_key: Option<String>,
    prefix: String,
    store: Arc<dyn Store>,
    aggregator: CycleAggregator,
    gate: Option<AlertGate>,
    sink: Arc<dyn MetricsSink>,
    publisher: Arc<SnapshotPublisher>,
    probe: Option<LivenessProbe>,
    phase: RwLock<CyclePhase>,
}

impl CycleScheduler {
    pub fn new(
        config: AnalyzerConfig,
        store: Arc<dyn Store>,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn MetricsSink>,
        publisher: Arc<SnapshotPublisher>,
    ) -> Self {
        let aggregator = CycleAggregator::new(config.aggregator(), store.clone(), classifier);
        Self {
            universe_key: config.universe_key(),
            canary_key: config.canary_key(),
            prefix: metric_prefix(&config.metric_prefix, config.server_name.as_deref()),
            config,
            store,
            aggregator,
            gate: None,
            sink,
            publisher,
            probe: None,
            phase: RwLock::new(CyclePhase::Idle),
        }
    }

    /// Attach the alert gate. No-op unless `enable_alerts` is set.
    pub fn with_alerts(mut self, notifier: Arc<dyn NotificationSink>) -> Result<Self, ConfigError> {
        if self.config.enable_alerts {
            let rules = self.config.alert_rules()?;
            info!(rules = rules.len(), "alerting enabled");
            self.gate = Some(AlertGate::new(rules, self.store.clone(), notifier));
        }
        Ok(self)
    }

    pub fn with_probe(mut self, probe: LivenessProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn phase(&self) -> CyclePhase {
        match self.phase.read() {
            Ok(p) => *p,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        debug!(?phase, "phase");
        match self.phase.write() {
            Ok(mut p) => *p = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
    }

    // ========================================================================
    // LOOP
    // ========================================================================

    /// Run cycles until the token is cancelled or the probe fails. Only ever
    /// returns an error; `ParentLost` is the normal way out.
    pub async fn run(&self, token: CancellationToken) -> Result<(), AnalyzerError> {
        loop {
            self.ensure_alive(&token)?;

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AnalyzerError::ParentLost),
                outcome = self.run_cycle(&token) => outcome?,
            };

            self.ensure_alive(&token)?;
            self.set_phase(CyclePhase::Sleeping);

            match outcome {
                CycleOutcome::StoreUnavailable => {
                    self.pause(Duration::from_secs(self.config.store_retry_secs), &token)
                        .await?;
                    match self.store.reconnect().await {
                        Ok(()) => info!("store connection re-established"),
                        Err(e) => error!(error = %e, "store reconnect failed"),
                    }
                }
                CycleOutcome::EmptyUniverse => {
                    let wait = Duration::from_secs(self.config.empty_universe_sleep_secs);
                    info!(?wait, "no metrics to analyze, sleeping");
                    self.pause(wait, &token).await?;
                }
                CycleOutcome::Completed(report) => {
                    let floor = Duration::from_secs(self.config.min_cycle_secs);
                    if report.elapsed < floor {
                        let wait = Duration::from_secs(self.config.low_runtime_sleep_secs);
                        info!(elapsed = ?report.elapsed, ?wait, "cycle finished fast, sleeping");
                        self.pause(wait, &token).await?;
                    }
                }
            }
        }
    }

    fn ensure_alive(&self, token: &CancellationToken) -> Result<(), AnalyzerError> {
        if token.is_cancelled() {
            return Err(AnalyzerError::ParentLost);
        }
        if let Some(probe) = &self.probe {
            if !probe.check() {
                error!("parent process is gone, stopping");
                token.cancel();
                return Err(AnalyzerError::ParentLost);
            }
        }
        Ok(())
    }

    async fn pause(&self, wait: Duration, token: &CancellationToken) -> Result<(), AnalyzerError> {
        tokio::select! {
            _ = token.cancelled() => Err(AnalyzerError::ParentLost),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    // ========================================================================
    // CYCLE
    // ========================================================================

    /// One pass from Idle through Publishing. Store trouble and an empty
    /// universe are outcomes, not errors.
    pub async fn run_cycle(&self, token: &CancellationToken) -> Result<CycleOutcome, AnalyzerError> {
        let id = Uuid::new_v4();
        let span = info_span!("cycle", id = %id);
        self.cycle(id, token).instrument(span).await
    }

    async fn cycle(&self, id: Uuid, token: &CancellationToken) -> Result<CycleOutcome, AnalyzerError> {
        let started = Instant::now();
        self.set_phase(CyclePhase::Idle);

        if let Err(e) = self.store.ping().await {
            STORE_ERRORS.inc();
            error!(error = %e, "can't connect to store");
            return Ok(CycleOutcome::StoreUnavailable);
        }

        let mut universe = match self.store.members(&self.universe_key).await {
            Ok(members) => members,
            Err(e) => {
                STORE_ERRORS.inc();
                error!(key = %self.universe_key, error = %e, "can't fetch metric universe");
                return Ok(CycleOutcome::StoreUnavailable);
            }
        };
        if universe.is_empty() {
            info!(key = %self.universe_key, "metric universe is empty");
            return Ok(CycleOutcome::EmptyUniverse);
        }
        // set order is arbitrary; sorting keeps partitions reproducible
        universe.sort_unstable();

        self.set_phase(CyclePhase::Scanning);
        let result = self.aggregator.run(&universe, token).await?;

        self.set_phase(CyclePhase::Aggregating);
        let CycleResult {
            universe: total,
            workers_spawned,
            workers_lost,
            failures,
            votes,
            findings,
        } = result;
        let analyzed = (total as u64).saturating_sub(failures.total());
        let anomalies = findings.len();

        let alerts = match &self.gate {
            Some(gate) => {
                self.set_phase(CyclePhase::Alerting);
                Some(gate.evaluate(&findings).await)
            }
            None => None,
        };

        self.set_phase(CyclePhase::Publishing);
        // the finding list ends here
        self.publisher.publish(findings).await;

        let elapsed = started.elapsed();
        let canary = self.canary(elapsed).await;

        let report = CycleReport {
            id,
            elapsed,
            total,
            analyzed,
            anomalies,
            workers_spawned,
            workers_lost,
            failures,
            votes,
            alerts,
            canary,
        };
        self.log_summary(&report);
        self.emit(&report).await;

        Ok(CycleOutcome::Completed(report))
    }

    async fn canary(&self, elapsed: Duration) -> Option<CanaryProjection> {
        let key = self.canary_key.as_ref()?;
        let raw = match self.store.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(key = %key, error = %e, "canary fetch failed");
                return None;
            }
        };
        let series = decode(raw.as_deref()).ok()?;
        let (first, last) = (series.first()?, series.last()?);
        Some(canary_projection(
            last.timestamp.saturating_sub(first.timestamp),
            elapsed.as_secs_f64(),
        ))
    }

    fn log_summary(&self, report: &CycleReport) {
        info!(
            seconds = report.elapsed.as_secs_f64(),
            total = report.total,
            analyzed = report.analyzed,
            anomalies = report.anomalies,
            workers = report.workers_spawned,
            "cycle complete"
        );
        let failures: Vec<String> = report
            .failures
            .iter()
            .map(|(cause, n)| format!("{}={}", cause.as_str(), n))
            .collect();
        let votes: Vec<String> = report
            .votes
            .iter()
            .map(|(alg, n)| format!("{}={}", alg, n))
            .collect();
        info!(failures = %failures.join(","), votes = %votes.join(","), "cycle breakdown");
        if report.workers_lost > 0 {
            warn!(lost = report.workers_lost, "workers did not report");
        }
        if let Some(canary) = report.canary {
            info!(duration_hours = canary.duration, projected = ?canary.projected, "canary");
        }
    }

    async fn emit(&self, report: &CycleReport) {
        CYCLES_TOTAL.inc();
        CYCLE_DURATION.observe(report.elapsed.as_secs_f64());
        SERIES_TOTAL.set(report.total as f64);
        SERIES_ANALYZED.set(report.analyzed as f64);
        ANOMALIES.set(report.anomalies as f64);
        for cause in FailureCause::ALL {
            FAILURES
                .with_label_values(&[cause.as_str()])
                .set(report.failures.get(cause) as f64);
        }
        VOTES.reset();
        for (alg, n) in report.votes.iter() {
            VOTES.with_label_values(&[alg]).set(n as f64);
        }

        let p = &self.prefix;
        let sink = &self.sink;
        sink.emit(&format!("{p}run_time"), report.elapsed.as_secs_f64()).await;
        sink.emit(&format!("{p}total_analyzed"), report.analyzed as f64).await;
        sink.emit(&format!("{p}total_anomalies"), report.anomalies as f64).await;
        sink.emit(&format!("{p}total_metrics"), report.total as f64).await;
        for (cause, n) in report.failures.iter() {
            sink.emit(&format!("{p}exceptions.{}", cause.as_str()), n as f64).await;
        }
        for (alg, n) in report.votes.iter() {
            sink.emit(&format!("{p}anomaly_breakdown.{}", alg), n as f64).await;
        }
        if let Some(canary) = report.canary {
            sink.emit(&format!("{p}duration"), canary.duration).await;
            if let Some(projected) = canary.projected {
                sink.emit(&format!("{p}projected"), projected).await;
            }
        }
        if let Some(stats) = report.alerts {
            sink.emit(&format!("{p}alerts.dispatched"), stats.dispatched as f64).await;
            sink.emit(&format!("{p}alerts.suppressed"), stats.suppressed as f64).await;
            sink.emit(&format!("{p}alerts.failed"), stats.failed as f64).await;
        }
    }
}
