//! Cycle Aggregator
//!
//! Runs one worker per partition, waits for all of them under a shared
//! deadline and folds their reports into a single cycle result. A worker that
//! never reports (timeout, panic, failed fetch) has its whole slice counted as
//! `Other`, and any findings it queued are dropped, so the cycle totals always
//! add up to the universe size.

use crate::classify::Classifier;
use crate::error::AnalyzerError;
use crate::metrics::WORKERS_LOST;
use crate::partition::partition;
use crate::store::Store;
use crate::tally::{FailureCause, FailureTally, VoteTally};
use crate::worker::{Finding, ScanWorker, WorkerError};
use crossbeam_channel::unbounded;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub workers: usize,
    /// Prefix stripped from metric names in findings
    pub namespace: String,
    /// Deadline for all workers of a cycle, measured from spawn
    pub worker_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            namespace: "metrics.".to_string(),
            worker_timeout: Duration::from_secs(600),
        }
    }
}

/// Merged outcome of one scan.
#[derive(Debug, Clone, Default)]
pub struct CycleResult {
    pub universe: usize,
    pub workers_spawned: usize,
    pub workers_lost: usize,
    pub failures: FailureTally,
    pub votes: VoteTally,
    /// Unordered; the snapshot sorts
    pub findings: Vec<Finding>,
}

impl CycleResult {
    /// Series that were classified (anomalous or not).
    pub fn analyzed(&self) -> u64 {
        (self.universe as u64).saturating_sub(self.failures.total())
    }
}

pub struct CycleAggregator {
    config: AggregatorConfig,
    store: Arc<dyn Store>,
    classifier: Arc<dyn Classifier>,
}

impl CycleAggregator {
    pub fn new(
        config: AggregatorConfig,
        store: Arc<dyn Store>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            config,
            store,
            classifier,
        }
    }

    pub async fn run(
        &self,
        universe: &[String],
        token: &CancellationToken,
    ) -> Result<CycleResult, AnalyzerError> {
        let ranges = partition(universe.len(), self.config.workers);
        if self.config.workers > universe.len() {
            warn!(
                configured = self.config.workers,
                metrics = universe.len(),
                "more workers configured than metrics to scan"
            );
        }

        let (tx, rx) = unbounded::<(usize, Finding)>();
        let mut pending = Vec::with_capacity(ranges.len());

        for (i, range) in ranges.iter().enumerate() {
            let id = i + 1;
            let child = token.child_token();
            let worker = ScanWorker::new(
                id,
                universe[range.clone()].to_vec(),
                self.config.namespace.clone(),
                self.store.clone(),
                self.classifier.clone(),
                tx.clone(),
                child.clone(),
            );
            pending.push((id, range.len(), child, tokio::spawn(worker.run())));
        }
        drop(tx);

        let mut result = CycleResult {
            universe: universe.len(),
            workers_spawned: pending.len(),
            ..Default::default()
        };
        debug!(workers = result.workers_spawned, "workers spawned");

        let deadline = Instant::now() + self.config.worker_timeout;
        let mut reported = HashSet::new();

        for (id, assigned, child, handle) in pending {
            let lost = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(report))) => {
                    result.failures.merge(&report.failures);
                    result.votes.merge(&report.votes);
                    reported.insert(id);
                    continue;
                }
                Ok(Ok(Err(WorkerError::Cancelled { .. }))) if token.is_cancelled() => {
                    return Err(AnalyzerError::ParentLost);
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(join)) => format!("worker task failed: {}", join),
                Err(_) => {
                    child.cancel();
                    format!("no report within {:?}", self.config.worker_timeout)
                }
            };

            error!(worker = id, assigned, reason = %lost, "worker lost, counting its slice as Other");
            WORKERS_LOST.inc();
            result.workers_lost += 1;
            result.failures.add(FailureCause::Other, assigned as u64);
        }

        if token.is_cancelled() {
            return Err(AnalyzerError::ParentLost);
        }

        let mut dropped = 0usize;
        for (worker, finding) in rx.try_iter() {
            if reported.contains(&worker) {
                result.findings.push(finding);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(dropped, "discarded findings from lost workers");
        }

        Ok(result)
    }
}
