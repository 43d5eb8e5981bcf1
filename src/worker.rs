//! Scan Worker
//!
//! One worker owns one contiguous slice of the metric universe for one cycle.
//! It fetches the whole slice in a single bulk read, then decodes and
//! classifies each series on a blocking thread. Per-series failures are
//! counted and skipped. Findings go out immediately on the shared queue;
//! tallies are returned once, when the slice is done.

use crate::classify::{Classifier, ClassifyError};
use crate::codec::{self, SeriesPoint};
use crate::error::StoreError;
use crate::metrics::CLASSIFY_LATENCY;
use crate::store::Store;
use crate::tally::{FailureCause, FailureTally, VoteTally};
use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An anomalous series, as published and alerted on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub point: SeriesPoint,
    /// Metric name with the namespace prefix removed
    pub metric: String,
}

/// Strip the first occurrence of `namespace` from a full metric name.
pub fn base_name(full: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        return full.to_string();
    }
    full.replacen(namespace, "", 1)
}

/// What a worker hands back when its slice is done.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub worker: usize,
    pub assigned: usize,
    pub analyzed: usize,
    pub anomalies: usize,
    pub failures: FailureTally,
    pub votes: VoteTally,
}

#[derive(Debug)]
pub enum WorkerError {
    Fetch(StoreError),
    /// Stopped early because the cycle was cancelled
    Cancelled { processed: usize },
    Join(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "bulk fetch failed: {}", e),
            Self::Cancelled { processed } => write!(f, "cancelled after {} series", processed),
            Self::Join(e) => write!(f, "worker thread failed: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

pub struct ScanWorker {
    id: usize,
    metrics: Vec<String>,
    namespace: String,
    store: Arc<dyn Store>,
    classifier: Arc<dyn Classifier>,
    findings: Sender<(usize, Finding)>,
    token: CancellationToken,
}

impl ScanWorker {
    pub fn new(
        id: usize,
        metrics: Vec<String>,
        namespace: String,
        store: Arc<dyn Store>,
        classifier: Arc<dyn Classifier>,
        findings: Sender<(usize, Finding)>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            metrics,
            namespace,
            store,
            classifier,
            findings,
            token,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Fetch the slice, then scan it off the async runtime.
    pub async fn run(self) -> Result<WorkerReport, WorkerError> {
        let raw = self
            .store
            .bulk_get(&self.metrics)
            .await
            .map_err(WorkerError::Fetch)?;

        tokio::task::spawn_blocking(move || self.scan(raw))
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))?
    }

    /// Decode and classify every assigned series, in order.
    pub fn scan(&self, raw: Vec<Option<Bytes>>) -> Result<WorkerReport, WorkerError> {
        let algorithms = self.classifier.algorithms();
        let mut report = WorkerReport {
            worker: self.id,
            assigned: self.metrics.len(),
            ..Default::default()
        };

        debug!(worker = self.id, assigned = report.assigned, "worker scanning");

        for (i, name) in self.metrics.iter().enumerate() {
            if self.token.is_cancelled() {
                return Err(WorkerError::Cancelled { processed: i });
            }

            let series = match codec::decode(raw.get(i).and_then(|b| b.as_deref())) {
                Ok(series) => series,
                Err(e) => {
                    debug!(worker = self.id, metric = %name, error = %e, "undecodable series");
                    report.failures.record(FailureCause::from(&e));
                    continue;
                }
            };

            let timer = CLASSIFY_LATENCY.start_timer();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.classifier.classify(&series, name)
            }))
            .unwrap_or_else(|panic| Err(ClassifyError::Other(panic_message(panic))));
            timer.observe_duration();

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    if let ClassifyError::Other(detail) = &e {
                        warn!(
                            worker = self.id,
                            metric = %name,
                            points = series.len(),
                            "classification failed: {}",
                            detail
                        );
                    }
                    report.failures.record(FailureCause::from(&e));
                    continue;
                }
            };

            report.analyzed += 1;
            if !result.is_anomalous {
                continue;
            }

            report.anomalies += 1;
            let finding = Finding {
                point: result.representative,
                metric: base_name(name, &self.namespace),
            };
            // receiver gone means the cycle already gave up on this worker
            let _ = self.findings.send((self.id, finding));

            for (idx, voted) in result.votes.iter().enumerate() {
                if *voted {
                    match algorithms.get(idx) {
                        Some(algorithm) => report.votes.record(algorithm),
                        None => warn!(worker = self.id, index = idx, "vote without algorithm name"),
                    }
                }
            }
        }

        Ok(report)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassificationResult;
    use crate::codec::encode_point;
    use crate::store::MemoryStore;
    use crossbeam_channel::unbounded;

    /// Classifies by metric name: `*.spike` anomalous, `*.flat` Boring,
    /// `*.short` TooShort, `*.boom` panics, `*.weird` Other.
    struct ByName {
        algorithms: Vec<String>,
    }

    impl ByName {
        fn new() -> Self {
            Self {
                algorithms: vec!["first".into(), "second".into()],
            }
        }
    }

    impl Classifier for ByName {
        fn algorithms(&self) -> &[String] {
            &self.algorithms
        }

        fn classify(
            &self,
            series: &[SeriesPoint],
            name: &str,
        ) -> Result<ClassificationResult, ClassifyError> {
            if name.ends_with(".flat") {
                return Err(ClassifyError::Boring);
            }
            if name.ends_with(".short") {
                return Err(ClassifyError::TooShort);
            }
            if name.ends_with(".weird") {
                return Err(ClassifyError::Other("bad shape".into()));
            }
            if name.ends_with(".boom") {
                panic!("algorithm blew up");
            }
            Ok(ClassificationResult {
                is_anomalous: name.ends_with(".spike"),
                votes: vec![true, false],
                representative: series[series.len() - 1],
            })
        }
    }

    fn payload() -> Bytes {
        let mut raw = encode_point(&SeriesPoint::new(100, 1.0));
        raw.extend(encode_point(&SeriesPoint::new(160, 9.0)));
        Bytes::from(raw)
    }

    fn worker(
        names: &[&str],
        tx: Sender<(usize, Finding)>,
        token: CancellationToken,
    ) -> ScanWorker {
        ScanWorker::new(
            1,
            names.iter().map(|s| s.to_string()).collect(),
            "metrics.".into(),
            Arc::new(MemoryStore::new()),
            Arc::new(ByName::new()),
            tx,
            token,
        )
    }

    #[test]
    fn test_base_name_strips_first_namespace_only() {
        assert_eq!(base_name("metrics.cpu.metrics.x", "metrics."), "cpu.metrics.x");
        assert_eq!(base_name("cpu", "metrics."), "cpu");
        assert_eq!(base_name("metrics.cpu", ""), "metrics.cpu");
    }

    #[test]
    fn test_failures_do_not_stop_the_batch() {
        let (tx, rx) = unbounded();
        let names = [
            "metrics.a.flat",
            "metrics.b.missing",
            "metrics.c.boom",
            "metrics.d.short",
            "metrics.e.weird",
            "metrics.f.spike",
            "metrics.g.calm",
        ];
        let mut raw: Vec<Option<Bytes>> = names.iter().map(|_| Some(payload())).collect();
        raw[1] = None;

        let report = worker(&names, tx, CancellationToken::new())
            .scan(raw)
            .unwrap();

        assert_eq!(report.assigned, 7);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failures.get(FailureCause::Boring), 1);
        assert_eq!(report.failures.get(FailureCause::Malformed), 1);
        assert_eq!(report.failures.get(FailureCause::TooShort), 1);
        assert_eq!(report.failures.get(FailureCause::Other), 2);
        assert_eq!(
            report.failures.total() + report.analyzed as u64,
            report.assigned as u64
        );

        let findings: Vec<_> = rx.try_iter().collect();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].0, 1);
        assert_eq!(findings[0].1.metric, "f.spike");
        assert_eq!(findings[0].1.point, SeriesPoint::new(160, 9.0));
        assert_eq!(report.votes.get("first"), 1);
        assert_eq!(report.votes.get("second"), 0);
    }

    #[test]
    fn test_short_fetch_counts_as_malformed() {
        let (tx, _rx) = unbounded();
        let report = worker(&["metrics.a.calm", "metrics.b.calm"], tx, CancellationToken::new())
            .scan(vec![Some(payload())])
            .unwrap();

        assert_eq!(report.analyzed, 1);
        assert_eq!(report.failures.get(FailureCause::Malformed), 1);
    }

    #[test]
    fn test_cancelled_worker_stops() {
        let (tx, _rx) = unbounded();
        let token = CancellationToken::new();
        token.cancel();

        let result = worker(&["metrics.a.spike"], tx, token).scan(vec![Some(payload())]);
        assert!(matches!(result, Err(WorkerError::Cancelled { processed: 0 })));
    }

    #[tokio::test]
    async fn test_run_uses_one_bulk_fetch() {
        let store = Arc::new(MemoryStore::new());
        store.insert("metrics.a.spike", payload());
        store.insert("metrics.b.calm", payload());

        let (tx, rx) = unbounded();
        let w = ScanWorker::new(
            3,
            vec!["metrics.a.spike".into(), "metrics.b.calm".into()],
            "metrics.".into(),
            store.clone(),
            Arc::new(ByName::new()),
            tx,
            CancellationToken::new(),
        );

        let report = w.run().await.unwrap();
        assert_eq!(store.bulk_get_calls(), 1);
        assert_eq!(report.worker, 3);
        assert_eq!(report.anomalies, 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[tokio::test]
    async fn test_run_reports_fetch_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);

        let (tx, _rx) = unbounded();
        let w = ScanWorker::new(
            1,
            vec!["metrics.a".into()],
            "metrics.".into(),
            store,
            Arc::new(ByName::new()),
            tx,
            CancellationToken::new(),
        );

        assert!(matches!(w.run().await, Err(WorkerError::Fetch(_))));
    }
}
