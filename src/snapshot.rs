//! Snapshot publication.
//!
//! At the end of each cycle the findings are sorted by metric name and
//! published two ways: kept in memory for `GET /anomalies`, and written to the
//! dump file the dashboard polls, as `handle_data([[[ts, value], "name"], ...])`.

use crate::worker::Finding;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

/// One published cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub generated_at: i64,
    /// `[[timestamp, value], metric]`, sorted by metric
    pub anomalies: Vec<((i64, f64), String)>,
}

impl Snapshot {
    pub fn from_findings(mut findings: Vec<Finding>, generated_at: i64) -> Self {
        findings.sort_by(|a, b| a.metric.cmp(&b.metric));
        Self {
            generated_at,
            anomalies: findings
                .into_iter()
                .map(|f| ((f.point.timestamp, f.point.value), f.metric))
                .collect(),
        }
    }

    /// JSONP body for the dashboard.
    pub fn to_jsonp(&self) -> String {
        let body = serde_json::to_string(&self.anomalies).unwrap_or_else(|_| "[]".to_string());
        format!("handle_data({})", body)
    }
}

pub struct SnapshotPublisher {
    dump_path: Option<PathBuf>,
    latest: RwLock<Arc<Snapshot>>,
}

impl SnapshotPublisher {
    pub fn new(dump_path: Option<PathBuf>) -> Self {
        Self {
            dump_path,
            latest: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        match self.latest.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current snapshot. File errors are logged, not returned.
    pub async fn publish(&self, findings: Vec<Finding>) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::from_findings(
            findings,
            chrono::Utc::now().timestamp(),
        ));

        match self.latest.write() {
            Ok(mut slot) => *slot = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }

        if let Some(path) = &self.dump_path {
            match write_atomic(path, snapshot.to_jsonp().as_bytes()).await {
                Ok(()) => debug!(path = %path.display(), "anomaly dump written"),
                Err(e) => error!(path = %path.display(), error = %e, "cannot write anomaly dump"),
            }
        }

        snapshot
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
