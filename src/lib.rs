//! VIA Analyzer
//!
//! Periodic scan-and-detect core: every cycle the full metric universe is read
//! from the store, split across workers, each series is classified, and the
//! anomalies are alerted on (with cooldown) and published as a snapshot.

pub mod aggregator;
pub mod alert;
pub mod algo;
pub mod classify;
pub mod codec;
pub mod config;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod partition;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod tally;
pub mod worker;

pub use aggregator::{AggregatorConfig, CycleAggregator, CycleResult};
pub use alert::{AlertGate, AlertRule, AlertRuleConfig, AlertStats, LogSink, NotificationSink, WebhookSink};
pub use algo::{Ensemble, EnsembleConfig};
pub use classify::{ClassificationResult, Classifier, ClassifyError};
pub use codec::{Series, SeriesPoint};
pub use config::AnalyzerConfig;
pub use error::{AnalyzerError, ConfigError, StoreError};
pub use liveness::LivenessProbe;
pub use metrics::{GraphiteSink, MetricsSink, NullSink};
pub use scheduler::{CanaryProjection, CycleOutcome, CyclePhase, CycleReport, CycleScheduler};
pub use snapshot::{Snapshot, SnapshotPublisher};
pub use store::{MemoryStore, RedisStore, Store};
pub use tally::{FailureCause, FailureTally, VoteTally};
pub use worker::Finding;
