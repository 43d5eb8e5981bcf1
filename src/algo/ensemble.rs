//! Default ensemble classifier.
//!
//! Guards run first and short-circuit: a series that is too short, flat, or
//! stale is never handed to the vote functions. Surviving series get one vote
//! per configured algorithm and are anomalous when enough votes agree.

use super::votes;
use crate::classify::{ClassificationResult, Classifier, ClassifyError};
use crate::codec::SeriesPoint;
use serde::{Deserialize, Serialize};

type VoteFn = fn(&[SeriesPoint]) -> bool;

/// Names accepted in `EnsembleConfig::algorithms`.
pub const KNOWN_ALGORITHMS: [&str; 4] = [
    "median_absolute_deviation",
    "stddev_from_average",
    "stddev_from_moving_average",
    "histogram_bins",
];

fn lookup(name: &str) -> Option<VoteFn> {
    match name {
        "median_absolute_deviation" => Some(votes::median_absolute_deviation),
        "stddev_from_average" => Some(votes::stddev_from_average),
        "stddev_from_moving_average" => Some(votes::stddev_from_moving_average),
        "histogram_bins" => Some(votes::histogram_bins),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Fewer points than this is TooShort
    pub min_tolerable_length: usize,
    /// Window (in points) inspected for boredom
    pub max_tolerable_boredom: usize,
    /// Series whose boredom window holds exactly this many distinct values is Boring
    pub boredom_set_size: usize,
    /// Seconds since the last point after which a series is Stale; `None` disables
    pub stale_period_secs: Option<i64>,
    /// Votes required for an anomaly
    pub consensus: usize,
    pub algorithms: Vec<String>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_tolerable_length: 1,
            max_tolerable_boredom: 100,
            boredom_set_size: 1,
            stale_period_secs: Some(500),
            consensus: 3,
            algorithms: KNOWN_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.algorithms.is_empty() {
            return Err("ensemble needs at least one algorithm".into());
        }
        if let Some(unknown) = self.algorithms.iter().find(|a| lookup(a).is_none()) {
            return Err(format!("unknown algorithm '{}'", unknown));
        }
        if self.consensus == 0 || self.consensus > self.algorithms.len() {
            return Err(format!(
                "consensus {} must be between 1 and {}",
                self.consensus,
                self.algorithms.len()
            ));
        }
        Ok(())
    }
}

pub struct Ensemble {
    config: EnsembleConfig,
    members: Vec<VoteFn>,
    now: fn() -> i64,
}

impl Ensemble {
    /// Build from a validated config. Unknown algorithm names are skipped.
    pub fn new(config: EnsembleConfig) -> Self {
        let members = config.algorithms.iter().filter_map(|a| lookup(a)).collect();
        let config = EnsembleConfig {
            algorithms: config
                .algorithms
                .into_iter()
                .filter(|a| lookup(a).is_some())
                .collect(),
            ..config
        };

        Self {
            config,
            members,
            now: || chrono::Utc::now().timestamp(),
        }
    }

    /// Replace the wall clock used for staleness.
    pub fn with_clock(mut self, now: fn() -> i64) -> Self {
        self.now = now;
        self
    }

    fn is_boring(&self, series: &[SeriesPoint]) -> bool {
        let window = self.config.max_tolerable_boredom.max(1);
        let start = series.len().saturating_sub(window);
        let mut distinct: Vec<u64> = series[start..].iter().map(|p| p.value.to_bits()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.len() == self.config.boredom_set_size
    }
}

impl Classifier for Ensemble {
    fn algorithms(&self) -> &[String] {
        &self.config.algorithms
    }

    fn classify(
        &self,
        series: &[SeriesPoint],
        _name: &str,
    ) -> Result<ClassificationResult, ClassifyError> {
        if series.len() < self.config.min_tolerable_length.max(1) {
            return Err(ClassifyError::TooShort);
        }

        if self.is_boring(series) {
            return Err(ClassifyError::Boring);
        }

        // len >= 1 past the TooShort guard
        let last = series[series.len() - 1];

        if let Some(period) = self.config.stale_period_secs {
            if (self.now)().saturating_sub(last.timestamp) > period {
                return Err(ClassifyError::Stale);
            }
        }

        if let Some(bad) = series.iter().find(|p| !p.value.is_finite()) {
            return Err(ClassifyError::Other(format!(
                "non-finite value at {}",
                bad.timestamp
            )));
        }

        let votes: Vec<bool> = self.members.iter().map(|vote| vote(series)).collect();
        let agreeing = votes.iter().filter(|v| **v).count();

        Ok(ClassificationResult {
            is_anomalous: agreeing >= self.config.consensus,
            votes,
            representative: last,
        })
    }
}
