//! Per-cycle counters.
//!
//! Workers fill private tallies and hand them back once; the aggregator folds
//! them together. Merging is plain addition, so completion order never matters.

use crate::classify::ClassifyError;
use crate::codec::CodecError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Why a series was not analyzed this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FailureCause {
    /// Missing or undecodable payload (including series removed mid-cycle)
    Malformed,
    TooShort,
    Stale,
    Boring,
    Other,
}

impl FailureCause {
    pub const ALL: [FailureCause; 5] = [
        Self::Malformed,
        Self::TooShort,
        Self::Stale,
        Self::Boring,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "Malformed",
            Self::TooShort => "TooShort",
            Self::Stale => "Stale",
            Self::Boring => "Boring",
            Self::Other => "Other",
        }
    }
}

impl From<&ClassifyError> for FailureCause {
    fn from(e: &ClassifyError) -> Self {
        match e {
            ClassifyError::TooShort => Self::TooShort,
            ClassifyError::Stale => Self::Stale,
            ClassifyError::Boring => Self::Boring,
            ClassifyError::Other(_) => Self::Other,
        }
    }
}

impl From<&CodecError> for FailureCause {
    fn from(_: &CodecError) -> Self {
        Self::Malformed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureTally(BTreeMap<FailureCause, u64>);

impl FailureTally {
    pub fn record(&mut self, cause: FailureCause) {
        self.add(cause, 1);
    }

    pub fn add(&mut self, cause: FailureCause, n: u64) {
        if n > 0 {
            *self.0.entry(cause).or_default() += n;
        }
    }

    pub fn get(&self, cause: FailureCause) -> u64 {
        self.0.get(&cause).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn merge(&mut self, other: &FailureTally) {
        for (&cause, &n) in &other.0 {
            self.add(cause, n);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FailureCause, u64)> + '_ {
        self.0.iter().map(|(c, n)| (*c, *n))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Count of anomalous series each algorithm voted for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoteTally(BTreeMap<String, u64>);

impl VoteTally {
    pub fn record(&mut self, algorithm: &str) {
        *self.0.entry(algorithm.to_string()).or_default() += 1;
    }

    pub fn get(&self, algorithm: &str) -> u64 {
        self.0.get(algorithm).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &VoteTally) {
        for (algorithm, &n) in &other.0 {
            *self.0.entry(algorithm.clone()).or_default() += n;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.0.iter().map(|(a, n)| (a.as_str(), *n))
    }

    pub fn max(&self) -> u64 {
        self.0.values().copied().max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
