//! Classification port.
//!
//! The analyzer treats the anomaly ensemble as an opaque function: a series in,
//! a verdict plus per-algorithm votes out. `algo::Ensemble` is the bundled
//! implementation; anything implementing `Classifier` can replace it.

use crate::codec::SeriesPoint;
use std::fmt;

/// Verdict for one series in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub is_anomalous: bool,
    /// One vote per algorithm, aligned with `Classifier::algorithms()`
    pub votes: Vec<bool>,
    pub representative: SeriesPoint,
}

/// Why a series could not be classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyError {
    TooShort,
    /// No recent data
    Stale,
    /// Not enough variation to say anything
    Boring,
    Other(String),
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "series too short"),
            Self::Stale => write!(f, "series stale"),
            Self::Boring => write!(f, "series boring"),
            Self::Other(e) => write!(f, "classification failed: {}", e),
        }
    }
}

impl std::error::Error for ClassifyError {}

/// The ensemble behind the port. Called from blocking worker threads.
pub trait Classifier: Send + Sync {
    /// Algorithm names, indexed like `ClassificationResult::votes`
    fn algorithms(&self) -> &[String];

    fn classify(&self, series: &[SeriesPoint], name: &str)
    -> Result<ClassificationResult, ClassifyError>;
}
