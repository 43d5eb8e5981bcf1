//! Series Codec
//!
//! The store keeps each series as a concatenated MessagePack stream of
//! `[timestamp, value]` pairs, appended by the ingestion side one point at a
//! time. This module only decodes; the analyzer never writes series.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One observation of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Unix seconds
    pub timestamp: i64,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Points ordered by timestamp ascending.
pub type Series = Vec<SeriesPoint>;

#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Key absent from the store (expired or removed between listing and fetch)
    Missing,
    /// Payload present but not a valid point stream
    Corrupt(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "series missing from store"),
            Self::Corrupt(e) => write!(f, "corrupt series payload: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode a raw payload into a series.
///
/// An empty payload is a valid, empty series; the classifier decides what
/// that means. Timestamps may be encoded as integers or floats.
pub fn decode(raw: Option<&[u8]>) -> Result<Series, CodecError> {
    let mut rd = raw.ok_or(CodecError::Missing)?;
    let mut series = Vec::new();

    while !rd.is_empty() {
        let (ts, value): (f64, f64) =
            rmp_serde::from_read(&mut rd).map_err(|e| CodecError::Corrupt(e.to_string()))?;
        series.push(SeriesPoint::new(ts as i64, value));
    }

    Ok(series)
}

/// Encode a single point the same way the ingestion side does.
///
/// Used for cooldown cache values and by tests to build fixtures.
pub fn encode_point(point: &SeriesPoint) -> Vec<u8> {
    // (i64, f64) always serializes
    rmp_serde::to_vec(&(point.timestamp, point.value)).unwrap_or_default()
}
