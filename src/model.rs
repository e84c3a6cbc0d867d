//! Core value types shared across the analysis pipeline.
//!
//! Everything here is an immutable value object: each pipeline stage consumes
//! a snapshot and produces a new one, so none of these types carry interior
//! mutability or shared state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Grouping dimensions accepted by the aggregation pipeline.
///
/// This is the allow-list from the configuration surface; anything else is
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Account,
    Service,
    Region,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Account => "account",
            Dimension::Service => "service",
            Dimension::Region => "region",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Dimension::Account),
            "service" => Ok(Dimension::Service),
            "region" => Ok(Dimension::Region),
            other => Err(ConfigError::UnknownDimension(other.to_string())),
        }
    }
}

/// Time-bucket size of collected samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

/// Composite identifier for a time series: an ordered list of
/// (dimension, value) pairs, e.g. `[(Service, "EC2"), (Account, "111")]`.
///
/// Ordering matters and comparison is case-sensitive exact match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    parts: Vec<(Dimension, String)>,
}

impl DimensionKey {
    pub fn new(parts: Vec<(Dimension, String)>) -> Self {
        Self { parts }
    }

    /// Value of one dimension, if present on this key.
    pub fn get(&self, dim: Dimension) -> Option<&str> {
        self.parts
            .iter()
            .find(|(d, _)| *d == dim)
            .map(|(_, v)| v.as_str())
    }

    pub fn parts(&self) -> &[(Dimension, String)] {
        &self.parts
    }

    /// Project this key onto the requested dimensions, preserving their
    /// order. Returns `None` when any requested dimension is missing, which
    /// marks the owning sample as malformed for that query.
    pub fn project(&self, dims: &[Dimension]) -> Option<DimensionKey> {
        let mut parts = Vec::with_capacity(dims.len());
        for dim in dims {
            parts.push((*dim, self.get(*dim)?.to_string()));
        }
        Some(DimensionKey::new(parts))
    }

    /// Colon-joined rendering of the dimension values, e.g. `"EC2:111"`.
    pub fn joined(&self) -> String {
        self.parts
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// One cost/usage observation for a dimension key at an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub key: DimensionKey,
    pub timestamp: DateTime<Utc>,
    pub cost: f64,
    pub usage: f64,
}

/// One utilization metric observation, e.g. CPU percentage at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A member account of the monitored organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

impl AccountInfo {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}
