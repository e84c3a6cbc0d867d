//! Costwatch - cloud cost and usage anomaly monitor
//!
//! This library aggregates billing and utilization samples from a
//! multi-account cloud organization, computes statistical baselines, flags
//! outliers, and composes ranked anomaly reports. Data collection is behind
//! the [`collector::TimeSeriesCollector`] seam; everything downstream is
//! pure, read-only computation over immutable snapshots.

pub mod aggregate;
pub mod anomaly;
pub mod cache;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod json_output;
pub mod model;
pub mod report;
pub mod retry;
pub mod stats;
