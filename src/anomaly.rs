//! Anomaly classification over cost and usage series.
//!
//! Four detectors run independently: cost spikes/drops, usage-metric
//! deviations, newly appeared services, and stopped services. All z-score
//! detectors share a single threshold knob derived from the configured
//! sensitivity. A failure in one category never blocks the others; only
//! access-denied failures abort the run.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::aggregate;
use crate::collector::{parallel_fetch_metrics, CostQuery, MetricQuery, TimeSeriesCollector};
use crate::error::CollectorError;
use crate::model::{Dimension, DimensionKey, Granularity};
use crate::retry::RetryPolicy;
use crate::stats::{compute_baseline, recent_window_len, MIN_SAMPLES};

/// Per-category report caps.
pub const MAX_COST_ANOMALIES: usize = 20;
pub const MAX_USAGE_ANOMALIES: usize = 15;
pub const MAX_NEW_SERVICES: usize = 10;
pub const MAX_STOPPED_SERVICES: usize = 10;

/// Recent cost below this is noise, not a new service.
const NEW_SERVICE_COST_FLOOR: f64 = 1.0;
/// New services above this recent cost report as high severity.
const NEW_SERVICE_HIGH_COST: f64 = 100.0;
/// Baseline cost below this never reports as stopped.
const STOPPED_BASELINE_FLOOR: f64 = 10.0;
/// A service is stopped when recent cost falls under this share of baseline.
const STOPPED_RECENT_RATIO: f64 = 0.1;

/// Usage detection only checks the first few accounts.
const USAGE_ACCOUNT_LIMIT: usize = 5;

/// Utilization metrics checked per resource type.
const SERVICE_METRICS: &[(&str, &[&str])] = &[
    ("EC2", &["CPUUtilization", "NetworkIn", "NetworkOut"]),
    ("Lambda", &["Invocations", "Errors", "Duration"]),
    ("RDS", &["CPUUtilization", "DatabaseConnections"]),
];

/// Detection sensitivity. Maps to the z-score threshold shared by every
/// z-score-based detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    /// Higher sensitivity means a lower threshold and more findings.
    pub fn threshold(self) -> f64 {
        match self {
            Sensitivity::Low => 3.0,
            Sensitivity::Medium => 2.0,
            Sensitivity::High => 1.5,
        }
    }
}

/// Severity tier, ranked for sorting and weighted for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Sort rank, most severe first.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Info => 4,
        }
    }

    /// Contribution to the report-level severity score.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Critical => 10.0,
            Severity::High => 5.0,
            Severity::Medium => 2.0,
            Severity::Low => 1.0,
            Severity::Info => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

/// What kind of deviation a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    CostSpike,
    CostDrop,
    NewService,
    StoppedService,
    UsageDeviation,
}

/// A single finding. Created fresh on each run, consumed by the report
/// composer, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub key: DimensionKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub observed_value: f64,
    pub baseline_value: f64,
    /// Z-score for statistical detectors; a currency amount for the
    /// set-membership detectors (new: recent cost, stopped: savings).
    pub deviation_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_percentage: Option<f64>,
    pub severity: Severity,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savings: Option<f64>,
}

/// Pick the severity tier from |z| and |change%|.
///
/// Tiers are checked from critical down and the two conditions are OR'd
/// within a tier, so severity is monotonic in both inputs.
pub fn classify_severity(z_score: f64, change_pct: f64) -> Severity {
    let abs_z = z_score.abs();
    let abs_change = change_pct.abs();

    if abs_z > 4.0 || abs_change > 100.0 {
        Severity::Critical
    } else if abs_z > 3.0 || abs_change > 50.0 {
        Severity::High
    } else if abs_z > 2.0 || abs_change > 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Heuristic confidence in [0, 1]: larger samples and lower variance score
/// higher. Not a p-value.
pub fn confidence(sample_count: usize, std_dev: f64) -> f64 {
    let size_factor = (sample_count as f64 / 100.0).min(1.0);
    let variance_factor = 1.0 / (1.0 + std_dev);
    (size_factor * variance_factor * 100.0).round() / 100.0
}

/// Sort by (severity rank, |deviation| descending) and truncate.
pub fn rank_anomalies(anomalies: &mut Vec<Anomaly>, limit: usize) {
    anomalies.sort_by(|a, b| {
        a.severity.rank().cmp(&b.severity.rank()).then(
            b.deviation_score
                .abs()
                .partial_cmp(&a.deviation_score.abs())
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    anomalies.truncate(limit);
}

/// Flag spike/drop points in one series' recent window against a baseline
/// computed over the whole series.
pub fn detect_series_anomalies(
    key: &DimensionKey,
    points: &[(DateTime<Utc>, f64)],
    threshold: f64,
) -> Vec<Anomaly> {
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let Some(baseline) = compute_baseline(&values) else {
        return Vec::new();
    };

    let recent = recent_window_len(points.len());
    let mut anomalies = Vec::new();
    for &(timestamp, value) in &points[points.len() - recent..] {
        let z_score = baseline.z_score(value);
        if z_score.abs() <= threshold {
            continue;
        }
        let change_pct = baseline.change_percentage(value);
        let kind = if z_score > 0.0 {
            AnomalyKind::CostSpike
        } else {
            AnomalyKind::CostDrop
        };
        let direction = if z_score > 0.0 { "above" } else { "below" };
        anomalies.push(Anomaly {
            kind,
            key: key.clone(),
            metric: None,
            observed_value: value,
            baseline_value: baseline.mean,
            deviation_score: z_score,
            change_percentage: Some(change_pct),
            severity: classify_severity(z_score, change_pct),
            confidence: confidence(baseline.sample_count, baseline.std_dev),
            timestamp,
            description: format!(
                "Cost for {} is {:.1} standard deviations {} baseline",
                key,
                z_score.abs(),
                direction
            ),
            daily_rate: None,
            savings: None,
        });
    }
    anomalies
}

/// Everything the four detectors produced in one run, with per-category
/// failure notes for the categories that soft-failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorizedAnomalies {
    pub cost_anomalies: Vec<Anomaly>,
    pub usage_anomalies: Vec<Anomaly>,
    pub new_services: Vec<Anomaly>,
    pub stopped_services: Vec<Anomaly>,
    pub category_errors: BTreeMap<String, String>,
}

/// Drives the detectors against a collector with a fixed threshold.
pub struct AnomalyDetector<'a, C: TimeSeriesCollector + Sync + ?Sized> {
    collector: &'a C,
    threshold: f64,
    retry: RetryPolicy,
    max_workers: usize,
}

impl<'a, C: TimeSeriesCollector + Sync + ?Sized> AnomalyDetector<'a, C> {
    pub fn new(collector: &'a C, sensitivity: Sensitivity) -> Self {
        Self {
            collector,
            threshold: sensitivity.threshold(),
            retry: RetryPolicy::default(),
            max_workers: 10,
        }
    }

    /// Override the sensitivity-derived threshold with an explicit value.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Run all four categories. A category failure is logged and leaves that
    /// category empty, except access-denied which aborts the whole run.
    pub fn detect_all(
        &self,
        now: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<CategorizedAnomalies, CollectorError> {
        let mut errors = BTreeMap::new();

        let cost_anomalies = soft_fail(
            &mut errors,
            "cost_anomalies",
            self.detect_cost_anomalies(now, lookback_hours),
        )?;
        let usage_anomalies = soft_fail(
            &mut errors,
            "usage_anomalies",
            self.detect_usage_anomalies(now, lookback_hours),
        )?;
        let new_services = soft_fail(
            &mut errors,
            "new_services",
            self.detect_new_services(now, lookback_hours),
        )?;
        let stopped_services = soft_fail(
            &mut errors,
            "stopped_services",
            self.detect_stopped_services(now, lookback_hours),
        )?;

        Ok(CategorizedAnomalies {
            cost_anomalies,
            usage_anomalies,
            new_services,
            stopped_services,
            category_errors: errors,
        })
    }

    /// Statistical spike/drop detection per (service, account) series.
    pub fn detect_cost_anomalies(
        &self,
        now: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<Vec<Anomaly>, CollectorError> {
        let granularity = if lookback_hours <= 48 {
            Granularity::Hourly
        } else {
            Granularity::Daily
        };
        let group_by = [Dimension::Service, Dimension::Account];
        let query = CostQuery {
            start: now - Duration::hours(i64::from(lookback_hours)),
            end: now,
            granularity,
            group_by: group_by.to_vec(),
            filter: Vec::new(),
        };
        let samples = self
            .retry
            .run("cost series", || self.collector.fetch_cost_usage(&query))?;
        let breakdown = aggregate::aggregate(&samples, &group_by);

        let mut anomalies = Vec::new();
        for (key, points) in &breakdown.series {
            let cost_points: Vec<(DateTime<Utc>, f64)> =
                points.iter().map(|p| (p.timestamp, p.cost)).collect();
            anomalies.extend(detect_series_anomalies(key, &cost_points, self.threshold));
        }
        rank_anomalies(&mut anomalies, MAX_COST_ANOMALIES);
        Ok(anomalies)
    }

    /// Z-score deviation of the most recent value per
    /// (resource type, account, metric) triple.
    pub fn detect_usage_anomalies(
        &self,
        now: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<Vec<Anomaly>, CollectorError> {
        let accounts = self
            .retry
            .run("account list", || self.collector.fetch_accounts())?;
        let mut account_ids: Vec<String> = accounts
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.id.clone())
            .collect();
        if account_ids.len() > USAGE_ACCOUNT_LIMIT {
            debug!(
                "limiting usage detection to {} of {} accounts",
                USAGE_ACCOUNT_LIMIT,
                account_ids.len()
            );
            account_ids.truncate(USAGE_ACCOUNT_LIMIT);
        }

        let start = now - Duration::hours(i64::from(lookback_hours));
        let mut queries = Vec::new();
        for (service, metrics) in SERVICE_METRICS {
            for metric in *metrics {
                for account_id in &account_ids {
                    queries.push(MetricQuery {
                        resource_type: (*service).to_string(),
                        account_id: account_id.clone(),
                        metric: (*metric).to_string(),
                        start,
                        end: now,
                        period_seconds: 3600,
                    });
                }
            }
        }

        let merged =
            parallel_fetch_metrics(self.collector, queries, self.max_workers, &self.retry)?;
        // BTreeMap gives a stable evaluation order regardless of worker
        // completion order.
        let merged: BTreeMap<_, _> = merged.into_iter().collect();

        let mut anomalies = Vec::new();
        for ((account_id, resource_type, metric), points) in merged {
            if points.len() < MIN_SAMPLES {
                continue;
            }
            let values: Vec<f64> = points.iter().map(|p| p.value).collect();
            let Some(baseline) = compute_baseline(&values) else {
                continue;
            };
            let last = points[points.len() - 1];
            let z_score = baseline.z_score(last.value);
            if z_score.abs() <= self.threshold {
                continue;
            }
            let key = DimensionKey::new(vec![
                (Dimension::Service, resource_type.clone()),
                (Dimension::Account, account_id.clone()),
            ]);
            anomalies.push(Anomaly {
                kind: AnomalyKind::UsageDeviation,
                key,
                metric: Some(metric.clone()),
                observed_value: last.value,
                baseline_value: baseline.mean,
                deviation_score: z_score,
                change_percentage: None,
                severity: classify_severity(z_score, 0.0),
                confidence: confidence(baseline.sample_count, baseline.std_dev),
                timestamp: last.timestamp,
                description: format!(
                    "{} for {} is {:.1} standard deviations from normal",
                    metric, resource_type, z_score
                ),
                daily_rate: None,
                savings: None,
            });
        }
        rank_anomalies(&mut anomalies, MAX_USAGE_ANOMALIES);
        Ok(anomalies)
    }

    /// Keys billed in the recent window but absent from a disjoint earlier
    /// baseline window twice as long.
    pub fn detect_new_services(
        &self,
        now: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<Vec<Anomaly>, CollectorError> {
        let recent_start = now - Duration::hours(i64::from(lookback_hours));
        let baseline_start = recent_start - Duration::hours(i64::from(lookback_hours) * 2);

        let recent = self.fetch_window_costs(recent_start, now)?;
        let baseline = self.fetch_window_costs(baseline_start, recent_start)?;
        let baseline_keys: HashSet<&String> = baseline.keys().collect();

        let mut anomalies = Vec::new();
        for (joined, (key, cost)) in &recent {
            if baseline_keys.contains(joined) {
                continue;
            }
            if *cost <= NEW_SERVICE_COST_FLOOR {
                continue;
            }
            let severity = if *cost > NEW_SERVICE_HIGH_COST {
                Severity::High
            } else {
                Severity::Medium
            };
            let service = key.get(Dimension::Service).unwrap_or("unknown");
            let account = key.get(Dimension::Account).unwrap_or("unknown");
            anomalies.push(Anomaly {
                kind: AnomalyKind::NewService,
                key: key.clone(),
                metric: None,
                observed_value: *cost,
                baseline_value: 0.0,
                deviation_score: *cost,
                change_percentage: None,
                severity,
                confidence: 1.0,
                timestamp: recent_start,
                description: format!(
                    "New service {} detected in account {}",
                    service, account
                ),
                daily_rate: Some(cost / (f64::from(lookback_hours) / 24.0)),
                savings: None,
            });
        }
        rank_anomalies(&mut anomalies, MAX_NEW_SERVICES);
        Ok(anomalies)
    }

    /// Keys whose recent cost collapsed below a tenth of their baseline
    /// spend. The baseline window ends exactly where the 24h recent window
    /// begins; the windows never overlap.
    pub fn detect_stopped_services(
        &self,
        now: DateTime<Utc>,
        lookback_hours: u32,
    ) -> Result<Vec<Anomaly>, CollectorError> {
        let recent_start = now - Duration::hours(24);
        let baseline_start = recent_start - Duration::hours(i64::from(lookback_hours));

        let baseline = self.fetch_window_costs(baseline_start, recent_start)?;
        let recent = self.fetch_window_costs(recent_start, now)?;

        let mut anomalies = Vec::new();
        for (joined, (key, baseline_cost)) in &baseline {
            if *baseline_cost <= STOPPED_BASELINE_FLOOR {
                continue;
            }
            let recent_cost = recent.get(joined).map(|(_, c)| *c).unwrap_or(0.0);
            if recent_cost >= baseline_cost * STOPPED_RECENT_RATIO {
                continue;
            }
            let savings = baseline_cost - recent_cost;
            let service = key.get(Dimension::Service).unwrap_or("unknown");
            let account = key.get(Dimension::Account).unwrap_or("unknown");
            anomalies.push(Anomaly {
                kind: AnomalyKind::StoppedService,
                key: key.clone(),
                metric: None,
                observed_value: recent_cost,
                baseline_value: *baseline_cost,
                deviation_score: savings,
                change_percentage: None,
                severity: Severity::Info,
                confidence: 1.0,
                timestamp: recent_start,
                description: format!(
                    "Service {} appears to have stopped in account {}",
                    service, account
                ),
                daily_rate: Some(baseline_cost / (f64::from(lookback_hours) / 24.0)),
                savings: Some(savings),
            });
        }
        rank_anomalies(&mut anomalies, MAX_STOPPED_SERVICES);
        Ok(anomalies)
    }

    /// Total cost per (service, account) over one window, keyed by the
    /// joined key string.
    fn fetch_window_costs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, (DimensionKey, f64)>, CollectorError> {
        let query = CostQuery {
            start,
            end,
            granularity: Granularity::Daily,
            group_by: vec![Dimension::Service, Dimension::Account],
            filter: Vec::new(),
        };
        let samples = self
            .retry
            .run("window costs", || self.collector.fetch_cost_usage(&query))?;

        let mut costs: HashMap<String, (DimensionKey, f64)> = HashMap::new();
        for sample in samples {
            costs
                .entry(sample.key.joined())
                .and_modify(|(_, c)| *c += sample.cost)
                .or_insert((sample.key, sample.cost));
        }
        Ok(costs)
    }
}

fn soft_fail(
    errors: &mut BTreeMap<String, String>,
    category: &str,
    result: Result<Vec<Anomaly>, CollectorError>,
) -> Result<Vec<Anomaly>, CollectorError> {
    match result {
        Ok(anomalies) => Ok(anomalies),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            error!("{} detection failed: {}", category, err);
            errors.insert(category.to_string(), err.to_string());
            Ok(Vec::new())
        }
    }
}
