//! Collector boundary: the seam between the analysis core and whatever
//! supplies time-series data.
//!
//! The core only ever sees validated [`Sample`]/[`MetricPoint`]/
//! [`AccountInfo`] records. Loosely-shaped payloads are parsed and checked
//! here; records that do not validate are dropped with a logged warning and
//! the run continues. Retry/backoff also lives at this boundary and never
//! inside the statistical code.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use crossbeam::channel;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CollectorError;
use crate::model::{AccountInfo, Dimension, DimensionKey, Granularity, MetricPoint, Sample};
use crate::retry::RetryPolicy;

/// A cost/usage request over a bounded window.
#[derive(Debug, Clone)]
pub struct CostQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
    /// Dimensions forming the composite key of returned samples, in order.
    pub group_by: Vec<Dimension>,
    /// Exact-match constraints ANDed together; empty means no filter.
    pub filter: Vec<(Dimension, String)>,
}

/// A utilization-metric request for one (resource type, account, metric).
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub resource_type: String,
    pub account_id: String,
    pub metric: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_seconds: u32,
}

impl MetricQuery {
    /// Stable identifier for logging and result merging.
    pub fn slice_key(&self) -> (String, String, String) {
        (
            self.account_id.clone(),
            self.resource_type.clone(),
            self.metric.clone(),
        )
    }
}

/// Source of cost, usage and account data.
///
/// Implementations own credentials, transport, and timeouts; the analysis
/// core applies no timeout logic of its own.
pub trait TimeSeriesCollector {
    /// Samples in `[start, end)`, keyed by the query's `group_by`
    /// dimensions, timestamp-ascending with no duplicate timestamps per key.
    fn fetch_cost_usage(&self, query: &CostQuery) -> Result<Vec<Sample>, CollectorError>;

    /// All member accounts of the organization.
    fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError>;

    /// Utilization metric datapoints in `[start, end)`, timestamp-ascending.
    fn fetch_metric(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError>;
}

/// Truncate a timestamp to the start of its granularity bucket.
pub fn bucket_timestamp(ts: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hourly => Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
            .single()
            .unwrap_or(ts),
        Granularity::Daily => Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
            .single()
            .unwrap_or(ts),
        Granularity::Monthly => Utc
            .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(ts),
    }
}

/// Loosely-shaped billing record as it appears in a recorded snapshot.
/// Field-level `Option`s let one bad record be dropped without failing the
/// whole file.
#[derive(Debug, Deserialize)]
struct RawSample {
    service: Option<String>,
    account: Option<String>,
    region: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    cost: Option<f64>,
    usage: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMetric {
    resource_type: Option<String>,
    account: Option<String>,
    metric: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    value: Option<f64>,
}

#[derive(Debug, Clone)]
struct RecordedMetric {
    resource_type: String,
    account_id: String,
    metric: String,
    point: MetricPoint,
}

/// Collector backed by recorded JSON snapshots on disk.
///
/// This is the data source the CLI ships with; live cloud collectors
/// implement [`TimeSeriesCollector`] downstream.
#[derive(Debug, Default)]
pub struct RecordedCollector {
    samples: Vec<Sample>,
    metrics: Vec<RecordedMetric>,
    accounts: Vec<AccountInfo>,
}

impl RecordedCollector {
    /// Load snapshots from disk. `metrics` and `accounts` are optional
    /// files; a missing path just leaves that surface empty.
    pub fn from_files(
        samples: &Path,
        metrics: Option<&Path>,
        accounts: Option<&Path>,
    ) -> Result<Self, CollectorError> {
        let mut collector = RecordedCollector {
            samples: load_samples(samples)?,
            ..Default::default()
        };
        if let Some(path) = metrics {
            collector.metrics = load_metrics(path)?;
        }
        if let Some(path) = accounts {
            collector.accounts = load_accounts(path)?;
        }
        debug!(
            "loaded {} samples, {} metric points, {} accounts",
            collector.samples.len(),
            collector.metrics.len(),
            collector.accounts.len()
        );
        Ok(collector)
    }

    /// Build a collector directly from validated records (used by tests and
    /// embedding consumers).
    pub fn from_records(samples: Vec<Sample>, accounts: Vec<AccountInfo>) -> Self {
        RecordedCollector {
            samples,
            metrics: Vec::new(),
            accounts,
        }
    }

    /// Most recent sample timestamp, used as the reference "now" so that
    /// recorded snapshots analyze deterministically.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.timestamp).max()
    }
}

impl TimeSeriesCollector for RecordedCollector {
    fn fetch_cost_usage(&self, query: &CostQuery) -> Result<Vec<Sample>, CollectorError> {
        // Merge raw records into one sample per (projected key, bucket);
        // this is what upholds the no-duplicate-timestamps invariant when a
        // wider key collapses onto the requested dimensions.
        let mut order: Vec<Sample> = Vec::new();
        let mut index: HashMap<(String, DateTime<Utc>), usize> = HashMap::new();

        for sample in &self.samples {
            if sample.timestamp < query.start || sample.timestamp >= query.end {
                continue;
            }
            if !matches_filter(&sample.key, &query.filter) {
                continue;
            }
            let Some(key) = sample.key.project(&query.group_by) else {
                warn!(
                    "dropping sample at {} missing requested dimensions: {}",
                    sample.timestamp, sample.key
                );
                continue;
            };
            let bucket = bucket_timestamp(sample.timestamp, query.granularity);
            match index.entry((key.joined(), bucket)) {
                std::collections::hash_map::Entry::Occupied(slot) => {
                    let merged = &mut order[*slot.get()];
                    merged.cost += sample.cost;
                    merged.usage += sample.usage;
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(order.len());
                    order.push(Sample {
                        key,
                        timestamp: bucket,
                        cost: sample.cost,
                        usage: sample.usage,
                    });
                }
            }
        }

        order.sort_by_key(|s| s.timestamp);
        Ok(order)
    }

    fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError> {
        Ok(self.accounts.clone())
    }

    fn fetch_metric(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError> {
        let mut points: Vec<MetricPoint> = self
            .metrics
            .iter()
            .filter(|m| {
                m.resource_type == query.resource_type
                    && m.account_id == query.account_id
                    && m.metric == query.metric
                    && m.point.timestamp >= query.start
                    && m.point.timestamp < query.end
            })
            .map(|m| m.point)
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

fn matches_filter(key: &DimensionKey, filter: &[(Dimension, String)]) -> bool {
    filter
        .iter()
        .all(|(dim, value)| key.get(*dim) == Some(value.as_str()))
}

fn read_json_records(path: &Path) -> Result<Vec<serde_json::Value>, CollectorError> {
    let text = fs::read_to_string(path).map_err(|source| CollectorError::Connection(format!(
        "cannot read {}: {}",
        path.display(),
        source
    )))?;
    serde_json::from_str(&text)
        .map_err(|e| CollectorError::Malformed(format!("{}: {}", path.display(), e)))
}

fn load_samples(path: &Path) -> Result<Vec<Sample>, CollectorError> {
    let mut samples = Vec::new();
    for value in read_json_records(path)? {
        let raw: RawSample = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("dropping unparseable sample record: {}", e);
                continue;
            }
        };
        match validate_sample(raw) {
            Some(sample) => samples.push(sample),
            None => warn!("dropping malformed sample record in {}", path.display()),
        }
    }
    Ok(samples)
}

fn validate_sample(raw: RawSample) -> Option<Sample> {
    let service = raw.service.filter(|s| !s.is_empty())?;
    let account = raw.account.filter(|s| !s.is_empty())?;
    let timestamp = raw.timestamp?;
    let cost = raw.cost.filter(|c| c.is_finite())?;
    let usage = raw.usage.unwrap_or(0.0);
    if !usage.is_finite() {
        return None;
    }

    let mut parts = vec![
        (Dimension::Service, service),
        (Dimension::Account, account),
    ];
    if let Some(region) = raw.region.filter(|r| !r.is_empty()) {
        parts.push((Dimension::Region, region));
    }
    Some(Sample {
        key: DimensionKey::new(parts),
        timestamp,
        cost,
        usage,
    })
}

fn load_metrics(path: &Path) -> Result<Vec<RecordedMetric>, CollectorError> {
    let mut metrics = Vec::new();
    for value in read_json_records(path)? {
        let raw: RawMetric = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("dropping unparseable metric record: {}", e);
                continue;
            }
        };
        let (Some(resource_type), Some(account_id), Some(metric), Some(timestamp), Some(value)) = (
            raw.resource_type,
            raw.account,
            raw.metric,
            raw.timestamp,
            raw.value,
        ) else {
            warn!("dropping malformed metric record in {}", path.display());
            continue;
        };
        if !value.is_finite() {
            warn!("dropping non-finite metric value in {}", path.display());
            continue;
        }
        metrics.push(RecordedMetric {
            resource_type,
            account_id,
            metric,
            point: MetricPoint { timestamp, value },
        });
    }
    Ok(metrics)
}

fn load_accounts(path: &Path) -> Result<Vec<AccountInfo>, CollectorError> {
    let mut accounts = Vec::new();
    for value in read_json_records(path)? {
        match serde_json::from_value::<AccountInfo>(value) {
            Ok(account) => accounts.push(account),
            Err(e) => warn!("dropping malformed account record: {}", e),
        }
    }
    Ok(accounts)
}

/// Fetch many metric slices through a bounded worker pool and merge the
/// results by slice key.
///
/// Completion order does not matter: every query writes to a distinct key.
/// A slice that still fails after retries is logged and excluded
/// (soft-fail), except access-denied failures which abort the whole fetch.
pub fn parallel_fetch_metrics<C>(
    collector: &C,
    queries: Vec<MetricQuery>,
    max_workers: usize,
    retry: &RetryPolicy,
) -> Result<HashMap<(String, String, String), Vec<MetricPoint>>, CollectorError>
where
    C: TimeSeriesCollector + Sync + ?Sized,
{
    if queries.is_empty() {
        return Ok(HashMap::new());
    }
    let workers = max_workers.max(1).min(queries.len());

    let (task_tx, task_rx) = channel::unbounded::<MetricQuery>();
    let (result_tx, result_rx) =
        channel::unbounded::<(MetricQuery, Result<Vec<MetricPoint>, CollectorError>)>();
    for query in queries {
        // Receiver outlives this loop, so the send cannot fail.
        let _ = task_tx.send(query);
    }
    drop(task_tx);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(query) = task_rx.recv() {
                    let label = format!(
                        "{}/{}/{}",
                        query.account_id, query.resource_type, query.metric
                    );
                    let outcome = retry.run(&label, || collector.fetch_metric(&query));
                    if result_tx.send((query, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);
    });

    let mut merged: HashMap<(String, String, String), Vec<MetricPoint>> = HashMap::new();
    for (query, outcome) in result_rx.iter() {
        match outcome {
            Ok(points) => {
                merged.entry(query.slice_key()).or_default().extend(points);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(
                    "excluding metric slice {}/{}/{}: {}",
                    query.account_id, query.resource_type, query.metric, err
                );
            }
        }
    }
    for points in merged.values_mut() {
        points.sort_by_key(|p| p.timestamp);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn sample(service: &str, account: &str, day: u32, hour: u32, cost: f64) -> Sample {
        Sample {
            key: DimensionKey::new(vec![
                (Dimension::Service, service.to_string()),
                (Dimension::Account, account.to_string()),
            ]),
            timestamp: ts(day, hour),
            cost,
            usage: 1.0,
        }
    }

    fn query(start_day: u32, end_day: u32, granularity: Granularity) -> CostQuery {
        CostQuery {
            start: ts(start_day, 0),
            end: ts(end_day, 0),
            granularity,
            group_by: vec![Dimension::Service, Dimension::Account],
            filter: Vec::new(),
        }
    }

    #[test]
    fn test_fetch_respects_time_window() {
        let collector = RecordedCollector::from_records(
            vec![
                sample("EC2", "111", 1, 0, 1.0),
                sample("EC2", "111", 5, 0, 2.0),
                sample("EC2", "111", 9, 0, 4.0),
            ],
            Vec::new(),
        );
        let fetched = collector
            .fetch_cost_usage(&query(2, 9, Granularity::Daily))
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].cost, 2.0);
    }

    #[test]
    fn test_fetch_merges_duplicate_buckets() {
        // Two hourly records on the same day collapse into one daily sample.
        let collector = RecordedCollector::from_records(
            vec![
                sample("EC2", "111", 3, 1, 1.5),
                sample("EC2", "111", 3, 14, 2.5),
            ],
            Vec::new(),
        );
        let fetched = collector
            .fetch_cost_usage(&query(1, 10, Granularity::Daily))
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].cost, 4.0);
        assert_eq!(fetched[0].usage, 2.0);
        assert_eq!(fetched[0].timestamp, ts(3, 0));
    }

    #[test]
    fn test_fetch_applies_dimension_filter() {
        let collector = RecordedCollector::from_records(
            vec![
                sample("EC2", "111", 3, 0, 1.0),
                sample("RDS", "111", 3, 0, 2.0),
            ],
            Vec::new(),
        );
        let mut q = query(1, 10, Granularity::Daily);
        q.filter = vec![(Dimension::Service, "RDS".to_string())];
        let fetched = collector.fetch_cost_usage(&q).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].key.get(Dimension::Service), Some("RDS"));
    }

    #[test]
    fn test_fetch_orders_by_timestamp() {
        let collector = RecordedCollector::from_records(
            vec![
                sample("EC2", "111", 7, 0, 3.0),
                sample("EC2", "111", 2, 0, 1.0),
                sample("EC2", "111", 5, 0, 2.0),
            ],
            Vec::new(),
        );
        let fetched = collector
            .fetch_cost_usage(&query(1, 10, Granularity::Daily))
            .unwrap();
        let days: Vec<u32> = fetched
            .iter()
            .map(|s| s.timestamp.day())
            .collect();
        assert_eq!(days, vec![2, 5, 7]);
    }

    #[test]
    fn test_bucket_timestamp_granularities() {
        let t = Utc.with_ymd_and_hms(2026, 3, 15, 13, 42, 7).unwrap();
        assert_eq!(
            bucket_timestamp(t, Granularity::Hourly),
            Utc.with_ymd_and_hms(2026, 3, 15, 13, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_timestamp(t, Granularity::Daily),
            Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_timestamp(t, Granularity::Monthly),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_validate_sample_drops_missing_fields() {
        let raw = RawSample {
            service: Some("EC2".to_string()),
            account: None,
            region: None,
            timestamp: Some(ts(1, 0)),
            cost: Some(1.0),
            usage: None,
        };
        assert!(validate_sample(raw).is_none());
    }

    #[test]
    fn test_validate_sample_drops_non_finite_cost() {
        let raw = RawSample {
            service: Some("EC2".to_string()),
            account: Some("111".to_string()),
            region: None,
            timestamp: Some(ts(1, 0)),
            cost: Some(f64::NAN),
            usage: None,
        };
        assert!(validate_sample(raw).is_none());
    }

    #[test]
    fn test_validate_sample_defaults_usage() {
        let raw = RawSample {
            service: Some("EC2".to_string()),
            account: Some("111".to_string()),
            region: Some("us-east-1".to_string()),
            timestamp: Some(ts(1, 0)),
            cost: Some(2.0),
            usage: None,
        };
        let sample = validate_sample(raw).unwrap();
        assert_eq!(sample.usage, 0.0);
        assert_eq!(sample.key.get(Dimension::Region), Some("us-east-1"));
    }

    #[test]
    fn test_latest_timestamp() {
        let collector = RecordedCollector::from_records(
            vec![sample("EC2", "111", 2, 0, 1.0), sample("EC2", "111", 9, 0, 1.0)],
            Vec::new(),
        );
        assert_eq!(collector.latest_timestamp(), Some(ts(9, 0)));
    }

    struct FlakyCollector {
        failures: std::sync::Mutex<u32>,
    }

    impl TimeSeriesCollector for FlakyCollector {
        fn fetch_cost_usage(&self, _query: &CostQuery) -> Result<Vec<Sample>, CollectorError> {
            Ok(Vec::new())
        }

        fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError> {
            Ok(Vec::new())
        }

        fn fetch_metric(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError> {
            if query.account_id == "denied" {
                return Err(CollectorError::AccessDenied("cloudwatch".to_string()));
            }
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(CollectorError::Throttled("busy".to_string()));
            }
            Ok(vec![MetricPoint {
                timestamp: ts(1, 0),
                value: 42.0,
            }])
        }
    }

    fn metric_query(account: &str, metric: &str) -> MetricQuery {
        MetricQuery {
            resource_type: "EC2".to_string(),
            account_id: account.to_string(),
            metric: metric.to_string(),
            start: ts(1, 0),
            end: ts(8, 0),
            period_seconds: 3600,
        }
    }

    fn no_wait_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    #[test]
    fn test_parallel_fetch_merges_by_slice_key() {
        let collector = FlakyCollector {
            failures: std::sync::Mutex::new(0),
        };
        let queries = vec![
            metric_query("111", "CPUUtilization"),
            metric_query("111", "NetworkIn"),
            metric_query("222", "CPUUtilization"),
        ];
        let merged = parallel_fetch_metrics(&collector, queries, 2, &no_wait_retry()).unwrap();
        assert_eq!(merged.len(), 3);
        let key = (
            "111".to_string(),
            "EC2".to_string(),
            "CPUUtilization".to_string(),
        );
        assert_eq!(merged[&key].len(), 1);
    }

    #[test]
    fn test_parallel_fetch_retries_transient_failures() {
        let collector = FlakyCollector {
            failures: std::sync::Mutex::new(1),
        };
        let merged = parallel_fetch_metrics(
            &collector,
            vec![metric_query("111", "CPUUtilization")],
            4,
            &no_wait_retry(),
        )
        .unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_parallel_fetch_aborts_on_access_denied() {
        let collector = FlakyCollector {
            failures: std::sync::Mutex::new(0),
        };
        let queries = vec![
            metric_query("111", "CPUUtilization"),
            metric_query("denied", "CPUUtilization"),
        ];
        let result = parallel_fetch_metrics(&collector, queries, 2, &no_wait_retry());
        assert!(matches!(result, Err(CollectorError::AccessDenied(_))));
    }

    #[test]
    fn test_parallel_fetch_empty_query_list() {
        let collector = FlakyCollector {
            failures: std::sync::Mutex::new(0),
        };
        let merged = parallel_fetch_metrics(&collector, Vec::new(), 8, &no_wait_retry()).unwrap();
        assert!(merged.is_empty());
    }
}
