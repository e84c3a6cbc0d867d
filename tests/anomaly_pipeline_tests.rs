// End-to-end pipeline tests: collector -> detectors -> report composer,
// driven through an in-memory collector.

use chrono::{DateTime, Duration, TimeZone, Utc};
use costwatch::anomaly::{AnomalyDetector, AnomalyKind, Sensitivity, Severity};
use costwatch::collector::{
    CostQuery, MetricQuery, RecordedCollector, TimeSeriesCollector,
};
use costwatch::error::CollectorError;
use costwatch::model::{AccountInfo, Dimension, DimensionKey, MetricPoint, Sample};
use costwatch::report;
use costwatch::retry::RetryPolicy;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn key(service: &str, account: &str) -> DimensionKey {
    DimensionKey::new(vec![
        (Dimension::Service, service.to_string()),
        (Dimension::Account, account.to_string()),
    ])
}

fn hourly_samples(service: &str, account: &str, costs: &[f64]) -> Vec<Sample> {
    costs
        .iter()
        .enumerate()
        .map(|(i, &cost)| Sample {
            key: key(service, account),
            timestamp: base_time() + Duration::hours(i as i64),
            cost,
            usage: 1.0,
        })
        .collect()
}

fn no_wait_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base_delay_ms: 0,
        max_delay_ms: 0,
        jitter: false,
    }
}

/// Two history points ahead of `base_time` so the key exists in the
/// new-service detector's baseline window.
fn with_history(mut samples: Vec<Sample>, service: &str, account: &str) -> Vec<Sample> {
    for hours_back in [72, 24] {
        samples.push(Sample {
            key: key(service, account),
            timestamp: base_time() - Duration::hours(hours_back),
            cost: 100.0,
            usage: 1.0,
        });
    }
    samples
}

/// In-memory collector that also serves metric points and accounts.
struct MemoryCollector {
    inner: RecordedCollector,
    accounts: Vec<AccountInfo>,
    metric_values: Vec<f64>,
}

impl TimeSeriesCollector for MemoryCollector {
    fn fetch_cost_usage(&self, query: &CostQuery) -> Result<Vec<Sample>, CollectorError> {
        self.inner.fetch_cost_usage(query)
    }

    fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError> {
        Ok(self.accounts.clone())
    }

    fn fetch_metric(&self, query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError> {
        if query.metric != "CPUUtilization" || query.resource_type != "EC2" {
            return Ok(Vec::new());
        }
        Ok(self
            .metric_values
            .iter()
            .enumerate()
            .map(|(i, &value)| MetricPoint {
                timestamp: query.start + Duration::hours(i as i64),
                value,
            })
            .collect())
    }
}

#[test]
fn test_full_pipeline_flags_cost_spike() {
    // 47 quiet hours then a 10x spike in the final hour.
    let mut costs: Vec<f64> = (0..47).map(|i| 100.0 + (i % 3) as f64).collect();
    costs.push(1_000.0);
    let samples = with_history(hourly_samples("EC2", "111", &costs), "EC2", "111");
    let collector = RecordedCollector::from_records(samples, Vec::new());

    let detector =
        AnomalyDetector::new(&collector, Sensitivity::Medium).with_retry(no_wait_retry());
    let now = base_time() + Duration::hours(48);
    let categorized = detector.detect_all(now, 48).unwrap();

    assert!(!categorized.cost_anomalies.is_empty());
    let spike = &categorized.cost_anomalies[0];
    assert_eq!(spike.kind, AnomalyKind::CostSpike);
    assert_eq!(spike.key.joined(), "EC2:111");
    assert_eq!(spike.observed_value, 1_000.0);
    assert_eq!(spike.severity, Severity::Critical);
    assert!(categorized.category_errors.is_empty());

    let report = report::compose(categorized, now);
    assert!(report.summary.severity_score >= 10.0);
    assert!(report
        .summary
        .recommended_actions
        .iter()
        .any(|a| a.contains("cost increases")));
    assert!(report
        .summary
        .recommended_actions
        .iter()
        .any(|a| a.contains("URGENT")));
}

#[test]
fn test_full_pipeline_quiet_data_reports_no_action() {
    // Mild noise, no spike: nothing should fire at medium sensitivity.
    let costs: Vec<f64> = (0..48).map(|i| 100.0 + (i % 2) as f64).collect();
    let samples = with_history(hourly_samples("EC2", "111", &costs), "EC2", "111");
    let collector = RecordedCollector::from_records(samples, Vec::new());

    let detector =
        AnomalyDetector::new(&collector, Sensitivity::Medium).with_retry(no_wait_retry());
    let now = base_time() + Duration::hours(48);
    let report = report::compose(detector.detect_all(now, 48).unwrap(), now);

    assert_eq!(report.summary.total_anomalies, 0);
    assert_eq!(report.summary.severity_score, 0.0);
    assert_eq!(
        report.summary.recommended_actions,
        vec!["No immediate actions required - continue monitoring".to_string()]
    );
}

#[test]
fn test_pipeline_detects_usage_deviation() {
    let mut metric_values: Vec<f64> = (0..23).map(|i| 40.0 + (i % 5) as f64).collect();
    metric_values.push(99.0);

    let collector = MemoryCollector {
        inner: RecordedCollector::from_records(Vec::new(), Vec::new()),
        accounts: vec![AccountInfo {
            id: "111".to_string(),
            name: "prod".to_string(),
            status: "ACTIVE".to_string(),
        }],
        metric_values,
    };

    let detector =
        AnomalyDetector::new(&collector, Sensitivity::High).with_retry(no_wait_retry());
    let now = base_time() + Duration::hours(24);
    let anomalies = detector.detect_usage_anomalies(now, 24).unwrap();

    assert_eq!(anomalies.len(), 1);
    let anomaly = &anomalies[0];
    assert_eq!(anomaly.kind, AnomalyKind::UsageDeviation);
    assert_eq!(anomaly.metric.as_deref(), Some("CPUUtilization"));
    assert_eq!(anomaly.observed_value, 99.0);
    assert!(anomaly.deviation_score > 1.5);
    assert!(anomaly
        .description
        .contains("standard deviations from normal"));
}

#[test]
fn test_pipeline_skips_suspended_accounts() {
    let collector = MemoryCollector {
        inner: RecordedCollector::from_records(Vec::new(), Vec::new()),
        accounts: vec![AccountInfo {
            id: "111".to_string(),
            name: "old".to_string(),
            status: "SUSPENDED".to_string(),
        }],
        metric_values: vec![40.0; 23].into_iter().chain([99.0]).collect(),
    };

    let detector =
        AnomalyDetector::new(&collector, Sensitivity::High).with_retry(no_wait_retry());
    let now = base_time() + Duration::hours(24);
    assert!(detector.detect_usage_anomalies(now, 24).unwrap().is_empty());
}

struct DenyingCollector;

impl TimeSeriesCollector for DenyingCollector {
    fn fetch_cost_usage(&self, _query: &CostQuery) -> Result<Vec<Sample>, CollectorError> {
        Err(CollectorError::AccessDenied("ce:GetCostAndUsage".to_string()))
    }

    fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError> {
        Ok(Vec::new())
    }

    fn fetch_metric(&self, _query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError> {
        Ok(Vec::new())
    }
}

#[test]
fn test_pipeline_access_denied_aborts_run() {
    let detector =
        AnomalyDetector::new(&DenyingCollector, Sensitivity::Medium).with_retry(no_wait_retry());
    let result = detector.detect_all(base_time(), 168);
    assert!(matches!(result, Err(CollectorError::AccessDenied(_))));
}

struct ThrottledCostCollector;

impl TimeSeriesCollector for ThrottledCostCollector {
    fn fetch_cost_usage(&self, _query: &CostQuery) -> Result<Vec<Sample>, CollectorError> {
        Err(CollectorError::Throttled("rate exceeded".to_string()))
    }

    fn fetch_accounts(&self) -> Result<Vec<AccountInfo>, CollectorError> {
        Ok(Vec::new())
    }

    fn fetch_metric(&self, _query: &MetricQuery) -> Result<Vec<MetricPoint>, CollectorError> {
        Ok(Vec::new())
    }
}

#[test]
fn test_pipeline_transient_failure_soft_fails_categories() {
    // Cost-based categories fail but the run completes and names them.
    let detector = AnomalyDetector::new(&ThrottledCostCollector, Sensitivity::Medium)
        .with_retry(no_wait_retry());
    let categorized = detector.detect_all(base_time(), 168).unwrap();

    assert!(categorized.cost_anomalies.is_empty());
    assert!(categorized.category_errors.contains_key("cost_anomalies"));
    assert!(categorized.category_errors.contains_key("new_services"));
    assert!(categorized.category_errors.contains_key("stopped_services"));
    // Usage path only needs accounts + metrics, which succeed here.
    assert!(!categorized.category_errors.contains_key("usage_anomalies"));

    let report = report::compose(categorized, base_time());
    assert_eq!(report.summary.total_anomalies, 0);
    assert_eq!(report.failed_categories.len(), 3);
}

#[test]
fn test_pipeline_new_and_stopped_services_together() {
    let day = |d: u32| Utc.with_ymd_and_hms(2026, 3, d, 0, 0, 0).unwrap();
    let mk = |service: &str, d: u32, cost: f64| Sample {
        key: key(service, "111"),
        timestamp: day(d),
        cost,
        usage: 0.0,
    };

    // RDS runs through the baseline window then stops; Glue appears only in
    // the recent day.
    let samples = vec![
        mk("RDS", 14, 30.0),
        mk("RDS", 15, 30.0),
        mk("RDS", 16, 1.0),
        mk("Glue", 16, 25.0),
    ];
    let collector = RecordedCollector::from_records(samples, Vec::new());
    let detector =
        AnomalyDetector::new(&collector, Sensitivity::Medium).with_retry(no_wait_retry());

    let now = day(17);
    let categorized = detector.detect_all(now, 24).unwrap();

    assert_eq!(categorized.new_services.len(), 1);
    assert_eq!(categorized.new_services[0].key.joined(), "Glue:111");

    assert_eq!(categorized.stopped_services.len(), 1);
    let stopped = &categorized.stopped_services[0];
    assert_eq!(stopped.key.joined(), "RDS:111");
    // Baseline window [day 15, day 16) holds 30, recent holds 1.
    assert_eq!(stopped.savings, Some(29.0));

    let report = report::compose(categorized, now);
    assert!(report
        .summary
        .recommended_actions
        .iter()
        .any(|a| a.contains("newly detected services")));
}
