//! JSON output envelopes for machine consumers.
//!
//! Everything serializes to plain nested maps/lists with ISO-8601 timestamp
//! strings; there is no binary framing.

use serde::Serialize;

use crate::aggregate::{Breakdown, CostTrends};
use crate::report::AnomalyReport;

/// Format version identifier carried on every envelope.
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    version: &'static str,
    format: &'static str,
    #[serde(flatten)]
    data: &'a T,
}

/// Serialize an anomaly report with its envelope.
pub fn report_json(report: &AnomalyReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Envelope {
        version: FORMAT_VERSION,
        format: "anomaly_report",
        data: report,
    })
}

/// Serialize a cost breakdown with its envelope.
pub fn breakdown_json(breakdown: &Breakdown) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Envelope {
        version: FORMAT_VERSION,
        format: "cost_breakdown",
        data: breakdown,
    })
}

/// Serialize a trend bundle with its envelope.
pub fn trends_json(trends: &CostTrends) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Envelope {
        version: FORMAT_VERSION,
        format: "cost_trends",
        data: trends,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::CategorizedAnomalies;
    use crate::report::compose;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_report_envelope_fields() {
        let report = compose(
            CategorizedAnomalies::default(),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        );
        let json: serde_json::Value =
            serde_json::from_str(&report_json(&report).unwrap()).unwrap();

        assert_eq!(json["version"], FORMAT_VERSION);
        assert_eq!(json["format"], "anomaly_report");
        assert_eq!(json["summary"]["total_anomalies"], 0);
        assert_eq!(json["summary"]["severity_score"], 0.0);
    }

    #[test]
    fn test_breakdown_envelope_fields() {
        let breakdown = crate::aggregate::aggregate(&[], &[]);
        let json: serde_json::Value =
            serde_json::from_str(&breakdown_json(&breakdown).unwrap()).unwrap();

        assert_eq!(json["format"], "cost_breakdown");
        assert_eq!(json["total_cost"], 0.0);
        assert_eq!(json["currency"], "USD");
    }

    #[test]
    fn test_trends_envelope_fields() {
        let trends = crate::aggregate::cost_trends(&[]);
        let json: serde_json::Value =
            serde_json::from_str(&trends_json(&trends).unwrap()).unwrap();

        assert_eq!(json["format"], "cost_trends");
        assert!(json.get("forecast").is_none() || json["forecast"].is_null());
        assert_eq!(json["statistics"]["trend"], "decreasing");
    }
}
