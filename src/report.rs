//! Report composition: merges categorized findings into a single summary
//! with an aggregate severity score and recommended actions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::anomaly::{Anomaly, AnomalyKind, CategorizedAnomalies, Severity};

/// Roll-up over every category.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_anomalies: usize,
    pub severity_score: f64,
    pub recommended_actions: Vec<String>,
}

/// The run's immutable output: every category's ranked findings plus the
/// summary. Serializes to plain nested data with ISO-8601 timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub generated_at: DateTime<Utc>,
    pub cost_anomalies: Vec<Anomaly>,
    pub usage_anomalies: Vec<Anomaly>,
    pub new_services: Vec<Anomaly>,
    pub stopped_services: Vec<Anomaly>,
    /// Categories that soft-failed this run, with the reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_categories: BTreeMap<String, String>,
    pub summary: ReportSummary,
}

/// Weighted severity sum across all categories, rounded to 2 decimals.
pub fn severity_score<'a>(anomalies: impl IntoIterator<Item = &'a Anomaly>) -> f64 {
    let total: f64 = anomalies.into_iter().map(|a| a.severity.weight()).sum();
    (total * 100.0).round() / 100.0
}

/// Fixed, ordered action rules. Every matching rule fires; when none does,
/// exactly one "no action required" message is produced.
fn recommended_actions(categorized: &CategorizedAnomalies) -> Vec<String> {
    let mut actions = Vec::new();

    let critical_count = all_anomalies(categorized)
        .filter(|a| a.severity == Severity::Critical)
        .count();
    if critical_count > 0 {
        actions.push(format!(
            "URGENT: Review {} critical anomalies immediately",
            critical_count
        ));
    }

    if categorized
        .cost_anomalies
        .iter()
        .any(|a| a.kind == AnomalyKind::CostSpike)
    {
        actions.push("Review and investigate unexpected cost increases".to_string());
    }

    if !categorized.new_services.is_empty() {
        actions.push(format!(
            "Verify {} newly detected services are authorized",
            categorized.new_services.len()
        ));
    }

    if !categorized.usage_anomalies.is_empty() {
        actions.push("Monitor resource usage patterns for potential issues".to_string());
    }

    if actions.is_empty() {
        actions.push("No immediate actions required - continue monitoring".to_string());
    }
    actions
}

fn all_anomalies(categorized: &CategorizedAnomalies) -> impl Iterator<Item = &Anomaly> {
    categorized
        .cost_anomalies
        .iter()
        .chain(&categorized.usage_anomalies)
        .chain(&categorized.new_services)
        .chain(&categorized.stopped_services)
}

/// Build the final report from one detection run.
pub fn compose(categorized: CategorizedAnomalies, generated_at: DateTime<Utc>) -> AnomalyReport {
    let total_anomalies = all_anomalies(&categorized).count();
    let score = severity_score(all_anomalies(&categorized));
    let actions = recommended_actions(&categorized);

    AnomalyReport {
        generated_at,
        summary: ReportSummary {
            total_anomalies,
            severity_score: score,
            recommended_actions: actions,
        },
        cost_anomalies: categorized.cost_anomalies,
        usage_anomalies: categorized.usage_anomalies,
        new_services: categorized.new_services,
        stopped_services: categorized.stopped_services,
        failed_categories: categorized.category_errors,
    }
}

impl AnomalyReport {
    /// Human-readable rendering for terminal consumers.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "=== Anomaly Detection Report ===");
        let _ = writeln!(out, "Generated: {}", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "Total anomalies: {}", self.summary.total_anomalies);
        let _ = writeln!(out, "Severity score:  {:.2}", self.summary.severity_score);
        out.push('\n');

        render_category(&mut out, "Cost anomalies", &self.cost_anomalies);
        render_category(&mut out, "Usage anomalies", &self.usage_anomalies);
        render_category(&mut out, "New services", &self.new_services);
        render_category(&mut out, "Stopped services", &self.stopped_services);

        if !self.failed_categories.is_empty() {
            let _ = writeln!(out, "Failed categories:");
            for (category, reason) in &self.failed_categories {
                let _ = writeln!(out, "  {}: {}", category, reason);
            }
            out.push('\n');
        }

        let _ = writeln!(out, "Recommended actions:");
        for action in &self.summary.recommended_actions {
            let _ = writeln!(out, "  - {}", action);
        }
        out
    }
}

fn render_category(out: &mut String, title: &str, anomalies: &[Anomaly]) {
    if anomalies.is_empty() {
        return;
    }
    let _ = writeln!(out, "{} ({}):", title, anomalies.len());
    for anomaly in anomalies {
        let _ = writeln!(
            out,
            "  [{}] {} (observed {:.2}, baseline {:.2}, confidence {:.2})",
            anomaly.severity.as_str(),
            anomaly.description,
            anomaly.observed_value,
            anomaly.baseline_value,
            anomaly.confidence
        );
    }
    out.push('\n');
}
