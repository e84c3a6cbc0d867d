use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use costwatch::aggregate::{Breakdown, CostAnalyzer, CostTrends};
use costwatch::anomaly::AnomalyDetector;
use costwatch::cli::{Cli, OutputFormat};
use costwatch::collector::RecordedCollector;
use costwatch::config::Config;
use costwatch::{json_output, report};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn render_breakdown_text(breakdown: &Breakdown, top: usize) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "=== Cost Breakdown ===");
    let _ = writeln!(
        out,
        "Total cost: {:.2} {}",
        breakdown.total_cost, breakdown.currency
    );
    let _ = writeln!(out, "{:<40} {:>12} {:>8}", "key", "cost", "share");
    for item in breakdown.items.iter().take(top) {
        let _ = writeln!(
            out,
            "{:<40} {:>12.2} {:>7.2}%",
            item.key.joined(),
            item.cost,
            item.percentage
        );
    }
    if breakdown.items.len() > top {
        let _ = writeln!(out, "... and {} more", breakdown.items.len() - top);
    }
    out
}

fn render_trends_text(trends: &CostTrends) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "=== Cost Trends ===");
    let _ = writeln!(out, "Days analyzed: {}", trends.daily_costs.len());
    let _ = writeln!(out, "Total:    {:.2}", trends.statistics.total);
    let _ = writeln!(out, "Average:  {:.2}", trends.statistics.average);
    let _ = writeln!(out, "Min:      {:.2}", trends.statistics.min);
    let _ = writeln!(out, "Max:      {:.2}", trends.statistics.max);
    let _ = writeln!(out, "Std dev:  {:.2}", trends.statistics.std_dev);
    let _ = writeln!(out, "Trend:    {:?}", trends.statistics.trend);
    if let Some(forecast) = &trends.forecast {
        let _ = writeln!(out, "Forecast (next {} days):", forecast.values.len());
        for (date, value) in forecast.dates.iter().zip(&forecast.values) {
            let _ = writeln!(out, "  {}  {:.2}", date.format("%Y-%m-%d"), value);
        }
    }
    out
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config)?;
    config.validate()?;

    let collector = RecordedCollector::from_files(
        &args.input,
        args.metrics.as_deref(),
        args.accounts.as_deref(),
    )?;
    // Recorded snapshots analyze against their own newest sample so results
    // are reproducible; an empty file falls back to the wall clock. Query
    // windows are end-exclusive, so step one hour past the newest sample.
    let now = collector
        .latest_timestamp()
        .map(|t| t + chrono::Duration::hours(1))
        .unwrap_or_else(Utc::now);

    if args.breakdown {
        let analyzer = CostAnalyzer::new(&collector, Duration::from_secs(config.cache_ttl_secs));
        let breakdown = analyzer.cost_breakdown(now, config.lookback_hours, &config.group_by)?;
        match args.format {
            OutputFormat::Text => print!("{}", render_breakdown_text(&breakdown, args.top)),
            OutputFormat::Json => println!("{}", json_output::breakdown_json(&breakdown)?),
        }
        return Ok(());
    }

    if args.trends {
        let analyzer = CostAnalyzer::new(&collector, Duration::from_secs(config.cache_ttl_secs));
        let days = (config.lookback_hours / 24).max(1);
        let trends = analyzer.cost_trends(now, days, Vec::new())?;
        match args.format {
            OutputFormat::Text => print!("{}", render_trends_text(&trends)),
            OutputFormat::Json => println!("{}", json_output::trends_json(&trends)?),
        }
        return Ok(());
    }

    let mut detector = AnomalyDetector::new(&collector, config.sensitivity)
        .with_retry(config.retry.clone())
        .with_max_workers(config.max_parallel_fetches);
    if let Some(threshold) = config.threshold_override {
        detector = detector.with_threshold(threshold);
    }

    let categorized = detector.detect_all(now, config.lookback_hours)?;
    let report = report::compose(categorized, now);
    match args.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", json_output::report_json(&report)?),
    }
    Ok(())
}
