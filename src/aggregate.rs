//! Cost aggregation: grouped breakdowns, trends, moving averages and the
//! short-range linear forecast.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use tracing::warn;

use crate::cache::MonthlyCostCache;
use crate::collector::{CostQuery, TimeSeriesCollector};
use crate::error::CollectorError;
use crate::model::{Dimension, DimensionKey, Granularity, Sample};
use crate::stats::{population_mean, population_std};

/// Points used to fit the forecast line, and the number of points projected
/// forward.
pub const FORECAST_WINDOW: usize = 7;

/// One time-indexed observation inside a group's sub-series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    pub cost: f64,
    pub usage: f64,
}

/// One ranked row of the cost breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct BreakdownItem {
    pub key: DimensionKey,
    pub cost: f64,
    pub usage: f64,
    /// Share of the total cost, 0 when the total is 0.
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_from_last_month: Option<f64>,
}

/// Grouped cost breakdown plus the parallel time-indexed view consumed by
/// trend and baseline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct Breakdown {
    pub total_cost: f64,
    pub currency: String,
    /// Ranked by descending cost; ties keep insertion order.
    pub items: Vec<BreakdownItem>,
    /// Joined group key to its ordered sub-series.
    pub series: Vec<(DimensionKey, Vec<TimePoint>)>,
}

/// Direction of a series per the two-point comparison rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
}

/// Linear extrapolation of the next [`FORECAST_WINDOW`] daily values.
#[derive(Debug, Clone, Serialize)]
pub struct Forecast {
    pub dates: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendStats {
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub trend: Trend,
}

/// Daily cost trend bundle: raw series, smoothed views, summary statistics
/// and the optional forecast.
#[derive(Debug, Clone, Serialize)]
pub struct CostTrends {
    pub dates: Vec<DateTime<Utc>>,
    pub daily_costs: Vec<f64>,
    pub moving_average_7: Vec<f64>,
    pub moving_average_30: Vec<f64>,
    pub statistics: TrendStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
}

/// Group samples by the composite key formed from `group_by` and rank by
/// descending cost.
///
/// Samples missing a requested dimension are dropped with a warning; points
/// landing on the same (key, timestamp) are merged by summation so each
/// sub-series keeps unique timestamps.
pub fn aggregate(samples: &[Sample], group_by: &[Dimension]) -> Breakdown {
    struct Group {
        key: DimensionKey,
        cost: f64,
        usage: f64,
        points: Vec<TimePoint>,
        point_index: HashMap<DateTime<Utc>, usize>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for sample in samples {
        let Some(key) = sample.key.project(group_by) else {
            warn!(
                "dropping sample at {} missing grouping dimensions: {}",
                sample.timestamp, sample.key
            );
            continue;
        };
        let slot = *index.entry(key.joined()).or_insert_with(|| {
            groups.push(Group {
                key,
                cost: 0.0,
                usage: 0.0,
                points: Vec::new(),
                point_index: HashMap::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.cost += sample.cost;
        group.usage += sample.usage;
        match group.point_index.entry(sample.timestamp) {
            std::collections::hash_map::Entry::Occupied(existing) => {
                let point = &mut group.points[*existing.get()];
                point.cost += sample.cost;
                point.usage += sample.usage;
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(group.points.len());
                group.points.push(TimePoint {
                    timestamp: sample.timestamp,
                    cost: sample.cost,
                    usage: sample.usage,
                });
            }
        }
    }

    let total_cost: f64 = groups.iter().map(|g| g.cost).sum();

    let mut items: Vec<BreakdownItem> = Vec::with_capacity(groups.len());
    let mut series: Vec<(DimensionKey, Vec<TimePoint>)> = Vec::with_capacity(groups.len());
    for group in groups {
        let percentage = if total_cost > 0.0 {
            group.cost / total_cost * 100.0
        } else {
            0.0
        };
        items.push(BreakdownItem {
            key: group.key.clone(),
            cost: group.cost,
            usage: group.usage,
            percentage,
            account_name: None,
            change_from_last_month: None,
        });
        let mut points = group.points;
        points.sort_by_key(|p| p.timestamp);
        series.push((group.key, points));
    }

    // Stable sort keeps insertion order among equal costs.
    items.sort_by(|a, b| b.cost.partial_cmp(&a.cost).unwrap_or(std::cmp::Ordering::Equal));

    Breakdown {
        total_cost,
        currency: "USD".to_string(),
        items,
        series,
    }
}

/// Trailing windowed mean with a shrinking window at the start (the first
/// element averages only itself).
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            population_mean(&values[start..=i])
        })
        .collect()
}

/// Least-squares line over `values` with x = 0, 1, 2, ...
/// Returns (slope, intercept).
fn fit_line(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|x| x as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(x, y)| x as f64 * y).sum();
    let sum_xx: f64 = (0..values.len()).map(|x| (x as f64) * (x as f64)).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return (0.0, population_mean(values));
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}

/// Fit the last [`FORECAST_WINDOW`] daily values and extrapolate the same
/// number of days past `last_date`. Absent (not zero-filled) with fewer than
/// seven points.
pub fn forecast_daily(values: &[f64], last_date: DateTime<Utc>) -> Option<Forecast> {
    if values.len() < FORECAST_WINDOW {
        return None;
    }
    let tail = &values[values.len() - FORECAST_WINDOW..];
    let (slope, intercept) = fit_line(tail);

    let mut dates = Vec::with_capacity(FORECAST_WINDOW);
    let mut forecast_values = Vec::with_capacity(FORECAST_WINDOW);
    for i in 0..FORECAST_WINDOW {
        let x = (FORECAST_WINDOW + i) as f64;
        dates.push(last_date + Duration::days(i as i64 + 1));
        forecast_values.push(intercept + slope * x);
    }
    Some(Forecast {
        dates,
        values: forecast_values,
    })
}

/// Two-point trend rule: increasing iff the last value exceeds the value
/// seven positions from the end (the first value on shorter series). This is
/// deliberately not a regression slope.
pub fn classify_trend(values: &[f64]) -> Trend {
    let Some(&last) = values.last() else {
        return Trend::Decreasing;
    };
    let reference = if values.len() >= 7 {
        values[values.len() - 7]
    } else {
        values[0]
    };
    if last > reference {
        Trend::Increasing
    } else {
        Trend::Decreasing
    }
}

/// Assemble the full trend bundle from a daily cost series.
pub fn cost_trends(points: &[(DateTime<Utc>, f64)]) -> CostTrends {
    let dates: Vec<DateTime<Utc>> = points.iter().map(|(d, _)| *d).collect();
    let daily_costs: Vec<f64> = points.iter().map(|(_, c)| *c).collect();

    let statistics = TrendStats {
        total: daily_costs.iter().sum(),
        average: population_mean(&daily_costs),
        min: daily_costs.iter().copied().fold(f64::INFINITY, f64::min),
        max: daily_costs
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max),
        std_dev: population_std(&daily_costs),
        trend: classify_trend(&daily_costs),
    };
    let statistics = if daily_costs.is_empty() {
        TrendStats {
            min: 0.0,
            max: 0.0,
            ..statistics
        }
    } else {
        statistics
    };

    let forecast = dates
        .last()
        .and_then(|last| forecast_daily(&daily_costs, *last));

    CostTrends {
        moving_average_7: moving_average(&daily_costs, 7),
        moving_average_30: moving_average(&daily_costs, 30),
        statistics,
        forecast,
        dates,
        daily_costs,
    }
}

/// Drives breakdown/trend/driver queries against a collector, owning the
/// explicit monthly cost cache.
pub struct CostAnalyzer<'a, C: TimeSeriesCollector + ?Sized> {
    collector: &'a C,
    cache: MonthlyCostCache,
}

impl<'a, C: TimeSeriesCollector + ?Sized> CostAnalyzer<'a, C> {
    pub fn new(collector: &'a C, cache_ttl: StdDuration) -> Self {
        Self {
            collector,
            cache: MonthlyCostCache::new(cache_ttl),
        }
    }

    /// Grouped breakdown over the trailing `hours`, with account-name
    /// enrichment when grouping includes the account dimension.
    pub fn cost_breakdown(
        &self,
        now: DateTime<Utc>,
        hours: u32,
        group_by: &[Dimension],
    ) -> Result<Breakdown, CollectorError> {
        let query = CostQuery {
            start: now - Duration::hours(i64::from(hours)),
            end: now,
            granularity: Granularity::Daily,
            group_by: group_by.to_vec(),
            filter: Vec::new(),
        };
        let samples = self.collector.fetch_cost_usage(&query)?;
        let mut breakdown = aggregate(&samples, group_by);

        if group_by.contains(&Dimension::Account) {
            let names: HashMap<String, String> = self
                .collector
                .fetch_accounts()?
                .into_iter()
                .map(|a| (a.id, a.name))
                .collect();
            for item in &mut breakdown.items {
                if let Some(account) = item.key.get(Dimension::Account) {
                    item.account_name = Some(
                        names
                            .get(account)
                            .cloned()
                            .unwrap_or_else(|| "Unknown".to_string()),
                    );
                }
            }
        }
        Ok(breakdown)
    }

    /// Daily cost trend over the trailing `days`, optionally filtered to one
    /// service and/or account.
    pub fn cost_trends(
        &self,
        now: DateTime<Utc>,
        days: u32,
        filter: Vec<(Dimension, String)>,
    ) -> Result<CostTrends, CollectorError> {
        let query = CostQuery {
            start: now - Duration::days(i64::from(days)),
            end: now,
            granularity: Granularity::Daily,
            // Empty grouping: one total series across all keys.
            group_by: Vec::new(),
            filter,
        };
        let samples = self.collector.fetch_cost_usage(&query)?;
        let points: Vec<(DateTime<Utc>, f64)> =
            samples.iter().map(|s| (s.timestamp, s.cost)).collect();
        Ok(cost_trends(&points))
    }

    /// Top cost drivers over the trailing `hours`, enriched with a
    /// change-vs-last-month percentage from the monthly cache.
    pub fn top_cost_drivers(
        &mut self,
        now: DateTime<Utc>,
        hours: u32,
        top_n: usize,
    ) -> Result<Vec<BreakdownItem>, CollectorError> {
        let breakdown =
            self.cost_breakdown(now, hours, &[Dimension::Service, Dimension::Account])?;
        let mut top: Vec<BreakdownItem> = breakdown.items.into_iter().take(top_n).collect();

        for item in &mut top {
            let (Some(service), Some(account)) = (
                item.key.get(Dimension::Service).map(str::to_string),
                item.key.get(Dimension::Account).map(str::to_string),
            ) else {
                continue;
            };
            let last_month = match self.last_month_cost(now, &service, &account) {
                Ok(cost) => cost,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        "skipping last-month comparison for {}:{}: {}",
                        service, account, err
                    );
                    continue;
                }
            };
            if last_month > 0.0 {
                let daily_avg_last_month = last_month / 30.0;
                let current_daily_rate = item.cost * (24.0 / f64::from(hours));
                item.change_from_last_month = Some(
                    (current_daily_rate - daily_avg_last_month) / daily_avg_last_month * 100.0,
                );
            }
        }
        Ok(top)
    }

    fn last_month_cost(
        &mut self,
        now: DateTime<Utc>,
        service: &str,
        account: &str,
    ) -> Result<f64, CollectorError> {
        let (start, end) = previous_month_bounds(now);
        let month = format!("{:04}-{:02}", start.year(), start.month());
        if let Some(cached) = self.cache.get(service, account, &month) {
            return Ok(cached);
        }

        let query = CostQuery {
            start,
            end,
            granularity: Granularity::Monthly,
            group_by: vec![Dimension::Service, Dimension::Account],
            filter: vec![
                (Dimension::Service, service.to_string()),
                (Dimension::Account, account.to_string()),
            ],
        };
        let cost = self
            .collector
            .fetch_cost_usage(&query)?
            .iter()
            .map(|s| s.cost)
            .sum();
        self.cache.insert(service, account, &month, cost);
        Ok(cost)
    }
}

/// [start, end) of the calendar month before the one containing `now`.
fn previous_month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let this_month = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (prev_year, prev_month) = if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    };
    let start = Utc
        .with_ymd_and_hms(prev_year, prev_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(this_month);
    (start, this_month)
}
