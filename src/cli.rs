//! CLI argument parsing for costwatch

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::anomaly::Sensitivity;
use crate::config::{parse_group_by, Config};
use crate::error::ConfigError;

/// Output format for reports and breakdowns
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "costwatch")]
#[command(version)]
#[command(about = "Cloud cost and usage anomaly monitor", long_about = None)]
pub struct Cli {
    /// Recorded billing samples (JSON file)
    #[arg(long, value_name = "FILE")]
    pub input: PathBuf,

    /// Recorded utilization metrics (JSON file)
    #[arg(long, value_name = "FILE")]
    pub metrics: Option<PathBuf>,

    /// Organization account list (JSON file)
    #[arg(long, value_name = "FILE")]
    pub accounts: Option<PathBuf>,

    /// TOML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Detection sensitivity
    #[arg(long, value_enum)]
    pub sensitivity: Option<Sensitivity>,

    /// Lookback window in hours
    #[arg(long = "lookback-hours", value_name = "HOURS")]
    pub lookback_hours: Option<u32>,

    /// Grouping dimensions, comma separated (account, service, region)
    #[arg(long = "group-by", value_name = "DIMS")]
    pub group_by: Option<String>,

    /// Z-score threshold override in standard deviations
    #[arg(long, value_name = "SIGMA")]
    pub threshold: Option<f64>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print the ranked cost breakdown instead of running detection
    #[arg(long)]
    pub breakdown: bool,

    /// Print daily trend statistics and forecast instead of running detection
    #[arg(long)]
    pub trends: bool,

    /// Rows shown in breakdown mode (default: 10)
    #[arg(long, value_name = "N", default_value = "10")]
    pub top: usize,

    /// Enable debug logging to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Fold CLI flags over an already-loaded config. Flags win over both
    /// file and environment values.
    pub fn apply_to(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(sensitivity) = self.sensitivity {
            config.sensitivity = sensitivity;
        }
        if let Some(lookback_hours) = self.lookback_hours {
            config.lookback_hours = lookback_hours;
        }
        if let Some(ref group_by) = self.group_by {
            config.group_by = parse_group_by(group_by)?;
        }
        if let Some(threshold) = self.threshold {
            config.threshold_override = Some(threshold);
        }
        Ok(())
    }
}
