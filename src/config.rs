//! Layered configuration: built-in defaults, an optional TOML file, then
//! `COSTWATCH_*` environment overrides. Validation happens once at load
//! time; the core receives an owned, already-checked `Config`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::anomaly::Sensitivity;
use crate::error::ConfigError;
use crate::model::Dimension;
use crate::retry::RetryPolicy;

/// Longest supported lookback: one year of hourly buckets.
const MAX_LOOKBACK_HOURS: u32 = 365 * 24;
const MAX_PARALLEL_FETCHES: usize = 64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Detection sensitivity, the single z-score knob.
    pub sensitivity: Sensitivity,
    /// Trailing analysis window in hours.
    pub lookback_hours: u32,
    /// Grouping dimensions, validated against the allow-list.
    pub group_by: Vec<Dimension>,
    /// Explicit z-score threshold; overrides the sensitivity mapping.
    pub threshold_override: Option<f64>,
    /// Upper bound on concurrent metric fetches.
    pub max_parallel_fetches: usize,
    /// TTL for the monthly cost cache.
    pub cache_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::Medium,
            lookback_hours: 168,
            group_by: vec![Dimension::Service, Dimension::Account],
            threshold_override: None,
            max_parallel_fetches: 10,
            cache_ttl_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load defaults, then the file (if given), then environment overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&text)?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `COSTWATCH_*` overrides through an injectable lookup so tests
    /// do not mutate the process environment.
    pub fn apply_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = get("COSTWATCH_SENSITIVITY") {
            self.sensitivity = parse_sensitivity(&value)?;
        }
        if let Some(value) = get("COSTWATCH_LOOKBACK_HOURS") {
            self.lookback_hours = parse_number(&value, "lookback_hours")?;
        }
        if let Some(value) = get("COSTWATCH_GROUP_BY") {
            self.group_by = parse_group_by(&value)?;
        }
        if let Some(value) = get("COSTWATCH_THRESHOLD") {
            self.threshold_override = Some(parse_number(&value, "threshold_override")?);
        }
        if let Some(value) = get("COSTWATCH_MAX_PARALLEL_FETCHES") {
            self.max_parallel_fetches = parse_number(&value, "max_parallel_fetches")?;
        }
        if let Some(value) = get("COSTWATCH_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_number(&value, "cache_ttl_secs")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_hours == 0 || self.lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(ConfigError::InvalidValue {
                field: "lookback_hours".to_string(),
                reason: format!("must be between 1 and {}", MAX_LOOKBACK_HOURS),
            });
        }
        if let Some(threshold) = self.threshold_override {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "threshold_override".to_string(),
                    reason: "must be a positive number".to_string(),
                });
            }
        }
        if self.max_parallel_fetches == 0 || self.max_parallel_fetches > MAX_PARALLEL_FETCHES {
            return Err(ConfigError::InvalidValue {
                field: "max_parallel_fetches".to_string(),
                reason: format!("must be between 1 and {}", MAX_PARALLEL_FETCHES),
            });
        }
        if self.group_by.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "group_by".to_string(),
                reason: "at least one grouping dimension is required".to_string(),
            });
        }
        let mut seen = Vec::new();
        for dim in &self.group_by {
            if seen.contains(dim) {
                return Err(ConfigError::InvalidValue {
                    field: "group_by".to_string(),
                    reason: format!("duplicate dimension: {}", dim),
                });
            }
            seen.push(*dim);
        }
        Ok(())
    }
}

fn parse_sensitivity(value: &str) -> Result<Sensitivity, ConfigError> {
    match value {
        "low" => Ok(Sensitivity::Low),
        "medium" => Ok(Sensitivity::Medium),
        "high" => Ok(Sensitivity::High),
        other => Err(ConfigError::InvalidValue {
            field: "sensitivity".to_string(),
            reason: format!("unknown level: {}", other),
        }),
    }
}

/// Parse a comma-separated dimension list against the allow-list.
pub fn parse_group_by(value: &str) -> Result<Vec<Dimension>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Dimension::from_str)
        .collect()
}

fn parse_number<T: FromStr>(value: &str, field: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("cannot parse {:?}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_name: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sensitivity, Sensitivity::Medium);
        assert_eq!(config.lookback_hours, 168);
        assert_eq!(config.max_parallel_fetches, 10);
    }

    #[test]
    fn test_from_toml() {
        let config: Config = toml::from_str(
            r#"
            sensitivity = "high"
            lookback_hours = 72
            group_by = ["service", "region"]
            threshold_override = 2.5

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.sensitivity, Sensitivity::High);
        assert_eq!(config.lookback_hours, 72);
        assert_eq!(
            config.group_by,
            vec![Dimension::Service, Dimension::Region]
        );
        assert_eq!(config.threshold_override, Some(2.5));
        assert_eq!(config.retry.max_retries, 5);
        // Unset fields keep defaults.
        assert_eq!(config.max_parallel_fetches, 10);
    }

    #[test]
    fn test_toml_rejects_unknown_fields() {
        let result: Result<Config, _> = toml::from_str("sensitivty = \"low\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut env = HashMap::new();
        env.insert("COSTWATCH_SENSITIVITY", "low");
        env.insert("COSTWATCH_LOOKBACK_HOURS", "48");
        env.insert("COSTWATCH_GROUP_BY", "account, service");
        env.insert("COSTWATCH_THRESHOLD", "3.5");

        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sensitivity, Sensitivity::Low);
        assert_eq!(config.lookback_hours, 48);
        assert_eq!(
            config.group_by,
            vec![Dimension::Account, Dimension::Service]
        );
        assert_eq!(config.threshold_override, Some(3.5));
    }

    #[test]
    fn test_env_override_rejects_bad_values() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "COSTWATCH_SENSITIVITY").then(|| "extreme".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_group_by_allow_list() {
        assert_eq!(
            parse_group_by("service,account").unwrap(),
            vec![Dimension::Service, Dimension::Account]
        );
        assert!(parse_group_by("service,team").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_lookback() {
        let config = Config {
            lookback_hours: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let config = Config {
            threshold_override: Some(-1.0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_too_many_workers() {
        let config = Config {
            max_parallel_fetches: 500,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_dimensions() {
        let config = Config {
            group_by: vec![Dimension::Service, Dimension::Service],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_group_by() {
        let config = Config {
            group_by: Vec::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let mut config = Config::default();
        config.apply_overrides(no_env).unwrap();
        assert_eq!(config, Config::default());
    }
}
