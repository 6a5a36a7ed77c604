//! Run Configuration
//!
//! Tolerances, search bounds and preprocessing switches for one run.
//! Layered: defaults or a preset, then a JSON file, then environment
//! variables, then whatever the caller (CLI) sets last.

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const ENV_TOLERANCE: &str = "RECON_TOLERANCE";
pub const ENV_SUBSET_SEARCH_BOUND: &str = "RECON_SUBSET_SEARCH_BOUND";

/// Largest accepted subset-search bound; the search visits 2^bound subsets
pub const MAX_SUBSET_SEARCH_BOUND: usize = 30;

/// What to do with a series that has data but no normalization factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFactorPolicy {
    /// Drop the series from the normalized table
    #[default]
    Exclude,
    /// Keep the series at scale 1.0
    Unscaled,
}

/// Calendar preprocessing applied to the raw table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Remove 29 February from the date axis
    pub drop_leap_days: bool,

    /// Fill interior gaps of at most this many dates by linear interpolation
    pub interpolation_limit: Option<usize>,

    /// Cut aggregates at the earliest last-present date across keys
    pub truncate_to_last_common_date: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Absolute difference accepted between computed and reference values
    pub tolerance: f64,

    /// Maximum candidate-set size for the exhaustive subset search
    pub subset_search_bound: usize,

    pub missing_factor_policy: MissingFactorPolicy,

    /// Differences at or below this count as exact in the summary stats
    pub exact_match_epsilon: f64,

    pub calendar: CalendarConfig,

    /// Aggregate keys on the rayon pool
    pub parallel: bool,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            subset_search_bound: 20,
            missing_factor_policy: MissingFactorPolicy::Exclude,
            exact_match_epsilon: 1e-9,
            calendar: CalendarConfig::default(),
            parallel: true,
        }
    }
}

impl ReconConfig {
    /// Tight tolerance for checking aggregation structure
    pub fn structural() -> Self {
        Self {
            tolerance: 0.001,
            ..Self::default()
        }
    }

    /// Loose tolerance for comparing against rounded published figures
    pub fn coarse() -> Self {
        Self {
            tolerance: 10.0,
            ..Self::default()
        }
    }

    /// Preset by name: "default", "structural" or "coarse"
    pub fn preset(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "default" => Ok(Self::default()),
            "structural" => Ok(Self::structural()),
            "coarse" => Ok(Self::coarse()),
            other => Err(ReconError::Config(format!("Unknown preset '{}'", other))),
        }
    }

    /// Read a JSON config file; absent fields take their defaults
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReconError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: ReconConfig = serde_json::from_str(&content)?;
        info!("⚙️  Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `RECON_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TOLERANCE) {
            self.tolerance = raw.trim().parse().map_err(|_| {
                ReconError::Config(format!("{}='{}' is not a number", ENV_TOLERANCE, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_SUBSET_SEARCH_BOUND) {
            self.subset_search_bound = raw.trim().parse().map_err(|_| {
                ReconError::Config(format!(
                    "{}='{}' is not a positive integer",
                    ENV_SUBSET_SEARCH_BOUND, raw
                ))
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ReconError::Config(format!(
                "tolerance must be a finite non-negative number, got {}",
                self.tolerance
            )));
        }
        if self.subset_search_bound == 0 || self.subset_search_bound > MAX_SUBSET_SEARCH_BOUND {
            return Err(ReconError::Config(format!(
                "subset_search_bound must be between 1 and {}, got {}",
                MAX_SUBSET_SEARCH_BOUND, self.subset_search_bound
            )));
        }
        if !self.exact_match_epsilon.is_finite() || self.exact_match_epsilon < 0.0 {
            return Err(ReconError::Config(
                "exact_match_epsilon must be a finite non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_presets() {
        assert_eq!(ReconConfig::structural().tolerance, 0.001);
        assert_eq!(ReconConfig::coarse().tolerance, 10.0);
        assert_eq!(ReconConfig::preset("Coarse").unwrap(), ReconConfig::coarse());
        assert!(ReconConfig::preset("loose").is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ReconConfig =
            serde_json::from_str(r#"{"tolerance": 5.0, "calendar": {"drop_leap_days": true}}"#).unwrap();
        assert_eq!(config.tolerance, 5.0);
        assert_eq!(config.subset_search_bound, 20);
        assert!(config.calendar.drop_leap_days);
        assert_eq!(config.calendar.interpolation_limit, None);
        assert_eq!(config.missing_factor_policy, MissingFactorPolicy::Exclude);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [(ENV_TOLERANCE, "2.5"), (ENV_SUBSET_SEARCH_BOUND, "12")].into();
        let config = ReconConfig::default()
            .with_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.tolerance, 2.5);
        assert_eq!(config.subset_search_bound, 12);

        let bad = ReconConfig::default().with_overrides_from(|name| {
            (name == ENV_TOLERANCE).then(|| "lots".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ReconConfig::default();
        config.tolerance = -1.0;
        assert!(config.validate().is_err());

        let mut config = ReconConfig::default();
        config.subset_search_bound = 0;
        assert!(config.validate().is_err());

        assert!(ReconConfig::default().validate().is_ok());
    }
}
