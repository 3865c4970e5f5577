//! Run configuration, loadable from TOML.

use crate::activity::ActivityMethod;
use crate::association::{DEFAULT_BINS, Discretization, MAX_BINS};
use crate::consensus::RankBasis;
use crate::holdout::PriorHoldout;
use crate::pseudobulk::PseudobulkConfig;
use crate::regression::RegressionMethod;
use crate::regression::attribution::VarianceAttribution;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub bootstraps: usize,
    pub seed: u64,
    /// Cooperating workers, including the coordinator.
    pub workers: usize,
    /// Work units handed out per claim.
    pub chunk_size: usize,
    /// Longest wait on a handoff between workers before the run is aborted. Waits
    /// for peers that are still scoring or fitting are not bounded by it.
    pub coordination_timeout_secs: u64,
    pub bins: usize,
    pub discretization: Discretization,
    pub regression: RegressionMethod,
    pub attribution: VarianceAttribution,
    /// Weight given to prior-supported regulators during model selection.
    pub prior_weight: f64,
    pub activity: ActivityMethod,
    /// Enables single-cell pseudobulk mode.
    pub pseudobulk: Option<PseudobulkConfig>,
    /// Keeps part of the prior out of fitting for later evaluation.
    pub prior_holdout: Option<PriorHoldout>,
    pub rank_basis: RankBasis,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bootstraps: 2,
            seed: 42,
            workers: num_cpus::get(),
            chunk_size: 25,
            coordination_timeout_secs: 600,
            bins: DEFAULT_BINS,
            discretization: Discretization::default(),
            regression: RegressionMethod::default(),
            attribution: VarianceAttribution::default(),
            prior_weight: 1.0,
            activity: ActivityMethod::default(),
            pseudobulk: None,
            prior_holdout: None,
            rank_basis: RankBasis::default(),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter(message.into())
}

impl RunConfig {
    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_secs(self.coordination_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstraps == 0 {
            return Err(invalid("bootstraps must be at least 1"));
        }
        if self.workers == 0 {
            return Err(invalid("workers must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be at least 1"));
        }
        if self.coordination_timeout_secs == 0 {
            return Err(invalid("coordination_timeout_secs must be positive"));
        }
        if !(2..=MAX_BINS).contains(&self.bins) {
            return Err(invalid(format!("bins must be in 2..={MAX_BINS}, got {}", self.bins)));
        }
        if !self.prior_weight.is_finite() || self.prior_weight < 1.0 {
            return Err(invalid(format!(
                "prior_weight must be a finite value of at least 1, got {}",
                self.prior_weight
            )));
        }
        match &self.regression {
            RegressionMethod::BestSubset(config) => {
                if config.candidates == 0 {
                    return Err(invalid("best_subset.candidates must be at least 1"));
                }
                if config.max_model_size == Some(0) {
                    return Err(invalid("best_subset.max_model_size must be at least 1"));
                }
            }
            RegressionMethod::ElasticNet(config) => {
                if !(0.0..=1.0).contains(&config.l1_ratio) {
                    return Err(invalid(format!(
                        "elastic_net.l1_ratio must lie in [0, 1], got {}",
                        config.l1_ratio
                    )));
                }
                if config.folds < 2 {
                    return Err(invalid("elastic_net.folds must be at least 2"));
                }
                if config.max_iterations == 0 || config.n_lambdas == 0 {
                    return Err(invalid(
                        "elastic_net.max_iterations and n_lambdas must be positive",
                    ));
                }
                if config.max_candidates == Some(0) {
                    return Err(invalid("elastic_net.max_candidates must be at least 1"));
                }
            }
        }
        if let Some(pseudobulk) = &self.pseudobulk {
            if pseudobulk.clusters == 0 {
                return Err(invalid("pseudobulk.clusters must be at least 1"));
            }
        }
        if let Some(holdout) = &self.prior_holdout {
            if !(holdout.ratio > 0.0 && holdout.ratio < 1.0) {
                return Err(invalid(format!(
                    "prior_holdout.ratio must lie strictly between 0 and 1, got {}",
                    holdout.ratio
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holdout::HoldoutAxis;
    use crate::regression::elastic_net::ElasticNetConfig;

    #[test]
    fn partial_toml_fills_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            bootstraps = 5
            seed = 1
            workers = 3
            activity = "expression"

            [regression]
            method = "elastic_net"
            l1_ratio = 0.8

            [pseudobulk]
            clusters = 12

            [prior_holdout]
            axis = "edges"
            "#,
        )
        .unwrap();
        assert_eq!(config.bootstraps, 5);
        assert_eq!(config.workers, 3);
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.activity, ActivityMethod::Expression);
        assert_eq!(
            config.regression,
            RegressionMethod::ElasticNet(ElasticNetConfig {
                l1_ratio: 0.8,
                ..ElasticNetConfig::default()
            })
        );
        assert_eq!(config.pseudobulk.unwrap().clusters, 12);
        assert_eq!(
            config.prior_holdout,
            Some(PriorHoldout {
                ratio: 0.2,
                axis: HoldoutAxis::Edges,
            })
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_bootstraps = RunConfig {
            bootstraps: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            zero_bootstraps.validate(),
            Err(ConfigError::InvalidParameter(_))
        ));
        let one_bin = RunConfig {
            bins: 1,
            ..RunConfig::default()
        };
        assert!(one_bin.validate().is_err());
        let huge_histogram = RunConfig {
            bins: 65_535,
            ..RunConfig::default()
        };
        assert!(matches!(
            huge_histogram.validate(),
            Err(ConfigError::InvalidParameter(ref message)) if message.contains("2..=256")
        ));
        let bad_ratio = RunConfig {
            regression: RegressionMethod::ElasticNet(ElasticNetConfig {
                l1_ratio: 1.5,
                ..ElasticNetConfig::default()
            }),
            ..RunConfig::default()
        };
        assert!(bad_ratio.validate().is_err());
        let whole_prior_held_out = RunConfig {
            prior_holdout: Some(PriorHoldout {
                ratio: 1.0,
                ..PriorHoldout::default()
            }),
            ..RunConfig::default()
        };
        assert!(whole_prior_held_out.validate().is_err());
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let config = RunConfig {
            bootstraps: 7,
            workers: 2,
            ..RunConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }
}
