use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};
use crate::genetics::StandardizationMode;

/// Parameters of one simulated genotype/phenotype data set.
///
/// Defaults reproduce the reference scenario: 1000 subjects, 10000 markers,
/// 50 causal markers, signal-to-noise ratio 2, seed 345321.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub n_subjects: usize,
    pub n_markers: usize,
    pub n_causal: usize,
    pub signal_to_noise: f64,
    /// Candidate allele frequencies; each marker draws one uniformly.
    pub allele_frequencies: Vec<f64>,
    /// Fraction of genotype cells set to missing.
    pub missing_rate: f64,
    pub seed: u64,
    pub standardization: StandardizationMode,
    /// Drop markers that came out monomorphic instead of failing on them.
    pub drop_monomorphic: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_subjects: 1000,
            n_markers: 10_000,
            n_causal: 50,
            signal_to_noise: 2.0,
            allele_frequencies: vec![0.05, 0.1, 0.2, 0.3, 0.4, 0.5],
            missing_rate: 0.01,
            seed: 345_321,
            standardization: StandardizationMode::P,
            drop_monomorphic: false,
        }
    }
}

impl SimulationConfig {
    /// Load a configuration from a JSON file. Missing fields take their
    /// default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of genotype cells to mark missing.
    pub fn n_missing(&self) -> usize {
        ((self.n_subjects * self.n_markers) as f64 * self.missing_rate).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_subjects == 0 || self.n_markers == 0 {
            return Err(LmmError::InvalidParameter(format!(
                "n_subjects and n_markers must be positive, got {} and {}",
                self.n_subjects, self.n_markers
            )));
        }
        if self.n_causal > self.n_markers {
            return Err(LmmError::InvalidParameter(format!(
                "n_causal ({}) exceeds n_markers ({})",
                self.n_causal, self.n_markers
            )));
        }
        if !(self.signal_to_noise.is_finite() && self.signal_to_noise > 0.0) {
            return Err(LmmError::InvalidParameter(format!(
                "signal_to_noise must be positive, got {}",
                self.signal_to_noise
            )));
        }
        if !(0.0..=1.0).contains(&self.missing_rate) {
            return Err(LmmError::InvalidParameter(format!(
                "missing_rate must be in [0, 1], got {}",
                self.missing_rate
            )));
        }
        Ok(())
    }
}

/// Stopping rules shared by the REML solvers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemlOptions {
    /// Maximum number of iterations. Zero evaluates the starting point only
    /// and reports non-convergence.
    pub max_iter: usize,
    /// Convergence tolerance (gradient / relative parameter change).
    pub tol: f64,
}

impl Default for RemlOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-8,
        }
    }
}

impl RemlOptions {
    pub fn new(max_iter: usize, tol: f64) -> Self {
        Self { max_iter, tol }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_reference_scenario() {
        let c = SimulationConfig::default();
        assert_eq!(c.n_subjects, 1000);
        assert_eq!(c.n_markers, 10_000);
        assert_eq!(c.n_causal, 50);
        assert_eq!(c.seed, 345_321);
        assert_eq!(c.n_missing(), 100_000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let c: SimulationConfig =
            serde_json::from_str(r#"{"n_subjects": 20, "standardization": "mu_sigma"}"#).unwrap();
        assert_eq!(c.n_subjects, 20);
        assert_eq!(c.n_markers, 10_000);
        assert_eq!(c.standardization, StandardizationMode::MuSigma);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = SimulationConfig {
            n_causal: 20,
            n_markers: 10,
            ..SimulationConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SimulationConfig {
            signal_to_noise: 0.0,
            ..SimulationConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SimulationConfig {
            missing_rate: 1.5,
            ..SimulationConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reml_options_json() {
        let o: RemlOptions = serde_json::from_str(r#"{"max_iter": 0}"#).unwrap();
        assert_eq!(o.max_iter, 0);
        assert_eq!(o.tol, 1e-8);
    }
}
