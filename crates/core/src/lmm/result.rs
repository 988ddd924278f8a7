use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::diagnostics::wald::{wald_test, WaldTest};
use crate::error::{LmmError, Result};

/// The two variance components of `y = Xb + g + e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceComponent {
    /// tau: variance of the polygenic effect g ~ N(0, tau K).
    Genetic,
    /// sigma^2: variance of the residual e ~ N(0, sigma^2 I).
    Residual,
}

impl fmt::Display for VarianceComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarianceComponent::Genetic => write!(f, "tau"),
            VarianceComponent::Residual => write!(f, "sigma2"),
        }
    }
}

/// Whether the variance-component search met its stopping rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitStatus {
    Converged { iterations: usize },
    /// The iteration budget ran out; estimates are the last iterate.
    NotConverged { iterations: usize, change: f64 },
}

/// Non-fatal annotations on a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitWarning {
    /// The component was clamped to zero at the non-negativity boundary.
    BoundarySolution { component: VarianceComponent },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::BoundarySolution { component } => {
                write!(f, "{} estimate is on the boundary (clamped to 0)", component)
            }
        }
    }
}

/// Information about a single REML iteration.
#[derive(Debug, Clone)]
pub struct RemlIteration {
    pub iteration: usize,
    pub log_likelihood: f64,
    pub tau: f64,
    pub sigma2: f64,
    /// Value of the solver's stopping statistic after this iteration.
    pub change: f64,
}

/// The result of fitting `y = Xb + g + e` by REML.
#[derive(Debug, Clone)]
pub struct MixedModelFit {
    /// Name of the strategy that produced the fit.
    pub strategy: &'static str,
    /// Fixed-effect estimates (BLUP_beta), one per column of X.
    pub beta: DVector<f64>,
    /// Covariance matrix of `beta`: (X' V^{-1} X)^{-1}.
    pub varbeta: DMatrix<f64>,
    /// Genetic variance component.
    pub tau: f64,
    /// Residual variance component.
    pub sigma2: f64,
    /// Restricted log-likelihood at the reported estimates.
    pub log_likelihood: f64,
    /// BLUP of the polygenic effect: tau K P y.
    pub blup_omega: DVector<f64>,
    pub status: FitStatus,
    pub warnings: Vec<FitWarning>,
    pub history: Vec<RemlIteration>,
    pub n_obs: usize,
}

impl MixedModelFit {
    pub fn n_fixed(&self) -> usize {
        self.beta.len()
    }

    pub fn is_converged(&self) -> bool {
        matches!(self.status, FitStatus::Converged { .. })
    }

    pub fn n_iterations(&self) -> usize {
        match self.status {
            FitStatus::Converged { iterations } | FitStatus::NotConverged { iterations, .. } => {
                iterations
            }
        }
    }

    /// Turn a non-converged fit into `LmmError::NotConverged`.
    pub fn require_converged(self) -> Result<Self> {
        match self.status {
            FitStatus::Converged { .. } => Ok(self),
            FitStatus::NotConverged { iterations, change } => {
                Err(LmmError::NotConverged { iterations, change })
            }
        }
    }

    pub fn is_boundary(&self, component: VarianceComponent) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, FitWarning::BoundarySolution { component: c } if *c == component))
    }

    /// Proportion of phenotypic variance attributed to the polygenic effect.
    pub fn heritability(&self) -> f64 {
        let total = self.tau + self.sigma2;
        if total > 0.0 {
            self.tau / total
        } else {
            0.0
        }
    }

    /// Standard error of fixed effect `j`.
    pub fn standard_error(&self, j: usize) -> Result<f64> {
        self.check_index(j)?;
        Ok(self.varbeta[(j, j)].max(0.0).sqrt())
    }

    /// Wald test of `beta_j = 0`.
    pub fn test(&self, j: usize) -> Result<WaldTest> {
        self.check_index(j)?;
        Ok(wald_test(j, self.beta[j], self.varbeta[(j, j)]))
    }

    /// Wald z statistic `beta_j / sqrt(Var(beta_j))`.
    pub fn z_statistic(&self, j: usize) -> Result<f64> {
        Ok(self.test(j)?.z)
    }

    /// AIC = -2 * logL + 2 * k, with k = 2 variance parameters.
    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * 2.0
    }

    /// BIC = -2 * logL + k * ln(n - rank(X)).
    pub fn bic(&self) -> f64 {
        let n_eff = (self.n_obs - self.n_fixed()) as f64;
        -2.0 * self.log_likelihood + 2.0 * n_eff.ln()
    }

    fn check_index(&self, j: usize) -> Result<()> {
        if j >= self.n_fixed() {
            return Err(LmmError::InvalidParameter(format!(
                "Fixed effect index {} out of range ({} fixed effects)",
                j,
                self.n_fixed()
            )));
        }
        Ok(())
    }

    /// Print a formatted summary of the model fit.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str(&format!("=== Mixed Model Fit ({}) ===\n\n", self.strategy));
        s.push_str(&format!(
            "Observations: {}   Fixed params: {}\n",
            self.n_obs,
            self.n_fixed()
        ));
        match self.status {
            FitStatus::Converged { iterations } => {
                s.push_str(&format!("Converged: true   Iterations: {}\n\n", iterations));
            }
            FitStatus::NotConverged { iterations, change } => s.push_str(&format!(
                "Converged: false   Iterations: {}   Last change: {:.3e}\n\n",
                iterations, change
            )),
        }

        s.push_str(&format!("Log-likelihood: {:.4}\n", self.log_likelihood));
        s.push_str(&format!("AIC: {:.4}\n", self.aic()));
        s.push_str(&format!("BIC: {:.4}\n\n", self.bic()));

        s.push_str("--- Variance Components ---\n");
        s.push_str(&format!("  tau:    {:.6}\n", self.tau));
        s.push_str(&format!("  sigma2: {:.6}\n", self.sigma2));
        s.push_str(&format!("  h2:     {:.4}\n", self.heritability()));
        for w in &self.warnings {
            s.push_str(&format!("  warning: {}\n", w));
        }

        s.push_str("\n--- Fixed Effects (BLUP_beta) ---\n");
        for j in 0..self.n_fixed() {
            let se = self.standard_error(j).unwrap_or(f64::NAN);
            s.push_str(&format!("  beta[{}]: {:.6} (SE: {:.6})\n", j, self.beta[j], se));
        }

        s
    }
}
