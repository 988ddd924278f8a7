use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};

use crate::config::RemlOptions;
use crate::error::{LmmError, Result};
use crate::genetics::{KinshipMatrix, SpectralDecomposition};

use super::ai_reml::AiReml;
use super::eigen_reml::EigenReml;
use super::result::MixedModelFit;

/// How the polygenic covariance K is supplied to a solver.
#[derive(Debug, Clone, Copy)]
pub enum CovarianceInput<'a> {
    /// The kinship matrix itself.
    Kinship(&'a KinshipMatrix),
    /// A precomputed eigendecomposition of K.
    Spectral(&'a SpectralDecomposition),
}

impl CovarianceInput<'_> {
    pub fn n_subjects(&self) -> usize {
        match self {
            CovarianceInput::Kinship(k) => k.n_subjects(),
            CovarianceInput::Spectral(s) => s.n_subjects(),
        }
    }
}

/// A REML estimator for `y = Xb + g + e`, `g ~ N(0, tau K)`,
/// `e ~ N(0, sigma^2 I)`.
pub trait FittingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the strategy works from an eigendecomposition of K, so
    /// callers holding both should pass `CovarianceInput::Spectral`.
    fn uses_decomposition(&self) -> bool {
        true
    }

    fn fit(
        &self,
        y: &DVector<f64>,
        x: &DMatrix<f64>,
        covariance: CovarianceInput<'_>,
    ) -> Result<MixedModelFit>;
}

/// Selectable REML algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Eigen-form REML on the rotated model.
    #[default]
    Eigen,
    /// Average-information REML on K directly.
    AiReml,
}

impl Algorithm {
    pub fn strategy(self, options: &RemlOptions) -> Box<dyn FittingStrategy> {
        match self {
            Algorithm::Eigen => Box::new(EigenReml::from_options(options)),
            Algorithm::AiReml => Box::new(AiReml::from_options(options)),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Eigen => write!(f, "eigen"),
            Algorithm::AiReml => write!(f, "ai"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eigen" => Ok(Algorithm::Eigen),
            "ai" | "ai-reml" | "ai_reml" => Ok(Algorithm::AiReml),
            other => Err(LmmError::InvalidParameter(format!(
                "Unknown algorithm '{}' (expected 'eigen' or 'ai')",
                other
            ))),
        }
    }
}

/// Fit with the strategy suited to the covariance input: the eigen form
/// when a decomposition is available, AI-REML on K otherwise.
pub fn fit_mixed_model(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    covariance: CovarianceInput<'_>,
    options: &RemlOptions,
) -> Result<MixedModelFit> {
    match covariance {
        CovarianceInput::Spectral(_) => EigenReml::from_options(options).fit(y, x, covariance),
        CovarianceInput::Kinship(_) => AiReml::from_options(options).fit(y, x, covariance),
    }
}

/// Shape and content checks shared by every strategy.
pub(crate) fn validate_problem(y: &DVector<f64>, x: &DMatrix<f64>, n_kinship: usize) -> Result<()> {
    let n = y.len();
    if x.nrows() != n {
        return Err(LmmError::DimensionMismatch {
            expected: n,
            got: x.nrows(),
            context: "design matrix rows".into(),
        });
    }
    if n_kinship != n {
        return Err(LmmError::DimensionMismatch {
            expected: n,
            got: n_kinship,
            context: "kinship dimension".into(),
        });
    }
    if x.ncols() == 0 {
        return Err(LmmError::InvalidParameter(
            "Design matrix must have at least one column".into(),
        ));
    }
    if n <= x.ncols() {
        return Err(LmmError::InvalidParameter(format!(
            "Need more observations ({}) than fixed effects ({})",
            n,
            x.ncols()
        )));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(LmmError::Data("Phenotype contains non-finite values".into()));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LmmError::Data("Design matrix contains non-finite values".into()));
    }
    Ok(())
}
