use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{LmmError, Result};
use crate::types::MISSING;

use super::genotype::{AlleleFrequencySummary, GenotypeMatrix};

/// How each marker column is centered and scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardizationMode {
    /// `(G - 2f) / sqrt(2f(1-f))`: Hardy-Weinberg expected variance.
    #[default]
    P,
    /// `G - 2f`: centering only.
    Mu,
    /// `(G - mu) / sigma` with the empirical standard deviation.
    MuSigma,
}

impl std::str::FromStr for StandardizationMode {
    type Err = LmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p" => Ok(Self::P),
            "mu" => Ok(Self::Mu),
            "mu_sigma" | "mu-sigma" => Ok(Self::MuSigma),
            other => Err(LmmError::InvalidParameter(format!(
                "Unknown standardization mode '{}'. Use 'p', 'mu' or 'mu_sigma'.",
                other
            ))),
        }
    }
}

/// Standardized genotypes: column j holds `(G[,j] - mu_j) / sigma_j` with
/// missing entries set to 0, i.e. imputed to the column mean.
#[derive(Debug, Clone)]
pub struct StandardizedMatrix {
    values: DMatrix<f64>,
    mode: StandardizationMode,
}

impl StandardizedMatrix {
    /// Wrap an already standardized matrix.
    pub fn from_matrix(values: DMatrix<f64>, mode: StandardizationMode) -> Self {
        Self { values, mode }
    }

    pub fn n_subjects(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.values.ncols()
    }

    pub fn mode(&self) -> StandardizationMode {
        self.mode
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn column(&self, marker: usize) -> nalgebra::DVectorView<'_, f64> {
        self.values.column(marker)
    }
}

/// Standardize a genotype matrix marker by marker.
///
/// # Errors
///
/// * `LmmError::DimensionMismatch` if the summary does not cover every marker.
/// * `LmmError::DegenerateColumn` if a marker's scale is zero or undefined
///   (`freq` of 0, 1 or NaN in `P` mode; zero empirical sigma in `MuSigma`
///   mode). `Mu` mode only rejects markers with no observed entry.
pub fn standardize(
    genotypes: &GenotypeMatrix,
    summary: &AlleleFrequencySummary,
    mode: StandardizationMode,
) -> Result<StandardizedMatrix> {
    let n = genotypes.n_subjects();
    let p = genotypes.n_markers();

    if summary.n_markers() != p {
        return Err(LmmError::DimensionMismatch {
            expected: p,
            got: summary.n_markers(),
            context: "allele frequency summary vs number of markers".into(),
        });
    }

    let mut values = DMatrix::zeros(n, p);
    for j in 0..p {
        let freq = summary.freq[j];
        let (center, scale) = match mode {
            StandardizationMode::P => {
                if !(freq > 0.0 && freq < 1.0) {
                    return Err(LmmError::DegenerateColumn { marker: j, freq });
                }
                (2.0 * freq, (2.0 * freq * (1.0 - freq)).sqrt())
            }
            StandardizationMode::Mu => {
                if freq.is_nan() {
                    return Err(LmmError::DegenerateColumn { marker: j, freq });
                }
                (summary.mu[j], 1.0)
            }
            StandardizationMode::MuSigma => {
                let sigma = summary.sigma[j];
                if !(sigma > 0.0) {
                    return Err(LmmError::DegenerateColumn { marker: j, freq });
                }
                (summary.mu[j], sigma)
            }
        };

        let column = genotypes.column(j);
        let mut out = values.column_mut(j);
        for (i, &d) in column.iter().enumerate() {
            if d != MISSING {
                out[i] = (d as f64 - center) / scale;
            }
        }
    }

    Ok(StandardizedMatrix { values, mode })
}
