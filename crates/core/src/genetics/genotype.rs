use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{LmmError, Result};
use crate::types::{Dosage, MISSING};

/// An `n_subjects x n_markers` matrix of allele dosages.
///
/// Entries are 0, 1, 2 (copies of the alternate allele) or [`MISSING`].
/// The matrix is immutable once constructed; every derived quantity is a new
/// value.
#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeMatrix {
    dosages: DMatrix<Dosage>,
}

impl GenotypeMatrix {
    /// Wrap a dosage matrix, rejecting any entry outside {0, 1, 2, MISSING}.
    pub fn new(dosages: DMatrix<Dosage>) -> Result<Self> {
        for j in 0..dosages.ncols() {
            for i in 0..dosages.nrows() {
                let d = dosages[(i, j)];
                if d != MISSING && !(0..=2).contains(&d) {
                    return Err(LmmError::Data(format!(
                        "Invalid dosage {} at subject {}, marker {}",
                        d, i, j
                    )));
                }
            }
        }
        Ok(Self { dosages })
    }

    /// Build from row-major dosages.
    pub fn from_row_slice(n_subjects: usize, n_markers: usize, values: &[Dosage]) -> Result<Self> {
        if values.len() != n_subjects * n_markers {
            return Err(LmmError::DimensionMismatch {
                expected: n_subjects * n_markers,
                got: values.len(),
                context: "dosage values vs n_subjects * n_markers".into(),
            });
        }
        Self::new(DMatrix::from_row_slice(n_subjects, n_markers, values))
    }

    pub fn n_subjects(&self) -> usize {
        self.dosages.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.dosages.ncols()
    }

    /// Dosage at (subject, marker), or `None` when missing.
    pub fn get(&self, subject: usize, marker: usize) -> Option<Dosage> {
        match self.dosages[(subject, marker)] {
            MISSING => None,
            d => Some(d),
        }
    }

    pub fn is_missing(&self, subject: usize, marker: usize) -> bool {
        self.dosages[(subject, marker)] == MISSING
    }

    /// Raw column, with [`MISSING`] sentinels left in place.
    pub fn column(&self, marker: usize) -> &[Dosage] {
        let n = self.n_subjects();
        &self.dosages.as_slice()[marker * n..(marker + 1) * n]
    }

    pub fn as_matrix(&self) -> &DMatrix<Dosage> {
        &self.dosages
    }

    /// Total number of missing cells.
    pub fn n_missing(&self) -> usize {
        self.dosages.iter().filter(|&&d| d == MISSING).count()
    }

    /// A new matrix holding only the given marker columns, in the given order.
    pub fn select_markers(&self, markers: &[usize]) -> Result<Self> {
        let p = self.n_markers();
        if let Some(&bad) = markers.iter().find(|&&j| j >= p) {
            return Err(LmmError::InvalidParameter(format!(
                "Marker index {} out of range (n_markers = {})",
                bad, p
            )));
        }
        Ok(Self {
            dosages: self.dosages.select_columns(markers),
        })
    }

    /// Compute per-marker allele frequency summaries.
    pub fn summarize(&self) -> AlleleFrequencySummary {
        AlleleFrequencySummary::from_genotypes(self)
    }
}

/// Per-marker allele frequency summary.
///
/// `freq` is the alternate-allele frequency over observed entries, `mu` the
/// expected dosage `2 * freq`, and `sigma` the empirical standard deviation
/// of observed dosages. Markers with no observed entry have `freq = NaN`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlleleFrequencySummary {
    pub freq: Vec<f64>,
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
    pub n_observed: Vec<usize>,
}

impl AlleleFrequencySummary {
    pub fn from_genotypes(genotypes: &GenotypeMatrix) -> Self {
        let p = genotypes.n_markers();
        let mut freq = Vec::with_capacity(p);
        let mut mu = Vec::with_capacity(p);
        let mut sigma = Vec::with_capacity(p);
        let mut n_observed = Vec::with_capacity(p);

        for j in 0..p {
            let observed: Vec<f64> = genotypes
                .column(j)
                .iter()
                .filter(|&&d| d != MISSING)
                .map(|&d| d as f64)
                .collect();
            let n_obs = observed.len();
            if n_obs == 0 {
                freq.push(f64::NAN);
                mu.push(f64::NAN);
                sigma.push(f64::NAN);
            } else {
                let m = crate::matrix::dense::mean(&observed);
                freq.push(m / 2.0);
                mu.push(m);
                sigma.push(crate::matrix::dense::sample_variance(&observed).sqrt());
            }
            n_observed.push(n_obs);
        }

        Self {
            freq,
            mu,
            sigma,
            n_observed,
        }
    }

    pub fn n_markers(&self) -> usize {
        self.freq.len()
    }

    /// Standard deviation implied by Hardy-Weinberg equilibrium.
    pub fn hwe_sigma(&self, marker: usize) -> f64 {
        let f = self.freq[marker];
        (2.0 * f * (1.0 - f)).sqrt()
    }

    /// Empirical minus HWE-implied standard deviation. Large deviations point
    /// at population structure or genotyping artifacts.
    pub fn hwe_deviation(&self, marker: usize) -> f64 {
        self.sigma[marker] - self.hwe_sigma(marker)
    }

    /// Minor allele frequency.
    pub fn maf(&self, marker: usize) -> f64 {
        let f = self.freq[marker];
        f.min(1.0 - f)
    }

    /// Indices of markers with 0 < freq < 1.
    pub fn polymorphic_markers(&self) -> Vec<usize> {
        self.freq
            .iter()
            .enumerate()
            .filter(|(_, &f)| f > 0.0 && f < 1.0)
            .map(|(j, _)| j)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    ///       m1  m2  m3
    /// ind1:  2   0   .
    /// ind2:  1   0   1
    /// ind3:  0   0   2
    /// ind4:  1   0   1
    fn small_genotypes() -> GenotypeMatrix {
        GenotypeMatrix::from_row_slice(4, 3, &[
            2, 0, MISSING,
            1, 0, 1,
            0, 0, 2,
            1, 0, 1,
        ])
        .unwrap()
    }

    #[test]
    fn test_dimensions_and_access() {
        let g = small_genotypes();
        assert_eq!(g.n_subjects(), 4);
        assert_eq!(g.n_markers(), 3);
        assert_eq!(g.get(0, 0), Some(2));
        assert_eq!(g.get(0, 2), None);
        assert!(g.is_missing(0, 2));
        assert_eq!(g.n_missing(), 1);
        assert_eq!(g.column(0), &[2, 1, 0, 1]);
    }

    #[test]
    fn test_invalid_dosage_rejected() {
        let result = GenotypeMatrix::from_row_slice(1, 2, &[0, 3]);
        assert!(matches!(result, Err(LmmError::Data(_))));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let result = GenotypeMatrix::from_row_slice(2, 2, &[0, 1, 2]);
        assert!(matches!(result, Err(LmmError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_summary_ignores_missing() {
        let s = small_genotypes().summarize();
        assert_relative_eq!(s.freq[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(s.mu[0], 1.0, epsilon = 1e-12);
        // dosages 2,1,0,1: mean 1, sample variance 2/3
        assert_relative_eq!(s.sigma[0], (2.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(s.n_observed[2], 3);
        assert_relative_eq!(s.freq[2], 4.0 / 6.0, epsilon = 1e-12);
        assert_eq!(s.freq[1], 0.0);
    }

    #[test]
    fn test_hwe_sigma_and_maf() {
        let s = small_genotypes().summarize();
        assert_relative_eq!(s.hwe_sigma(0), 0.5_f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(s.maf(2), 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(
            s.hwe_deviation(0),
            (2.0_f64 / 3.0).sqrt() - 0.5_f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_polymorphic_markers() {
        let s = small_genotypes().summarize();
        assert_eq!(s.polymorphic_markers(), vec![0, 2]);
    }

    #[test]
    fn test_all_missing_column_has_nan_freq() {
        let g = GenotypeMatrix::from_row_slice(2, 1, &[MISSING, MISSING]).unwrap();
        let s = g.summarize();
        assert!(s.freq[0].is_nan());
        assert!(s.polymorphic_markers().is_empty());
    }

    #[test]
    fn test_select_markers() {
        let g = small_genotypes();
        let sub = g.select_markers(&[2, 0]).unwrap();
        assert_eq!(sub.n_markers(), 2);
        assert_eq!(sub.get(1, 0), Some(1));
        assert_eq!(sub.get(0, 1), Some(2));
        assert!(g.select_markers(&[5]).is_err());
    }
}
