use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::error::{LmmError, Result};

use super::kinship::KinshipMatrix;

/// Eigendecomposition of a kinship matrix, `K = U diag(lambda) U'`.
///
/// Eigenvalues are sorted in descending order and any negative value
/// (floating-point noise near the rank boundary) is clamped to zero, so
/// square roots and inverse weights derived from them are always defined.
#[derive(Debug, Clone)]
pub struct SpectralDecomposition {
    eigenvalues: DVector<f64>,
    eigenvectors: DMatrix<f64>,
    n_clamped: usize,
    min_raw_eigenvalue: f64,
}

impl SpectralDecomposition {
    pub fn from_kinship(kinship: &KinshipMatrix) -> Self {
        Self::from_symmetric(kinship.as_matrix().clone())
    }

    /// Decompose a symmetric matrix. Only the lower triangle is read.
    pub fn from_symmetric(matrix: DMatrix<f64>) -> Self {
        let n = matrix.nrows();
        let eig = SymmetricEigen::new(matrix);

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eig.eigenvalues[b]
                .partial_cmp(&eig.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let min_raw_eigenvalue = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        let mut n_clamped = 0;
        let eigenvalues = DVector::from_iterator(
            n,
            order.iter().map(|&k| {
                let v = eig.eigenvalues[k];
                if v < 0.0 {
                    n_clamped += 1;
                    0.0
                } else {
                    v
                }
            }),
        );
        let eigenvectors = eig.eigenvectors.select_columns(&order);

        if n_clamped > 0 {
            log::debug!(
                "Clamped {} negative eigenvalue(s) to zero (most negative {:.3e})",
                n_clamped,
                min_raw_eigenvalue
            );
        }

        Self {
            eigenvalues,
            eigenvectors,
            n_clamped,
            min_raw_eigenvalue,
        }
    }

    pub fn n_subjects(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Eigenvalues, descending and non-negative.
    pub fn eigenvalues(&self) -> &DVector<f64> {
        &self.eigenvalues
    }

    /// Orthonormal eigenvectors, one per column, matching `eigenvalues()`.
    pub fn eigenvectors(&self) -> &DMatrix<f64> {
        &self.eigenvectors
    }

    /// Number of eigenvalues that were negative before clamping.
    pub fn n_clamped(&self) -> usize {
        self.n_clamped
    }

    /// Smallest eigenvalue before clamping.
    pub fn min_raw_eigenvalue(&self) -> f64 {
        self.min_raw_eigenvalue
    }

    /// Principal components `U diag(sqrt(lambda))`, optionally truncated to
    /// the leading `k` columns.
    pub fn principal_components(&self, k: Option<usize>) -> Result<DMatrix<f64>> {
        let n = self.n_subjects();
        let k = k.unwrap_or(n);
        if k > n {
            return Err(LmmError::InvalidParameter(format!(
                "Requested {} principal components but only {} are available",
                k, n
            )));
        }
        let mut pcs = self.eigenvectors.columns(0, k).into_owned();
        for (j, mut col) in pcs.column_iter_mut().enumerate() {
            col *= self.eigenvalues[j].sqrt();
        }
        Ok(pcs)
    }

    /// Share of total variance carried by each eigenvalue.
    pub fn variance_explained(&self) -> DVector<f64> {
        let total = self.eigenvalues.sum();
        if total <= 0.0 {
            return DVector::zeros(self.n_subjects());
        }
        &self.eigenvalues / total
    }

    /// `U diag(lambda) U'`: the clamped kinship matrix.
    pub fn reconstruct(&self) -> DMatrix<f64> {
        let u = &self.eigenvectors;
        let mut scaled = u.clone();
        for (j, mut col) in scaled.column_iter_mut().enumerate() {
            col *= self.eigenvalues[j];
        }
        let mut k = scaled * u.transpose();
        crate::matrix::dense::mirror_upper(&mut k);
        k
    }

    /// Rotate a vector into the eigenbasis: `U' v`.
    pub fn rotate(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_rows(v.len(), "vector to rotate")?;
        Ok(self.eigenvectors.tr_mul(v))
    }

    /// Rotate every column of a matrix into the eigenbasis: `U' X`.
    pub fn rotate_matrix(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.check_rows(x.nrows(), "matrix to rotate")?;
        Ok(self.eigenvectors.tr_mul(x))
    }

    /// Map a vector from the eigenbasis back: `U v`.
    pub fn unrotate(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_rows(v.len(), "vector to unrotate")?;
        Ok(&self.eigenvectors * v)
    }

    fn check_rows(&self, got: usize, context: &str) -> Result<()> {
        if got != self.n_subjects() {
            return Err(LmmError::DimensionMismatch {
                expected: self.n_subjects(),
                got,
                context: context.into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn kinship_3x3() -> KinshipMatrix {
        KinshipMatrix::from_matrix(DMatrix::from_row_slice(3, 3, &[
            1.0, 0.5, 0.25,
            0.5, 1.0, 0.5,
            0.25, 0.5, 1.0,
        ]))
        .unwrap()
    }

    #[test]
    fn test_eigenvalues_descending() {
        let sd = SpectralDecomposition::from_kinship(&kinship_3x3());
        let ev = sd.eigenvalues();
        assert!(ev[0] >= ev[1] && ev[1] >= ev[2]);
        assert_relative_eq!(ev.sum(), 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_eigenvectors_orthonormal() {
        let sd = SpectralDecomposition::from_kinship(&kinship_3x3());
        let u = sd.eigenvectors();
        let utu = u.transpose() * u;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(utu[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_pc_reconstruction() {
        let k = kinship_3x3();
        let sd = SpectralDecomposition::from_kinship(&k);
        let pcs = sd.principal_components(None).unwrap();
        let rebuilt = &pcs * pcs.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(rebuilt[(i, j)], k.as_matrix()[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_negative_eigenvalues_clamped() {
        // Eigenvalues of [[1, 2], [2, 1]] are 3 and -1.
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let sd = SpectralDecomposition::from_symmetric(m);
        assert_eq!(sd.n_clamped(), 1);
        assert_relative_eq!(sd.min_raw_eigenvalue(), -1.0, epsilon = 1e-10);
        assert!(sd.eigenvalues().iter().all(|&v| v >= 0.0));
        assert_relative_eq!(sd.eigenvalues()[0], 3.0, epsilon = 1e-10);

        // The reconstruction is the PSD projection, not the input.
        let rebuilt = sd.reconstruct();
        assert_relative_eq!(rebuilt[(0, 0)], 1.5, epsilon = 1e-10);
        assert_relative_eq!(rebuilt[(0, 1)], 1.5, epsilon = 1e-10);

        let pcs = sd.principal_components(None).unwrap();
        assert!(pcs.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_truncated_pcs() {
        let sd = SpectralDecomposition::from_kinship(&kinship_3x3());
        let pcs = sd.principal_components(Some(2)).unwrap();
        assert_eq!(pcs.ncols(), 2);
        assert!(sd.principal_components(Some(4)).is_err());
    }

    #[test]
    fn test_rotate_roundtrip() {
        let sd = SpectralDecomposition::from_kinship(&kinship_3x3());
        let v = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let back = sd.unrotate(&sd.rotate(&v).unwrap()).unwrap();
        for i in 0..3 {
            assert_relative_eq!(back[i], v[i], epsilon = 1e-10);
        }
        assert!(sd.rotate(&DVector::zeros(2)).is_err());
    }

    #[test]
    fn test_variance_explained_sums_to_one() {
        let sd = SpectralDecomposition::from_kinship(&kinship_3x3());
        assert_relative_eq!(sd.variance_explained().sum(), 1.0, epsilon = 1e-12);
    }
}
