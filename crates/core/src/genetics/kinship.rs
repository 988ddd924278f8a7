use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{LmmError, Result};
use crate::matrix::dense::max_asymmetry;

use super::standardize::StandardizedMatrix;

/// Threshold (number of subjects) above which the row products are
/// computed in parallel.
const PARALLEL_THRESHOLD: usize = 50;

/// Largest tolerated `|K[i,j] - K[j,i]|` for a user-supplied matrix.
const SYMMETRY_TOL: f64 = 1e-8;

/// Genetic relationship matrix between subjects. Always exactly symmetric.
#[derive(Debug, Clone)]
pub struct KinshipMatrix {
    values: DMatrix<f64>,
}

impl KinshipMatrix {
    /// Compute the GRM from standardized genotypes:
    ///
    /// ```text
    /// K = Xs Xs' / (p - 1)
    /// ```
    ///
    /// # Errors
    ///
    /// * `LmmError::InvalidParameter` if there are no subjects or fewer than
    ///   two markers.
    pub fn from_standardized(xs: &StandardizedMatrix) -> Result<Self> {
        let n = xs.n_subjects();
        let p = xs.n_markers();

        if n == 0 {
            return Err(LmmError::InvalidParameter(
                "Kinship requires at least one subject".into(),
            ));
        }
        if p < 2 {
            return Err(LmmError::InvalidParameter(format!(
                "Kinship requires at least two markers, got {}",
                p
            )));
        }

        let scale = (p - 1) as f64;
        let values = if n >= PARALLEL_THRESHOLD {
            compute_xxt_parallel(xs.as_matrix(), scale)
        } else {
            let mut k = (xs.as_matrix() * xs.as_matrix().transpose()) / scale;
            crate::matrix::dense::mirror_upper(&mut k);
            k
        };

        log::debug!("Computed {}x{} kinship from {} markers", n, n, p);
        Ok(Self { values })
    }

    /// Wrap an externally computed relationship matrix.
    ///
    /// # Errors
    ///
    /// * `LmmError::DimensionMismatch` if the matrix is not square.
    /// * `LmmError::InvalidParameter` if it is not symmetric within 1e-8.
    pub fn from_matrix(mut values: DMatrix<f64>) -> Result<Self> {
        if values.nrows() != values.ncols() {
            return Err(LmmError::DimensionMismatch {
                expected: values.nrows(),
                got: values.ncols(),
                context: "kinship matrix must be square".into(),
            });
        }
        let asym = max_asymmetry(&values);
        if asym > SYMMETRY_TOL {
            return Err(LmmError::InvalidParameter(format!(
                "Kinship matrix is not symmetric (max |K_ij - K_ji| = {:.3e})",
                asym
            )));
        }
        crate::matrix::dense::mirror_upper(&mut values);
        Ok(Self { values })
    }

    pub fn n_subjects(&self) -> usize {
        self.values.nrows()
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Mean self-relatedness; close to 1 for unrelated, non-inbred subjects.
    pub fn mean_diagonal(&self) -> f64 {
        self.values.diagonal().mean()
    }

    /// Mean relatedness over distinct pairs.
    pub fn mean_off_diagonal(&self) -> f64 {
        let n = self.n_subjects();
        if n < 2 {
            return 0.0;
        }
        let total: f64 = self.values.sum() - self.values.trace();
        total / (n * (n - 1)) as f64
    }
}

/// Compute XX'/scale using rayon parallelism over rows. Only the upper
/// triangle is computed; the lower triangle is its mirror image.
fn compute_xxt_parallel(x: &DMatrix<f64>, scale: f64) -> DMatrix<f64> {
    let n = x.nrows();

    // Row-major copy so each dot product walks contiguous memory.
    let rows: Vec<Vec<f64>> = (0..n)
        .map(|i| x.row(i).iter().copied().collect())
        .collect();

    let upper: Vec<(usize, Vec<f64>)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let row_i = &rows[i];
            let dots = (i..n)
                .map(|j| {
                    row_i
                        .iter()
                        .zip(rows[j].iter())
                        .map(|(a, b)| a * b)
                        .sum::<f64>()
                        / scale
                })
                .collect();
            (i, dots)
        })
        .collect();

    let mut k = DMatrix::zeros(n, n);
    for (i, dots) in upper {
        for (offset, val) in dots.into_iter().enumerate() {
            let j = i + offset;
            k[(i, j)] = val;
            k[(j, i)] = val;
        }
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genetics::standardize::{standardize, StandardizationMode};
    use crate::genetics::GenotypeMatrix;
    use approx::assert_relative_eq;

    fn assert_approx(actual: f64, expected: f64, tol: f64, msg: &str) {
        assert!(
            (actual - expected).abs() < tol,
            "{}: expected {}, got {} (diff = {})",
            msg,
            expected,
            actual,
            (actual - expected).abs()
        );
    }

    /// 3 subjects x 4 markers, already standardized.
    fn simple_standardized() -> StandardizedMatrix {
        StandardizedMatrix::from_matrix(
            DMatrix::from_row_slice(3, 4, &[
                1.0, -1.0, 0.5, -1.0,
                0.0, 0.0, -1.0, 1.0,
                -1.0, 1.0, 0.5, 0.0,
            ]),
            StandardizationMode::P,
        )
    }

    #[test]
    fn test_kinship_known_values() {
        // K = XX' / 3
        //   Row 0 . Row 0 = 1 + 1 + 0.25 + 1 = 3.25
        //   Row 0 . Row 1 = 0 + 0 - 0.5 - 1 = -1.5
        //   Row 1 . Row 2 = 0 + 0 - 0.5 + 0 = -0.5
        let k = KinshipMatrix::from_standardized(&simple_standardized()).unwrap();
        assert_approx(k.as_matrix()[(0, 0)], 3.25 / 3.0, 1e-12, "K[0,0]");
        assert_approx(k.as_matrix()[(0, 1)], -1.5 / 3.0, 1e-12, "K[0,1]");
        assert_approx(k.as_matrix()[(1, 2)], -0.5 / 3.0, 1e-12, "K[1,2]");
    }

    #[test]
    fn test_kinship_is_exactly_symmetric() {
        let k = KinshipMatrix::from_standardized(&simple_standardized()).unwrap();
        let m = k.as_matrix();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(m[(i, j)], m[(j, i)]);
            }
        }
    }

    #[test]
    fn test_parallel_matches_direct_product() {
        // 60 subjects crosses the parallel threshold.
        let n = 60;
        let p = 7;
        let x = DMatrix::from_fn(n, p, |i, j| ((i * 7 + j * 13) % 5) as f64 - 2.0);
        let xs = StandardizedMatrix::from_matrix(x.clone(), StandardizationMode::P);
        let k = KinshipMatrix::from_standardized(&xs).unwrap();
        let direct = (&x * x.transpose()) / (p - 1) as f64;
        for i in 0..n {
            for j in 0..n {
                assert_relative_eq!(k.as_matrix()[(i, j)], direct[(i, j)], epsilon = 1e-10);
                assert_eq!(k.as_matrix()[(i, j)], k.as_matrix()[(j, i)]);
            }
        }
    }

    #[test]
    fn test_diagonal_near_one_from_genotypes() {
        // Four subjects, eight markers at 50% frequency in HWE proportions.
        let g = GenotypeMatrix::from_row_slice(4, 8, &[
            2, 0, 1, 1, 0, 2, 1, 1,
            0, 2, 1, 1, 2, 0, 1, 1,
            1, 1, 2, 0, 1, 1, 0, 2,
            1, 1, 0, 2, 1, 1, 2, 0,
        ])
        .unwrap();
        let xs = standardize(&g, &g.summarize(), StandardizationMode::P).unwrap();
        let k = KinshipMatrix::from_standardized(&xs).unwrap();
        // Diagonal is sum of squares / (p - 1): each row has four 2/0 entries
        // contributing 2 each, four hets contributing 0 -> 8 / 7.
        assert_relative_eq!(k.mean_diagonal(), 8.0 / 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_single_marker_rejected() {
        let xs = StandardizedMatrix::from_matrix(DMatrix::zeros(3, 1), StandardizationMode::P);
        assert!(matches!(
            KinshipMatrix::from_standardized(&xs),
            Err(LmmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_from_matrix_validation() {
        let ok = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 1.0]);
        assert!(KinshipMatrix::from_matrix(ok).is_ok());

        let asym = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.3, 1.0]);
        assert!(matches!(
            KinshipMatrix::from_matrix(asym),
            Err(LmmError::InvalidParameter(_))
        ));

        let rect = DMatrix::zeros(2, 3);
        assert!(matches!(
            KinshipMatrix::from_matrix(rect),
            Err(LmmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_off_diagonal_mean() {
        let k = KinshipMatrix::from_matrix(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]))
            .unwrap();
        assert_relative_eq!(k.mean_off_diagonal(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(k.mean_diagonal(), 1.0, epsilon = 1e-12);
    }
}
