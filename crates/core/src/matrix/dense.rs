use nalgebra::{Cholesky, DMatrix, Dyn};

/// log|A| from the Cholesky factor of A: 2 * sum(log(diag(L))).
pub fn cholesky_log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Compute the trace of a matrix.
pub fn trace(a: &DMatrix<f64>) -> f64 {
    (0..a.nrows().min(a.ncols())).map(|i| a[(i, i)]).sum()
}

/// Frobenius inner product sum_ij A_ij * B_ij, which equals tr(A B) when
/// either operand is symmetric.
pub fn frobenius_dot(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Largest absolute difference between `A[i,j]` and `A[j,i]`.
pub fn max_asymmetry(a: &DMatrix<f64>) -> f64 {
    let n = a.nrows().min(a.ncols());
    let mut worst = 0.0_f64;
    for j in 0..n {
        for i in (j + 1)..n {
            worst = worst.max((a[(i, j)] - a[(j, i)]).abs());
        }
    }
    worst
}

/// Copy the upper triangle onto the lower triangle so that the result is
/// exactly symmetric.
pub fn mirror_upper(a: &mut DMatrix<f64>) {
    let n = a.nrows().min(a.ncols());
    for j in 0..n {
        for i in (j + 1)..n {
            a[(i, j)] = a[(j, i)];
        }
    }
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance (denominator n - 1); 0 for fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64
}
