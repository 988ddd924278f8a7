use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::RemlOptions;
use crate::diagnostics::wald::wald_test;
use crate::error::{LmmError, Result};
use crate::genetics::{SpectralDecomposition, StandardizedMatrix};

use super::eigen_reml::EigenReml;
use super::strategy::validate_problem;

/// Median of the chi-square distribution with one degree of freedom.
const CHI2_1_MEDIAN: f64 = 0.454_936_423_119_572_8;

/// Options for a marker-by-marker association scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Number of leading principal components added as covariates.
    pub n_pcs: usize,
    pub reml: RemlOptions,
}

/// Test of one marker in an association scan.
#[derive(Debug, Clone, Serialize)]
pub struct AssociationResult {
    pub marker: usize,
    pub beta: f64,
    pub se: f64,
    pub z: f64,
    pub p_value: f64,
    pub tau: f64,
    pub sigma2: f64,
    pub converged: bool,
}

impl AssociationResult {
    fn failed(marker: usize) -> Self {
        Self {
            marker,
            beta: f64::NAN,
            se: f64::NAN,
            z: f64::NAN,
            p_value: f64::NAN,
            tau: f64::NAN,
            sigma2: f64::NAN,
            converged: false,
        }
    }
}

/// Fit `y = [1, PCs, Xs_j] b + g + e` for each marker `j` and test the
/// marker coefficient.
///
/// The phenotype and the shared covariates are rotated once; each marker
/// then costs one O(n^2) rotation plus the eigen-form REML. Markers run in
/// parallel. An empty `markers` slice scans every column. A marker whose
/// fit fails is reported with NaN statistics instead of aborting the scan.
pub fn association_scan(
    y: &DVector<f64>,
    xs: &StandardizedMatrix,
    spectral: &SpectralDecomposition,
    markers: &[usize],
    options: &ScanOptions,
) -> Result<Vec<AssociationResult>> {
    let n = y.len();
    if xs.n_subjects() != n {
        return Err(LmmError::DimensionMismatch {
            expected: n,
            got: xs.n_subjects(),
            context: "standardized genotype rows".into(),
        });
    }

    let all: Vec<usize>;
    let markers = if markers.is_empty() {
        all = (0..xs.n_markers()).collect();
        &all[..]
    } else {
        markers
    };
    if let Some(&bad) = markers.iter().find(|&&j| j >= xs.n_markers()) {
        return Err(LmmError::InvalidParameter(format!(
            "Marker index {} out of range ({} markers)",
            bad,
            xs.n_markers()
        )));
    }

    let mut covariates = DMatrix::from_element(n, 1, 1.0);
    if options.n_pcs > 0 {
        let pcs = spectral.principal_components(Some(options.n_pcs))?;
        covariates = covariates.resize_horizontally(1 + options.n_pcs, 0.0);
        covariates.columns_mut(1, options.n_pcs).copy_from(&pcs);
    }
    validate_problem(y, &covariates, spectral.n_subjects())?;
    if n <= covariates.ncols() + 1 {
        return Err(LmmError::InvalidParameter(format!(
            "Need more observations ({}) than fixed effects ({})",
            n,
            covariates.ncols() + 1
        )));
    }

    let y_rot = spectral.rotate(y)?;
    let c_rot = spectral.rotate_matrix(&covariates)?;
    let lambda = spectral.eigenvalues();
    let u = spectral.eigenvectors();
    let solver = EigenReml::from_options(&options.reml);
    let n_cov = c_rot.ncols();

    log::info!(
        "Scanning {} markers ({} covariates, n = {})",
        markers.len(),
        n_cov,
        n
    );

    let results = markers
        .par_iter()
        .map(|&j| {
            let marker_rot = u.tr_mul(&xs.column(j));
            let mut design = c_rot.clone().resize_horizontally(n_cov + 1, 0.0);
            design.set_column(n_cov, &marker_rot);

            match solver.fit_rotated(lambda, &y_rot, &design) {
                Ok(fit) => {
                    let varbeta = fit.varbeta();
                    let test = wald_test(n_cov, fit.optimum.beta[n_cov], varbeta[(n_cov, n_cov)]);
                    AssociationResult {
                        marker: j,
                        beta: test.estimate,
                        se: test.se,
                        z: test.z,
                        p_value: test.p_value,
                        tau: fit.tau(),
                        sigma2: fit.sigma2(),
                        converged: fit.is_converged(),
                    }
                }
                Err(e) => {
                    log::warn!("Marker {} skipped: {}", j, e);
                    AssociationResult::failed(j)
                }
            }
        })
        .collect();

    Ok(results)
}

/// Genomic control inflation factor: median(z^2) / median(chi2_1).
///
/// Non-finite statistics are ignored; returns NaN when none remain.
pub fn genomic_inflation(results: &[AssociationResult]) -> f64 {
    let mut chi2: Vec<f64> = results
        .iter()
        .filter(|r| r.z.is_finite())
        .map(|r| r.z * r.z)
        .collect();
    if chi2.is_empty() {
        return f64::NAN;
    }
    chi2.sort_by(|a, b| a.total_cmp(b));
    let m = chi2.len();
    let median = if m % 2 == 1 {
        chi2[m / 2]
    } else {
        0.5 * (chi2[m / 2 - 1] + chi2[m / 2])
    };
    median / CHI2_1_MEDIAN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genetics::{standardize, KinshipMatrix, StandardizationMode};
    use crate::simulation::{simulate_genotypes, simulate_phenotype};
    use crate::lmm::{CovarianceInput, FittingStrategy};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(seed: u64) -> (StandardizedMatrix, SpectralDecomposition, DVector<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sim = simulate_genotypes(&mut rng, 60, 150, &[0.2, 0.3, 0.5], 0).unwrap();
        let xs = standardize(&sim.genotypes, &sim.genotypes.summarize(), StandardizationMode::P)
            .unwrap();
        let k = KinshipMatrix::from_standardized(&xs).unwrap();
        let spectral = SpectralDecomposition::from_kinship(&k);
        let pheno = simulate_phenotype(&mut rng, &xs, 10, 2.0).unwrap();
        (xs, spectral, pheno.y)
    }

    #[test]
    fn test_scan_matches_single_fit() {
        let (xs, spectral, y) = setup(21);
        let results =
            association_scan(&y, &xs, &spectral, &[3, 7], &ScanOptions::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].marker, 3);
        assert_eq!(results[1].marker, 7);

        let mut x = DMatrix::from_element(60, 2, 1.0);
        x.set_column(1, &xs.column(7));
        let fit = EigenReml::default()
            .fit(&y, &x, CovarianceInput::Spectral(&spectral))
            .unwrap();
        assert_relative_eq!(results[1].beta, fit.beta[1], epsilon = 1e-6);
        assert_relative_eq!(results[1].z, fit.z_statistic(1).unwrap(), epsilon = 1e-6);
        assert_relative_eq!(results[1].tau, fit.tau, epsilon = 1e-6);
    }

    #[test]
    fn test_scan_all_markers_with_pcs() {
        let (xs, spectral, y) = setup(4);
        let options = ScanOptions {
            n_pcs: 2,
            ..ScanOptions::default()
        };
        let results = association_scan(&y, &xs, &spectral, &[], &options).unwrap();
        assert_eq!(results.len(), 150);
        for (j, r) in results.iter().enumerate() {
            assert_eq!(r.marker, j);
            assert!(r.p_value.is_nan() || (0.0..=1.0).contains(&r.p_value));
        }
    }

    #[test]
    fn test_scan_rejects_bad_marker() {
        let (xs, spectral, y) = setup(1);
        assert!(matches!(
            association_scan(&y, &xs, &spectral, &[150], &ScanOptions::default()),
            Err(LmmError::InvalidParameter(_))
        ));
    }

    fn result_with_z(z: f64) -> AssociationResult {
        AssociationResult {
            z,
            ..AssociationResult::failed(0)
        }
    }

    #[test]
    fn test_genomic_inflation() {
        let results: Vec<_> = [1.0, -2.0, 3.0, f64::NAN].iter().map(|&z| result_with_z(z)).collect();
        assert_relative_eq!(genomic_inflation(&results), 4.0 / CHI2_1_MEDIAN, epsilon = 1e-12);

        let even: Vec<_> = [1.0, 2.0].iter().map(|&z| result_with_z(z)).collect();
        assert_relative_eq!(genomic_inflation(&even), 2.5 / CHI2_1_MEDIAN, epsilon = 1e-12);

        assert!(genomic_inflation(&[]).is_nan());
    }

    #[test]
    fn test_result_serializes_failed_marker_as_null() {
        let value = serde_json::to_value(AssociationResult::failed(4)).unwrap();
        assert_eq!(value["marker"], 4);
        assert_eq!(value["converged"], false);
        assert!(value["beta"].is_null());
        assert!(value["p_value"].is_null());

        let ok = AssociationResult {
            beta: 0.5,
            p_value: 0.01,
            converged: true,
            ..AssociationResult::failed(1)
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["beta"], 0.5);
        assert_eq!(value["p_value"], 0.01);
        assert_eq!(value["converged"], true);
    }
}
