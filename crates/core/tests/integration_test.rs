//! Integration test: simulate data from the kinship model and check that
//! both REML strategies recover it.
//!
//! Model: y = mu + g + e, g ~ N(0, tau K), e ~ N(0, sigma2 I)
//!
//! K is a block matrix of families with relatedness 0.5, so data can be
//! drawn from the model exactly through the Cholesky factor of K.

use approx::assert_relative_eq;
use kinlmm_core::genetics::{
    standardize, GenotypeMatrix, KinshipMatrix, SpectralDecomposition, StandardizationMode,
};
use kinlmm_core::lmm::{
    fit_mixed_model, AiReml, CovarianceInput, EigenReml, FitStatus, FittingStrategy,
};
use kinlmm_core::{LmmError, RemlOptions};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

fn family_kinship(n_families: usize, size: usize, r: f64) -> KinshipMatrix {
    let n = n_families * size;
    let k = DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            1.0
        } else if i / size == j / size {
            r
        } else {
            0.0
        }
    });
    KinshipMatrix::from_matrix(k).unwrap()
}

fn simulate_from_model(k: &KinshipMatrix, tau: f64, sigma2: f64, mu: f64, seed: u64) -> DVector<f64> {
    let n = k.n_subjects();
    let mut rng = StdRng::seed_from_u64(seed);
    let l = k.as_matrix().clone().cholesky().unwrap().l();
    let z = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
    let e = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
    (l * z) * tau.sqrt() + e * sigma2.sqrt() + DVector::from_element(n, mu)
}

#[test]
fn test_eigen_reml_recovers_variance_components() {
    let k = family_kinship(100, 5, 0.5);
    let spectral = SpectralDecomposition::from_kinship(&k);
    let x = DMatrix::from_element(k.n_subjects(), 1, 1.0);
    let solver = EigenReml::default();

    let seeds = 0..8u64;
    let mut tau_sum = 0.0;
    let mut sigma2_sum = 0.0;
    for seed in seeds.clone() {
        let y = simulate_from_model(&k, 1.0, 1.0, 5.0, seed);
        let fit = solver
            .fit(&y, &x, CovarianceInput::Spectral(&spectral))
            .unwrap()
            .require_converged()
            .unwrap();
        assert!(fit.tau >= 0.0 && fit.sigma2 >= 0.0);
        tau_sum += fit.tau;
        sigma2_sum += fit.sigma2;
    }
    let n_seeds = seeds.count() as f64;
    assert_relative_eq!(tau_sum / n_seeds, 1.0, epsilon = 0.35);
    assert_relative_eq!(sigma2_sum / n_seeds, 1.0, epsilon = 0.35);
}

#[test]
fn test_eigen_and_ai_reml_agree() {
    let k = family_kinship(30, 5, 0.5);
    let spectral = SpectralDecomposition::from_kinship(&k);
    let y = simulate_from_model(&k, 2.0, 1.0, 1.0, 99);

    let mut rng = StdRng::seed_from_u64(5);
    let mut x = DMatrix::from_element(150, 2, 1.0);
    for i in 0..150 {
        x[(i, 1)] = rng.sample::<f64, _>(StandardNormal);
    }

    let eigen = EigenReml::new(200, 1e-10)
        .fit(&y, &x, CovarianceInput::Spectral(&spectral))
        .unwrap();
    let ai = AiReml::new(200, 1e-10)
        .fit(&y, &x, CovarianceInput::Kinship(&k))
        .unwrap();
    assert!(eigen.is_converged() && ai.is_converged());
    assert!(eigen.warnings.is_empty() && ai.warnings.is_empty());

    assert_relative_eq!(eigen.tau, ai.tau, max_relative = 1e-3);
    assert_relative_eq!(eigen.sigma2, ai.sigma2, max_relative = 1e-3);
    assert_relative_eq!(eigen.log_likelihood, ai.log_likelihood, epsilon = 1e-5);
    for j in 0..2 {
        assert_relative_eq!(eigen.beta[j], ai.beta[j], epsilon = 1e-4);
        assert_relative_eq!(
            eigen.z_statistic(j).unwrap(),
            ai.z_statistic(j).unwrap(),
            epsilon = 1e-3
        );
    }
    for i in 0..150 {
        assert_relative_eq!(eigen.blup_omega[i], ai.blup_omega[i], epsilon = 1e-3);
    }
}

#[test]
fn test_fit_mixed_model_dispatch_and_zero_iterations() {
    let k = family_kinship(10, 4, 0.5);
    let spectral = SpectralDecomposition::from_kinship(&k);
    let y = simulate_from_model(&k, 1.0, 1.0, 0.0, 1);
    let x = DMatrix::from_element(40, 1, 1.0);

    let options = RemlOptions::new(0, 1e-8);
    let eigen = fit_mixed_model(&y, &x, CovarianceInput::Spectral(&spectral), &options).unwrap();
    let ai = fit_mixed_model(&y, &x, CovarianceInput::Kinship(&k), &options).unwrap();
    assert_eq!(eigen.strategy, "eigen-reml");
    assert_eq!(ai.strategy, "ai-reml");
    for fit in [eigen, ai] {
        assert!(matches!(fit.status, FitStatus::NotConverged { iterations: 0, .. }));
        assert!(matches!(
            fit.require_converged(),
            Err(LmmError::NotConverged { iterations: 0, .. })
        ));
    }
}

#[test]
fn test_dimension_mismatch_is_reported() {
    let k = family_kinship(10, 4, 0.5);
    let y = DVector::from_element(39, 1.0);
    let x = DMatrix::from_element(39, 1, 1.0);
    let result = EigenReml::default().fit(&y, &x, CovarianceInput::Kinship(&k));
    assert!(matches!(result, Err(LmmError::DimensionMismatch { .. })));
    let result = AiReml::default().fit(&y, &x, CovarianceInput::Kinship(&k));
    assert!(matches!(result, Err(LmmError::DimensionMismatch { .. })));
}

#[test]
fn test_zero_frequency_column_is_degenerate() {
    // Marker 1 is never observed with the alternate allele.
    let g = GenotypeMatrix::from_row_slice(4, 3, &[0, 0, 1, 1, 0, 2, 2, 0, 1, 1, -1, 0]).unwrap();
    let summary = g.summarize();
    assert_eq!(summary.freq[1], 0.0);

    let result = standardize(&g, &summary, StandardizationMode::P);
    match result {
        Err(LmmError::DegenerateColumn { marker, freq }) => {
            assert_eq!(marker, 1);
            assert_eq!(freq, 0.0);
        }
        other => panic!("expected DegenerateColumn, got {:?}", other.map(|_| ())),
    }
}
