//! End-to-end checks of the simulation pipeline: kinship self-relatedness
//! and the null distribution of marker z statistics.

use kinlmm_core::lmm::{genomic_inflation, EigenReml, ScanOptions};
use kinlmm_core::pipeline::run_simulation;
use kinlmm_core::SimulationConfig;

fn mean_square(values: &[f64]) -> f64 {
    values.iter().map(|z| z * z).sum::<f64>() / values.len() as f64
}

#[test]
fn test_null_markers_are_roughly_standard_normal() {
    let config = SimulationConfig {
        n_subjects: 200,
        n_markers: 1000,
        n_causal: 10,
        seed: 2024,
        ..SimulationConfig::default()
    };
    let run = run_simulation(&config).unwrap();

    let diag = run.kinship.as_matrix().diagonal();
    assert!(diag.iter().all(|&d| d > 0.7 && d < 1.3));

    let nulls: Vec<usize> = run.null_markers().into_iter().take(100).collect();
    let results = run.scan(&nulls, &ScanOptions::default()).unwrap();
    let z: Vec<f64> = results.iter().map(|r| r.z).filter(|z| z.is_finite()).collect();
    assert!(z.len() >= 95);

    let ms = mean_square(&z);
    assert!(ms > 0.4 && ms < 2.0, "mean z^2 of null markers = {}", ms);
    let lambda = genomic_inflation(&results);
    assert!(lambda > 0.4 && lambda < 2.5, "lambda_GC = {}", lambda);
}

#[test]
fn test_causal_marker_fit_is_informative() {
    let config = SimulationConfig {
        n_subjects: 150,
        n_markers: 300,
        n_causal: 3,
        signal_to_noise: 4.0,
        seed: 7,
        ..SimulationConfig::default()
    };
    let run = run_simulation(&config).unwrap();
    let solver = EigenReml::default();

    let causal_z: Vec<f64> = run
        .causal_markers()
        .iter()
        .map(|&j| run.fit_marker(j, &solver).unwrap().z_statistic(1).unwrap())
        .collect();
    // With three causal markers of effect ~1 and SNR 4 each explains a
    // large share of the variance.
    assert!(causal_z.iter().all(|z| z.abs() > 3.0), "causal z = {:?}", causal_z);
}

/// The reference scenario: n = 1000, p = 10000, 50 causal markers, SNR 2,
/// seed 345321.
#[test]
#[ignore = "builds a 1000 x 10000 standardized matrix and scans 200 markers"]
fn test_reference_scenario() {
    let config = SimulationConfig::default();
    let run = run_simulation(&config).unwrap();

    let diag = run.kinship.as_matrix().diagonal();
    assert!(diag.iter().all(|&d| (d - 1.0).abs() < 0.15));
    assert!((run.kinship.mean_diagonal() - 1.0).abs() < 0.03);
    assert!(run.spectral.eigenvalues().iter().all(|&l| l >= 0.0));

    let nulls: Vec<usize> = run.null_markers().into_iter().take(200).collect();
    let results = run.scan(&nulls, &ScanOptions::default()).unwrap();
    assert!(results.iter().all(|r| r.converged));
    let z: Vec<f64> = results.iter().map(|r| r.z).collect();
    let ms = mean_square(&z);
    assert!(ms > 0.6 && ms < 1.6, "mean z^2 of null markers = {}", ms);
}
