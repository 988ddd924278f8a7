use nalgebra::DMatrix;
use rand::seq::index;
use rand::Rng;
use rand_distr::{Binomial, Distribution};

use crate::error::{LmmError, Result};
use crate::genetics::GenotypeMatrix;
use crate::types::{Dosage, MISSING};

/// Simulated genotypes together with the frequency each column was drawn at.
#[derive(Debug, Clone)]
pub struct SimulatedGenotypes {
    pub genotypes: GenotypeMatrix,
    /// Population allele frequency used for each marker.
    pub true_frequencies: Vec<f64>,
}

/// Simulate an `n_subjects x n_markers` dosage matrix.
///
/// Each marker picks a frequency `f` uniformly (with replacement) from
/// `candidate_freqs`, then every subject's dosage is drawn from
/// Binomial(2, f). Finally `n_missing` distinct cells, chosen uniformly over
/// the whole grid, are set to missing.
///
/// # Errors
///
/// `LmmError::InvalidParameter` if a dimension is zero, the candidate list is
/// empty or holds a value outside [0, 1], or `n_missing` exceeds the number
/// of cells.
pub fn simulate_genotypes<R: Rng + ?Sized>(
    rng: &mut R,
    n_subjects: usize,
    n_markers: usize,
    candidate_freqs: &[f64],
    n_missing: usize,
) -> Result<SimulatedGenotypes> {
    if n_subjects == 0 || n_markers == 0 {
        return Err(LmmError::InvalidParameter(format!(
            "Genotype dimensions must be positive, got {} x {}",
            n_subjects, n_markers
        )));
    }
    if candidate_freqs.is_empty() {
        return Err(LmmError::InvalidParameter(
            "At least one candidate allele frequency is required".into(),
        ));
    }
    if let Some(&bad) = candidate_freqs.iter().find(|f| !(0.0..=1.0).contains(*f)) {
        return Err(LmmError::InvalidParameter(format!(
            "Allele frequency {} is outside [0, 1]",
            bad
        )));
    }
    let n_cells = n_subjects * n_markers;
    if n_missing > n_cells {
        return Err(LmmError::InvalidParameter(format!(
            "Cannot mark {} of {} cells as missing",
            n_missing, n_cells
        )));
    }

    let mut dosages: DMatrix<Dosage> = DMatrix::zeros(n_subjects, n_markers);
    let mut true_frequencies = Vec::with_capacity(n_markers);

    for j in 0..n_markers {
        let f = candidate_freqs[rng.gen_range(0..candidate_freqs.len())];
        let binom = Binomial::new(2, f)
            .map_err(|e| LmmError::InvalidParameter(format!("Binomial(2, {}): {}", f, e)))?;
        for i in 0..n_subjects {
            dosages[(i, j)] = binom.sample(rng) as Dosage;
        }
        true_frequencies.push(f);
    }

    // Column-major cell index: cell = j * n + i.
    for cell in index::sample(rng, n_cells, n_missing).into_iter() {
        dosages[(cell % n_subjects, cell / n_subjects)] = MISSING;
    }

    log::debug!(
        "Simulated {} subjects x {} markers with {} missing cells",
        n_subjects,
        n_markers,
        n_missing
    );

    Ok(SimulatedGenotypes {
        genotypes: GenotypeMatrix::new(dosages)?,
        true_frequencies,
    })
}
