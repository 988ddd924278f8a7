//! End-to-end simulation: genotypes, standardization, kinship, spectral
//! decomposition and phenotype from one [`SimulationConfig`].

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SimulationConfig;
use crate::error::{LmmError, Result};
use crate::genetics::{
    standardize, AlleleFrequencySummary, GenotypeMatrix, KinshipMatrix, SpectralDecomposition,
    StandardizedMatrix,
};
use crate::lmm::{
    association_scan, AssociationResult, CovarianceInput, FittingStrategy, MixedModelFit,
    ScanOptions,
};
use crate::simulation::{simulate_genotypes, simulate_phenotype, SimulatedPhenotype};

/// Every intermediate of a simulated data set.
///
/// Marker indices of `standardized`, `phenotype` and the fitting methods
/// refer to the kept markers; `kept_markers[j]` maps them back to columns
/// of `genotypes`.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub config: SimulationConfig,
    pub genotypes: GenotypeMatrix,
    /// Frequency each simulated column was drawn with.
    pub true_frequencies: Vec<f64>,
    pub summary: AlleleFrequencySummary,
    pub kept_markers: Vec<usize>,
    pub standardized: StandardizedMatrix,
    pub kinship: KinshipMatrix,
    pub spectral: SpectralDecomposition,
    pub phenotype: SimulatedPhenotype,
}

/// Run the simulation pipeline with a single seeded random source.
pub fn run_simulation(config: &SimulationConfig) -> Result<SimulationRun> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let simulated = simulate_genotypes(
        &mut rng,
        config.n_subjects,
        config.n_markers,
        &config.allele_frequencies,
        config.n_missing(),
    )?;
    let genotypes = simulated.genotypes;
    let full_summary = genotypes.summarize();
    log::info!(
        "Simulated {} subjects x {} markers, {} missing",
        genotypes.n_subjects(),
        genotypes.n_markers(),
        genotypes.n_missing()
    );

    let polymorphic = full_summary.polymorphic_markers();
    let (kept_markers, summary, working) =
        if config.drop_monomorphic && polymorphic.len() < genotypes.n_markers() {
            log::warn!(
                "Dropping {} monomorphic markers",
                genotypes.n_markers() - polymorphic.len()
            );
            let subset = genotypes.select_markers(&polymorphic)?;
            let summary = subset.summarize();
            (polymorphic, summary, Some(subset))
        } else {
            ((0..genotypes.n_markers()).collect(), full_summary, None)
        };

    let standardized = standardize(
        working.as_ref().unwrap_or(&genotypes),
        &summary,
        config.standardization,
    )?;
    let kinship = KinshipMatrix::from_standardized(&standardized)?;
    let spectral = SpectralDecomposition::from_kinship(&kinship);
    log::info!(
        "Kinship: mean diagonal {:.4}, mean off-diagonal {:.4}, {} eigenvalues clamped",
        kinship.mean_diagonal(),
        kinship.mean_off_diagonal(),
        spectral.n_clamped()
    );

    let phenotype = simulate_phenotype(
        &mut rng,
        &standardized,
        config.n_causal,
        config.signal_to_noise,
    )?;

    Ok(SimulationRun {
        config: config.clone(),
        genotypes,
        true_frequencies: simulated.true_frequencies,
        summary,
        kept_markers,
        standardized,
        kinship,
        spectral,
        phenotype,
    })
}

impl SimulationRun {
    pub fn n_markers(&self) -> usize {
        self.standardized.n_markers()
    }

    pub fn causal_markers(&self) -> &[usize] {
        &self.phenotype.effects.causal_markers
    }

    /// Markers with no effect on the phenotype.
    pub fn null_markers(&self) -> Vec<usize> {
        (0..self.n_markers())
            .filter(|&j| !self.phenotype.effects.is_causal(j))
            .collect()
    }

    /// Design `[1, Xs_j]` for testing marker `j`.
    pub fn design_for_marker(&self, marker: usize) -> Result<DMatrix<f64>> {
        if marker >= self.n_markers() {
            return Err(LmmError::InvalidParameter(format!(
                "Marker index {} out of range ({} markers)",
                marker,
                self.n_markers()
            )));
        }
        let mut x = DMatrix::from_element(self.standardized.n_subjects(), 2, 1.0);
        x.set_column(1, &self.standardized.column(marker));
        Ok(x)
    }

    /// Fit `y = b0 + b1 Xs_j + g + e`; coefficient 1 is the marker effect.
    pub fn fit_marker(&self, marker: usize, strategy: &dyn FittingStrategy) -> Result<MixedModelFit> {
        let x = self.design_for_marker(marker)?;
        let covariance = if strategy.uses_decomposition() {
            CovarianceInput::Spectral(&self.spectral)
        } else {
            CovarianceInput::Kinship(&self.kinship)
        };
        strategy.fit(&self.phenotype.y, &x, covariance)
    }

    /// Association scan of the simulated phenotype.
    pub fn scan(&self, markers: &[usize], options: &ScanOptions) -> Result<Vec<AssociationResult>> {
        association_scan(
            &self.phenotype.y,
            &self.standardized,
            &self.spectral,
            markers,
            options,
        )
    }
}
