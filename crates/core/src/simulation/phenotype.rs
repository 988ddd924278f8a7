use nalgebra::DVector;
use rand::seq::index;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

use crate::error::{LmmError, Result};
use crate::genetics::StandardizedMatrix;
use crate::matrix::dense::sample_variance;

/// Bounds of the uniform distribution causal effect sizes are drawn from.
const EFFECT_LOW: f64 = 0.9;
const EFFECT_HIGH: f64 = 1.1;

/// Sparse vector of causal marker effects.
#[derive(Debug, Clone)]
pub struct CausalEffects {
    /// Dense effect vector of length `n_markers`; zero off the causal set.
    pub beta: DVector<f64>,
    /// Causal marker indices, ascending.
    pub causal_markers: Vec<usize>,
}

impl CausalEffects {
    pub fn is_causal(&self, marker: usize) -> bool {
        self.causal_markers.binary_search(&marker).is_ok()
    }
}

/// A simulated trait `y = Xs beta + k e`.
#[derive(Debug, Clone)]
pub struct SimulatedPhenotype {
    pub effects: CausalEffects,
    pub y: DVector<f64>,
    /// The noise-free signal `Xs beta`.
    pub signal: DVector<f64>,
    /// Scale applied to the standard-normal noise.
    pub noise_scale: f64,
    /// Sample variance of `Xs beta`.
    pub signal_variance: f64,
    /// Sample variance of `k e`.
    pub noise_variance: f64,
}

impl SimulatedPhenotype {
    /// Realised signal-to-noise ratio; equals the requested ratio by
    /// construction of `noise_scale`.
    pub fn realised_snr(&self) -> f64 {
        self.signal_variance / self.noise_variance
    }
}

/// Simulate a continuous phenotype from `n_causal` randomly chosen markers.
///
/// Causal markers are drawn without replacement and their effects from
/// Uniform(0.9, 1.1). The noise scale `k` is chosen so that
/// `Var(Xs beta) / Var(k e) = snr` exactly in the sample.
///
/// # Errors
///
/// * `LmmError::InvalidParameter` if `n_causal > n_markers`, `snr` is not a
///   positive finite number, or there are fewer than two subjects.
/// * `LmmError::UndefinedScale` if the signal (or the drawn noise) has zero
///   variance, e.g. when `n_causal == 0`.
pub fn simulate_phenotype<R: Rng + ?Sized>(
    rng: &mut R,
    xs: &StandardizedMatrix,
    n_causal: usize,
    snr: f64,
) -> Result<SimulatedPhenotype> {
    let n = xs.n_subjects();
    let p = xs.n_markers();

    if n_causal > p {
        return Err(LmmError::InvalidParameter(format!(
            "n_causal ({}) exceeds the number of markers ({})",
            n_causal, p
        )));
    }
    if !(snr.is_finite() && snr > 0.0) {
        return Err(LmmError::InvalidParameter(format!(
            "Signal-to-noise ratio must be positive, got {}",
            snr
        )));
    }
    if n < 2 {
        return Err(LmmError::InvalidParameter(format!(
            "At least two subjects are needed to simulate a phenotype, got {}",
            n
        )));
    }

    let mut causal_markers = index::sample(rng, p, n_causal).into_vec();
    causal_markers.sort_unstable();

    let effect_dist = Uniform::new(EFFECT_LOW, EFFECT_HIGH);
    let mut beta: DVector<f64> = DVector::zeros(p);
    for &j in &causal_markers {
        beta[j] = effect_dist.sample(rng);
    }

    // Only causal columns contribute to Xs beta.
    let mut signal: DVector<f64> = DVector::zeros(n);
    for &j in &causal_markers {
        signal.axpy(beta[j], &xs.column(j), 1.0);
    }

    let noise: Vec<f64> = (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();

    let signal_variance = sample_variance(signal.as_slice());
    let raw_noise_variance = sample_variance(&noise);
    if signal_variance <= 0.0 {
        return Err(LmmError::UndefinedScale(format!(
            "simulated signal has zero variance ({} causal markers)",
            n_causal
        )));
    }
    if raw_noise_variance <= 0.0 {
        return Err(LmmError::UndefinedScale("simulated noise has zero variance".into()));
    }

    let noise_scale = (signal_variance / (snr * raw_noise_variance)).sqrt();
    let y = DVector::from_iterator(
        n,
        signal.iter().zip(noise.iter()).map(|(s, e)| s + noise_scale * e),
    );

    Ok(SimulatedPhenotype {
        effects: CausalEffects {
            beta,
            causal_markers,
        },
        y,
        signal,
        noise_scale,
        signal_variance,
        noise_variance: noise_scale * noise_scale * raw_noise_variance,
    })
}
