use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

use crate::config::RemlOptions;
use crate::diagnostics::ConvergenceMonitor;
use crate::error::{LmmError, Result};
use crate::matrix::cholesky_log_det;
use crate::matrix::dense::{frobenius_dot, sample_variance, trace};

use super::result::{FitStatus, FitWarning, MixedModelFit, RemlIteration, VarianceComponent};
use super::strategy::{validate_problem, CovarianceInput, FittingStrategy};

/// Step-halvings tried before a negative component is clamped.
const MAX_HALVINGS: usize = 10;

/// Smallest residual variance used to build V, relative to Var(y). Keeps V
/// positive definite when sigma^2 sits on its boundary and K is singular.
const RESIDUAL_FLOOR: f64 = 1e-6;

/// REML engine using the Average Information algorithm (Gilmour, Thompson &
/// Cullis 1995) on the kinship matrix directly.
///
/// Each iteration factors `V = tau K + sigma^2 I` and forms the projection
/// `P = V^{-1} - V^{-1} X (X'V^{-1}X)^{-1} X'V^{-1}`, so the cost is O(n^3)
/// per iteration, but no eigendecomposition of K is needed.
///
/// The solver starts with a configurable number of EM-REML steps, then
/// switches to Newton updates with the Average Information matrix. If an
/// update drives a component negative the step is halved; if that does not
/// help, the component is fixed at zero and only the other one is updated.
/// A residual variance below `1e-6 * Var(y)` is evaluated at that floor.
#[derive(Debug, Clone)]
pub struct AiReml {
    max_iter: usize,
    tol: f64,
    em_initial_steps: usize,
    initial_values: Option<(f64, f64)>,
}

/// Quantities of the REML problem at fixed (tau, sigma^2).
struct RemlState {
    log_likelihood: f64,
    beta: DVector<f64>,
    /// (X' V^{-1} X)^{-1}
    xtvx_inv: DMatrix<f64>,
    p: DMatrix<f64>,
    py: DVector<f64>,
}

impl Default for AiReml {
    fn default() -> Self {
        Self::new(50, 1e-6)
    }
}

impl AiReml {
    /// Create a new AI-REML solver.
    ///
    /// * `max_iter` - Maximum total iterations (EM + AI combined).
    /// * `tol`      - Relative convergence tolerance on variance parameters.
    pub fn new(max_iter: usize, tol: f64) -> Self {
        Self {
            max_iter,
            tol,
            em_initial_steps: 1,
            initial_values: None,
        }
    }

    pub fn from_options(options: &RemlOptions) -> Self {
        Self::new(options.max_iter, options.tol)
    }

    /// Set the number of EM burn-in iterations (default 1).
    pub fn em_initial_steps(mut self, n: usize) -> Self {
        self.em_initial_steps = n;
        self
    }

    /// Start from the given (tau, sigma^2) instead of Var(y) / 2 each.
    pub fn initial_values(mut self, tau: f64, sigma2: f64) -> Self {
        self.initial_values = Some((tau, sigma2));
        self
    }

    /// Fit the model given K.
    pub fn fit_kinship(
        &self,
        y: &DVector<f64>,
        x: &DMatrix<f64>,
        k: &DMatrix<f64>,
    ) -> Result<MixedModelFit> {
        validate_problem(y, x, k.nrows())?;
        if k.ncols() != k.nrows() {
            return Err(LmmError::DimensionMismatch {
                expected: k.nrows(),
                got: k.ncols(),
                context: "kinship columns".into(),
            });
        }
        let n = y.len();
        let y_var = sample_variance(y.as_slice());
        let sigma2_floor = (RESIDUAL_FLOOR * y_var).max(f64::MIN_POSITIVE);

        // ---- initialise variance parameters ----
        let mut theta = match self.initial_values {
            Some((tau, sigma2)) => {
                if !(tau >= 0.0 && sigma2 > 0.0) {
                    return Err(LmmError::InvalidParameter(format!(
                        "Initial values must satisfy tau >= 0 and sigma2 > 0, got ({}, {})",
                        tau, sigma2
                    )));
                }
                Vector2::new(tau, sigma2)
            }
            None => {
                if !(y_var > 0.0) {
                    return Err(LmmError::InvalidParameter(
                        "Phenotype has zero variance".into(),
                    ));
                }
                Vector2::new(y_var / 2.0, y_var / 2.0)
            }
        };

        let mut pinned = [false, false];
        let mut warnings = Vec::new();
        let mut monitor = ConvergenceMonitor::new(self.tol, self.max_iter);
        let mut converged = false;

        for iter in 0..self.max_iter {
            let state = reml_state(y, x, k, theta[0], theta[1].max(sigma2_floor))?;

            // ---- score and average information ----
            let k_py = k * &state.py;
            let p_k_py = &state.p * &k_py;
            let p_py = &state.p * &state.py;

            let score = Vector2::new(
                0.5 * (state.py.dot(&k_py) - frobenius_dot(&state.p, k)),
                0.5 * (state.py.dot(&state.py) - trace(&state.p)),
            );
            let ai = Matrix2::new(
                0.5 * k_py.dot(&p_k_py),
                0.5 * k_py.dot(&p_py),
                0.5 * state.py.dot(&p_k_py),
                0.5 * state.py.dot(&p_py),
            );

            let delta = if iter < self.em_initial_steps {
                em_step(&theta, &score, n)
            } else {
                match ai_step(&ai, &score, &pinned) {
                    Some(d) => d,
                    None => {
                        log::debug!("AI matrix singular at iteration {}, using EM step", iter);
                        em_step(&theta, &score, n)
                    }
                }
            };
            let delta = Vector2::new(
                if pinned[0] { 0.0 } else { delta[0] },
                if pinned[1] { 0.0 } else { delta[1] },
            );

            let theta_new = self.constrain(&theta, &delta, &mut pinned, &mut warnings);

            let change = (theta_new - theta).norm() / theta.norm().max(f64::MIN_POSITIVE);
            theta = theta_new;

            monitor.record(RemlIteration {
                iteration: iter,
                log_likelihood: state.log_likelihood,
                tau: theta[0],
                sigma2: theta[1],
                change,
            });

            if iter > 0 && monitor.is_converged() {
                converged = true;
                break;
            }
        }

        let state = reml_state(y, x, k, theta[0], theta[1].max(sigma2_floor))?;
        let blup_omega = (k * &state.py) * theta[0];

        let status = if converged {
            FitStatus::Converged {
                iterations: monitor.n_iterations(),
            }
        } else {
            log::warn!(
                "ai-reml did not converge in {} iterations (last change = {:.3e})",
                self.max_iter,
                monitor.last_change()
            );
            FitStatus::NotConverged {
                iterations: monitor.n_iterations(),
                change: monitor.last_change(),
            }
        };

        let fit = MixedModelFit {
            strategy: self.name(),
            beta: state.beta,
            varbeta: state.xtvx_inv,
            tau: theta[0],
            sigma2: theta[1],
            log_likelihood: state.log_likelihood,
            blup_omega,
            status,
            warnings,
            history: monitor.into_history(),
            n_obs: n,
        };
        log::info!(
            "ai-reml: tau = {:.6}, sigma2 = {:.6}, h2 = {:.4}, logL = {:.4}, {} iterations",
            fit.tau,
            fit.sigma2,
            fit.heritability(),
            fit.log_likelihood,
            fit.n_iterations()
        );
        Ok(fit)
    }

    /// Apply `delta`, keeping both components non-negative.
    ///
    /// The step is halved while any component would go negative. A component
    /// still negative after that is clamped to zero and pinned.
    fn constrain(
        &self,
        theta: &Vector2<f64>,
        delta: &Vector2<f64>,
        pinned: &mut [bool; 2],
        warnings: &mut Vec<FitWarning>,
    ) -> Vector2<f64> {
        let mut step = *delta;
        let mut candidate = theta + step;
        for _ in 0..MAX_HALVINGS {
            if candidate.iter().all(|v| *v >= 0.0) {
                break;
            }
            step *= 0.5;
            candidate = theta + step;
        }

        for (c, component) in [VarianceComponent::Genetic, VarianceComponent::Residual]
            .into_iter()
            .enumerate()
        {
            if candidate[c] < 0.0 {
                candidate[c] = 0.0;
                if !pinned[c] {
                    pinned[c] = true;
                    let warning = FitWarning::BoundarySolution { component };
                    log::warn!("ai-reml: {}", warning);
                    warnings.push(warning);
                }
            }
        }
        candidate
    }
}

/// EM-REML update: theta_k += theta_k^2 * 2 s_k / n.
fn em_step(theta: &Vector2<f64>, score: &Vector2<f64>, n: usize) -> Vector2<f64> {
    Vector2::new(
        theta[0] * theta[0] * 2.0 * score[0] / n as f64,
        theta[1] * theta[1] * 2.0 * score[1] / n as f64,
    )
}

/// Newton update `AI^{-1} s` over the free components. `None` when the
/// free block of AI is singular.
fn ai_step(ai: &Matrix2<f64>, score: &Vector2<f64>, pinned: &[bool; 2]) -> Option<Vector2<f64>> {
    match pinned {
        [false, false] => ai.try_inverse().map(|inv| inv * score),
        [true, false] => (ai[(1, 1)] > 0.0).then(|| Vector2::new(0.0, score[1] / ai[(1, 1)])),
        [false, true] => (ai[(0, 0)] > 0.0).then(|| Vector2::new(score[0] / ai[(0, 0)], 0.0)),
        [true, true] => Some(Vector2::zeros()),
    }
}

fn reml_state(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    k: &DMatrix<f64>,
    tau: f64,
    sigma2: f64,
) -> Result<RemlState> {
    let n = y.len();
    let n_fixed = x.ncols();

    let mut v = k * tau;
    for i in 0..n {
        v[(i, i)] += sigma2;
    }
    let chol_v = v.cholesky().ok_or(LmmError::NotPositiveDefinite)?;
    let log_det_v = cholesky_log_det(&chol_v);
    let v_inv = chol_v.inverse();

    let v_inv_x = &v_inv * x;
    let xtvx = x.transpose() * &v_inv_x;
    let chol_x = xtvx.cholesky().ok_or_else(|| LmmError::SingularMatrix {
        context: "X'V^-1X in AI-REML".into(),
    })?;
    let log_det_xtvx = cholesky_log_det(&chol_x);
    let xtvx_inv = chol_x.inverse();

    let p = &v_inv - &v_inv_x * &xtvx_inv * v_inv_x.transpose();
    let py = &p * y;
    let beta = &xtvx_inv * (v_inv_x.transpose() * y);

    let y_p_y = y.dot(&py);
    let log_2_pi = (2.0 * std::f64::consts::PI).ln();
    let log_likelihood =
        -0.5 * ((n - n_fixed) as f64 * log_2_pi + log_det_v + log_det_xtvx + y_p_y);

    Ok(RemlState {
        log_likelihood,
        beta,
        xtvx_inv,
        p,
        py,
    })
}

impl FittingStrategy for AiReml {
    fn name(&self) -> &'static str {
        "ai-reml"
    }

    fn uses_decomposition(&self) -> bool {
        false
    }

    fn fit(
        &self,
        y: &DVector<f64>,
        x: &DMatrix<f64>,
        covariance: CovarianceInput<'_>,
    ) -> Result<MixedModelFit> {
        match covariance {
            CovarianceInput::Kinship(kinship) => self.fit_kinship(y, x, kinship.as_matrix()),
            CovarianceInput::Spectral(spectral) => {
                let k = spectral.reconstruct();
                self.fit_kinship(y, x, &k)
            }
        }
    }
}
