use crate::lmm::RemlIteration;

/// Monitors convergence of a REML solver and keeps its iteration history.
///
/// Each solver records the statistic its stopping rule is defined on in
/// `RemlIteration::change` (relative parameter change for AI-REML, the
/// ratio step for the eigen form).
#[derive(Debug)]
pub struct ConvergenceMonitor {
    tol: f64,
    max_iter: usize,
    history: Vec<RemlIteration>,
}

impl ConvergenceMonitor {
    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self {
            tol,
            max_iter,
            history: Vec::new(),
        }
    }

    /// Record a new iteration.
    pub fn record(&mut self, step: RemlIteration) {
        log::debug!(
            "REML iter {}: logL = {:.6}, tau = {:.6}, sigma2 = {:.6}, change = {:.3e}",
            step.iteration,
            step.log_likelihood,
            step.tau,
            step.sigma2,
            step.change
        );
        self.history.push(step);
    }

    /// Check if the last recorded change is below tolerance.
    pub fn is_converged(&self) -> bool {
        self.history
            .last()
            .map(|r| r.change < self.tol)
            .unwrap_or(false)
    }

    /// Check if maximum iterations reached.
    pub fn max_reached(&self) -> bool {
        self.history.len() >= self.max_iter
    }

    /// Change of the last iteration, or infinity before the first one.
    pub fn last_change(&self) -> f64 {
        self.history
            .last()
            .map(|r| r.change)
            .unwrap_or(f64::INFINITY)
    }

    /// Number of iterations recorded.
    pub fn n_iterations(&self) -> usize {
        self.history.len()
    }

    pub fn into_history(self) -> Vec<RemlIteration> {
        self.history
    }
}
