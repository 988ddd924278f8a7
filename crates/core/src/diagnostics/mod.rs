mod convergence;
pub mod wald;

pub use convergence::ConvergenceMonitor;
pub use wald::{format_wald_tests, wald_test, wald_tests, WaldTest};
