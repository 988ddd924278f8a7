pub mod dense;

pub use dense::cholesky_log_det;
