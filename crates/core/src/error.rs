use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmmError {
    #[error("Data error: {0}")]
    Data(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Marker {marker} is degenerate (allele frequency {freq}); standardization variance is zero")]
    DegenerateColumn { marker: usize, freq: f64 },

    #[error("Noise scale is undefined: {0}")]
    UndefinedScale(String),

    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Singular matrix encountered in {context}")]
    SingularMatrix { context: String },

    #[error("REML did not converge after {iterations} iterations (change = {change:.2e})")]
    NotConverged { iterations: usize, change: f64 },

    #[error("Dimension mismatch: expected {expected}, got {got} in {context}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LmmError>;
