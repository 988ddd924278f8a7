pub mod config;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod genetics;
pub mod lmm;
pub mod matrix;
pub mod pipeline;
pub mod simulation;
pub mod types;

pub use config::{RemlOptions, SimulationConfig};
pub use error::{LmmError, Result};
