// Genotype matrices, standardization, kinship and its spectrum.

pub mod genotype;
pub mod kinship;
pub mod spectral;
pub mod standardize;

pub use genotype::{AlleleFrequencySummary, GenotypeMatrix};
pub use kinship::KinshipMatrix;
pub use spectral::SpectralDecomposition;
pub use standardize::{standardize, StandardizationMode, StandardizedMatrix};
