mod ai_reml;
mod eigen_reml;
mod result;
mod scan;
mod strategy;

pub use ai_reml::AiReml;
pub use eigen_reml::{EigenReml, H_MAX};
pub use result::{FitStatus, FitWarning, MixedModelFit, RemlIteration, VarianceComponent};
pub use scan::{association_scan, genomic_inflation, AssociationResult, ScanOptions};
pub use strategy::{fit_mixed_model, Algorithm, CovarianceInput, FittingStrategy};
