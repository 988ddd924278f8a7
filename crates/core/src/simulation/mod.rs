// Seeded simulation of genotypes and phenotypes. Every function takes the
// random source explicitly so runs are reproducible from a single seed.

mod genotypes;
mod phenotype;

pub use genotypes::{simulate_genotypes, SimulatedGenotypes};
pub use phenotype::{simulate_phenotype, CausalEffects, SimulatedPhenotype};
