/// Allele dosage encoding. Valid values are 0, 1, 2 and [`MISSING`].
pub type Dosage = i8;

/// Sentinel for an unobserved genotype.
pub const MISSING: Dosage = -1;
