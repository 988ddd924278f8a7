use std::path::Path;

use nalgebra::{DMatrix, DVector};

use crate::error::{LmmError, Result};
use crate::genetics::{AlleleFrequencySummary, GenotypeMatrix};
use crate::lmm::AssociationResult;
use crate::types::{Dosage, MISSING};

/// Tokens read as a missing genotype.
const MISSING_TOKENS: [&str; 3] = ["NA", ".", ""];

/// A dosage matrix read from CSV together with its labels.
#[derive(Debug, Clone)]
pub struct DosageTable {
    /// Subject ids from a leading `id` column, if the file has one.
    pub subject_ids: Option<Vec<String>>,
    pub marker_names: Vec<String>,
    pub genotypes: GenotypeMatrix,
}

fn parse_dosage(token: &str, row: usize, marker: &str) -> Result<Dosage> {
    if MISSING_TOKENS.contains(&token) {
        return Ok(MISSING);
    }
    match token {
        "0" => Ok(0),
        "1" => Ok(1),
        "2" => Ok(2),
        other => Err(LmmError::Data(format!(
            "Invalid dosage '{}' for marker '{}' on data row {}",
            other,
            marker,
            row + 1
        ))),
    }
}

/// Read a subjects x markers dosage matrix.
///
/// The header row holds marker names. A first column named `id` is taken
/// as subject ids rather than a marker. Values must be 0, 1 or 2; `NA`,
/// `.` and empty fields are missing.
///
/// # Errors
/// Returns an error if the file cannot be read, the CSV is malformed, a
/// value is not a valid dosage, or there are no markers or no rows.
pub fn read_dosage_csv<P: AsRef<Path>>(path: P) -> Result<DosageTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let has_id = headers.first().map(|h| h == "id").unwrap_or(false);
    let offset = usize::from(has_id);
    let marker_names: Vec<String> = headers[offset..].to_vec();
    if marker_names.is_empty() {
        return Err(LmmError::Data("Dosage file has no marker columns".into()));
    }

    let mut ids = Vec::new();
    let mut values: Vec<Dosage> = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if has_id {
            ids.push(record.get(0).unwrap_or_default().to_string());
        }
        for (field, name) in record.iter().skip(offset).zip(&marker_names) {
            values.push(parse_dosage(field, row, name)?);
        }
    }

    let n_markers = marker_names.len();
    let n_subjects = values.len() / n_markers;
    if n_subjects == 0 {
        return Err(LmmError::Data("Dosage file has no data rows".into()));
    }
    let genotypes = GenotypeMatrix::from_row_slice(n_subjects, n_markers, &values)?;
    log::info!(
        "Read {} subjects x {} markers ({} missing)",
        n_subjects,
        n_markers,
        genotypes.n_missing()
    );

    Ok(DosageTable {
        subject_ids: has_id.then_some(ids),
        marker_names,
        genotypes,
    })
}

/// Read one numeric column of a CSV file as a phenotype vector.
///
/// Missing or non-numeric values are an error: the models need a complete
/// phenotype.
pub fn read_phenotype_csv<P: AsRef<Path>>(path: P, column: &str) -> Result<DVector<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let idx = reader
        .headers()?
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| LmmError::Data(format!("Column '{}' not found", column)))?;

    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let field = record.get(idx).unwrap_or_default();
        let value: f64 = field.parse().map_err(|_| {
            LmmError::Data(format!(
                "Non-numeric phenotype '{}' in column '{}' on data row {}",
                field,
                column,
                row + 1
            ))
        })?;
        if !value.is_finite() {
            return Err(LmmError::Data(format!(
                "Non-finite phenotype in column '{}' on data row {}",
                column,
                row + 1
            )));
        }
        values.push(value);
    }
    Ok(DVector::from_vec(values))
}

fn marker_label(names: Option<&[String]>, j: usize) -> String {
    names
        .and_then(|n| n.get(j).cloned())
        .unwrap_or_else(|| format!("m{}", j))
}

/// Write per-marker allele frequencies and scales.
pub fn write_marker_summary_csv<P: AsRef<Path>>(
    path: P,
    summary: &AlleleFrequencySummary,
    marker_names: Option<&[String]>,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record([
        "marker",
        "freq",
        "maf",
        "mu",
        "sigma",
        "hwe_sigma",
        "hwe_deviation",
        "n_observed",
    ])?;
    for j in 0..summary.n_markers() {
        writer.write_record([
            marker_label(marker_names, j),
            summary.freq[j].to_string(),
            summary.maf(j).to_string(),
            summary.mu[j].to_string(),
            summary.sigma[j].to_string(),
            summary.hwe_sigma(j).to_string(),
            summary.hwe_deviation(j).to_string(),
            summary.n_observed[j].to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a matrix with columns named `{prefix}1..{prefix}k`, e.g. principal
/// components as `PC1..PCk`.
pub fn write_matrix_csv<P: AsRef<Path>>(path: P, matrix: &DMatrix<f64>, prefix: &str) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    let header: Vec<String> = (1..=matrix.ncols()).map(|k| format!("{}{}", prefix, k)).collect();
    writer.write_record(&header)?;
    for row in matrix.row_iter() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write association scan results, one row per marker.
pub fn write_association_csv<P: AsRef<Path>>(
    path: P,
    results: &[AssociationResult],
    marker_names: Option<&[String]>,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record([
        "marker", "beta", "se", "z", "p_value", "tau", "sigma2", "converged",
    ])?;
    for r in results {
        writer.write_record([
            marker_label(marker_names, r.marker),
            r.beta.to_string(),
            r.se.to_string(),
            r.z.to_string(),
            r.p_value.to_string(),
            r.tau.to_string(),
            r.sigma2.to_string(),
            r.converged.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
