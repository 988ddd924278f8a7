use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kinlmm_core::data::{
    read_dosage_csv, read_phenotype_csv, write_association_csv, write_marker_summary_csv,
    write_matrix_csv,
};
use kinlmm_core::diagnostics::{format_wald_tests, wald_tests};
use kinlmm_core::genetics::{
    standardize, AlleleFrequencySummary, KinshipMatrix, SpectralDecomposition,
    StandardizationMode, StandardizedMatrix,
};
use kinlmm_core::lmm::{
    association_scan, genomic_inflation, Algorithm, AssociationResult, MixedModelFit, ScanOptions,
};
use kinlmm_core::pipeline::run_simulation;
use kinlmm_core::{RemlOptions, SimulationConfig};

#[derive(Parser)]
#[command(name = "kinlmm")]
#[command(version)]
#[command(about = "Kinship-based linear mixed models on simulated or external genotypes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate genotypes and a phenotype, then fit marker models
    Simulate {
        /// JSON configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<String>,

        /// Number of subjects
        #[arg(long)]
        subjects: Option<usize>,

        /// Number of markers
        #[arg(long)]
        markers: Option<usize>,

        /// Number of causal markers
        #[arg(long)]
        causal: Option<usize>,

        /// Signal-to-noise ratio of the phenotype
        #[arg(long)]
        snr: Option<f64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Fraction of genotype cells set to missing
        #[arg(long)]
        missing_rate: Option<f64>,

        /// Drop monomorphic markers instead of failing
        #[arg(long)]
        drop_monomorphic: bool,

        /// Marker to test (default: one causal and one null marker)
        #[arg(long)]
        marker: Option<usize>,

        /// REML algorithm: "eigen" (default) or "ai"
        #[arg(long, default_value = "eigen")]
        algorithm: String,

        /// Maximum number of REML iterations
        #[arg(long)]
        max_iter: Option<usize>,

        /// Convergence tolerance
        #[arg(long)]
        tolerance: Option<f64>,

        /// Write principal components to this CSV file
        #[arg(long)]
        pcs_out: Option<String>,

        /// Number of principal components to write
        #[arg(long, default_value = "10")]
        n_pcs: usize,

        /// Output format: "text" (default) or "json"
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Run a marker-by-marker association scan on CSV data
    Scan {
        /// Dosage CSV (rows = subjects, columns = markers, optional `id` column)
        #[arg(short, long)]
        genotypes: String,

        /// Phenotype CSV
        #[arg(short, long)]
        phenotype: String,

        /// Phenotype column name
        #[arg(long)]
        column: String,

        /// Number of principal components to include as covariates
        #[arg(long, default_value = "0")]
        pcs: usize,

        /// Standardization: "p" (default), "mu" or "mu_sigma"
        #[arg(long, default_value = "p")]
        standardization: String,

        /// Drop monomorphic markers instead of failing
        #[arg(long)]
        drop_monomorphic: bool,

        /// Maximum number of REML iterations per marker
        #[arg(long, default_value = "100")]
        max_iter: usize,

        /// Convergence tolerance
        #[arg(long, default_value = "1e-8")]
        tolerance: f64,

        /// Write results to this CSV file instead of printing the top hits
        #[arg(short, long)]
        out: Option<String>,

        /// Stdout format without --out: "text" (top hits) or "json" (all markers)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Compute the kinship matrix and principal components from a dosage CSV
    Grm {
        /// Dosage CSV (rows = subjects, columns = markers, optional `id` column)
        #[arg(short, long)]
        genotypes: String,

        /// Standardization: "p" (default), "mu" or "mu_sigma"
        #[arg(long, default_value = "p")]
        standardization: String,

        /// Drop monomorphic markers instead of failing
        #[arg(long)]
        drop_monomorphic: bool,

        /// Write principal components to this CSV file
        #[arg(long)]
        pcs_out: Option<String>,

        /// Number of principal components to write
        #[arg(long, default_value = "10")]
        n_pcs: usize,

        /// Write the kinship matrix to this CSV file
        #[arg(long)]
        kinship_out: Option<String>,

        /// Write per-marker allele frequencies to this CSV file
        #[arg(long)]
        summary_out: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            subjects,
            markers,
            causal,
            snr,
            seed,
            missing_rate,
            drop_monomorphic,
            marker,
            algorithm,
            max_iter,
            tolerance,
            pcs_out,
            n_pcs,
            format,
        } => {
            let mut cfg = match config {
                Some(path) => SimulationConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config from '{}'", path))?,
                None => SimulationConfig::default(),
            };
            if let Some(v) = subjects {
                cfg.n_subjects = v;
            }
            if let Some(v) = markers {
                cfg.n_markers = v;
            }
            if let Some(v) = causal {
                cfg.n_causal = v;
            }
            if let Some(v) = snr {
                cfg.signal_to_noise = v;
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            if let Some(v) = missing_rate {
                cfg.missing_rate = v;
            }
            cfg.drop_monomorphic |= drop_monomorphic;

            let algorithm: Algorithm = algorithm.parse()?;
            let options = reml_options(algorithm, max_iter, tolerance);
            cmd_simulate(&cfg, marker, algorithm, &options, pcs_out.as_deref(), n_pcs, &format)
        }
        Commands::Scan {
            genotypes,
            phenotype,
            column,
            pcs,
            standardization,
            drop_monomorphic,
            max_iter,
            tolerance,
            out,
            format,
        } => cmd_scan(
            &genotypes,
            &phenotype,
            &column,
            pcs,
            &standardization,
            drop_monomorphic,
            RemlOptions::new(max_iter, tolerance),
            out.as_deref(),
            &format,
        ),
        Commands::Grm {
            genotypes,
            standardization,
            drop_monomorphic,
            pcs_out,
            n_pcs,
            kinship_out,
            summary_out,
        } => cmd_grm(
            &genotypes,
            &standardization,
            drop_monomorphic,
            pcs_out.as_deref(),
            n_pcs,
            kinship_out.as_deref(),
            summary_out.as_deref(),
        ),
    }
}

/// Per-algorithm defaults: 100 / 1e-8 for the eigen form, 50 / 1e-6 for AI-REML.
fn reml_options(algorithm: Algorithm, max_iter: Option<usize>, tolerance: Option<f64>) -> RemlOptions {
    let (default_iter, default_tol) = match algorithm {
        Algorithm::Eigen => (100, 1e-8),
        Algorithm::AiReml => (50, 1e-6),
    };
    RemlOptions::new(
        max_iter.unwrap_or(default_iter),
        tolerance.unwrap_or(default_tol),
    )
}

fn cmd_simulate(
    config: &SimulationConfig,
    marker: Option<usize>,
    algorithm: Algorithm,
    options: &RemlOptions,
    pcs_out: Option<&str>,
    n_pcs: usize,
    output_format: &str,
) -> Result<()> {
    eprintln!(
        "Simulating {} subjects x {} markers ({} causal, SNR {}, seed {})",
        config.n_subjects, config.n_markers, config.n_causal, config.signal_to_noise, config.seed
    );
    let run = run_simulation(config).context("Simulation failed")?;
    eprintln!(
        "Realised SNR {:.4} (signal variance {:.4}, noise variance {:.4})",
        run.phenotype.realised_snr(),
        run.phenotype.signal_variance,
        run.phenotype.noise_variance
    );

    if let Some(path) = pcs_out {
        let k = n_pcs.min(run.spectral.n_subjects());
        let pcs = run.spectral.principal_components(Some(k))?;
        write_matrix_csv(path, &pcs, "PC")
            .with_context(|| format!("Failed to write principal components to '{}'", path))?;
        eprintln!("Wrote {} principal components to '{}'", k, path);
    }

    let targets: Vec<(String, usize)> = match marker {
        Some(j) => vec![(format!("marker {}", j), j)],
        None => {
            let mut t = Vec::new();
            if let Some(&j) = run.causal_markers().first() {
                t.push((format!("causal marker {}", j), j));
            }
            if let Some(&j) = run.null_markers().first() {
                t.push((format!("null marker {}", j), j));
            }
            t
        }
    };

    let strategy = algorithm.strategy(options);
    let mut fits = Vec::new();
    for (label, j) in targets {
        let fit = run
            .fit_marker(j, strategy.as_ref())
            .with_context(|| format!("Fitting {} failed", label))?;
        fits.push((label, fit));
    }

    let eigenvalues: Vec<f64> = run.spectral.eigenvalues().iter().take(5).copied().collect();
    match output_format.to_lowercase().as_str() {
        "json" => {
            let fit_values: Vec<serde_json::Value> =
                fits.iter().map(|(label, fit)| fit_json(label, fit)).collect();
            let value = serde_json::json!({
                "config": config,
                "kinship": {
                    "mean_diagonal": run.kinship.mean_diagonal(),
                    "mean_off_diagonal": run.kinship.mean_off_diagonal(),
                    "leading_eigenvalues": eigenvalues,
                    "n_clamped": run.spectral.n_clamped(),
                },
                "causal_markers": run.causal_markers(),
                "fits": fit_values,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            println!("Kinship mean diagonal:     {:.4}", run.kinship.mean_diagonal());
            println!("Kinship mean off-diagonal: {:.4}", run.kinship.mean_off_diagonal());
            println!("Leading eigenvalues:       {:.3?}", eigenvalues);
            println!("Clamped eigenvalues:       {}\n", run.spectral.n_clamped());
            for (label, fit) in &fits {
                println!("# {}", label);
                print_text(fit);
            }
        }
    }
    Ok(())
}

fn print_text(fit: &MixedModelFit) {
    println!("{}", fit.summary());
    let labels = vec!["intercept".to_string(), "marker".to_string()];
    let tests = wald_tests(fit);
    if !tests.is_empty() {
        println!("{}", format_wald_tests(&tests, Some(labels.as_slice())));
    }
}

fn fit_json(label: &str, fit: &MixedModelFit) -> serde_json::Value {
    let tests: Vec<serde_json::Value> = wald_tests(fit)
        .iter()
        .map(|t| {
            serde_json::json!({
                "index": t.index,
                "estimate": t.estimate,
                "se": t.se,
                "z": t.z,
                "p_value": t.p_value,
            })
        })
        .collect();
    let warnings: Vec<String> = fit.warnings.iter().map(|w| w.to_string()).collect();
    serde_json::json!({
        "label": label,
        "strategy": fit.strategy,
        "converged": fit.is_converged(),
        "n_iterations": fit.n_iterations(),
        "log_likelihood": fit.log_likelihood,
        "aic": fit.aic(),
        "bic": fit.bic(),
        "tau": fit.tau,
        "sigma2": fit.sigma2,
        "heritability": fit.heritability(),
        "warnings": warnings,
        "wald_tests": tests,
    })
}

struct Prepared {
    marker_names: Vec<String>,
    summary: AlleleFrequencySummary,
    standardized: StandardizedMatrix,
    kinship: KinshipMatrix,
    spectral: SpectralDecomposition,
}

fn prepare(genotypes_path: &str, standardization: &str, drop_monomorphic: bool) -> Result<Prepared> {
    let mode: StandardizationMode = standardization.parse()?;
    let table = read_dosage_csv(genotypes_path)
        .with_context(|| format!("Failed to load genotypes from '{}'", genotypes_path))?;
    eprintln!(
        "Loaded {} subjects x {} markers from '{}'",
        table.genotypes.n_subjects(),
        table.genotypes.n_markers(),
        genotypes_path
    );

    let mut genotypes = table.genotypes;
    let mut marker_names = table.marker_names;
    let mut summary = genotypes.summarize();
    if drop_monomorphic {
        let keep = summary.polymorphic_markers();
        if keep.len() < genotypes.n_markers() {
            eprintln!("Dropping {} monomorphic markers", genotypes.n_markers() - keep.len());
            genotypes = genotypes.select_markers(&keep)?;
            marker_names = keep.iter().map(|&j| marker_names[j].clone()).collect();
            summary = genotypes.summarize();
        }
    }

    let standardized = standardize(&genotypes, &summary, mode).context("Standardization failed")?;
    let kinship = KinshipMatrix::from_standardized(&standardized).context("Kinship failed")?;
    let spectral = SpectralDecomposition::from_kinship(&kinship);
    Ok(Prepared {
        marker_names,
        summary,
        standardized,
        kinship,
        spectral,
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_scan(
    genotypes_path: &str,
    phenotype_path: &str,
    column: &str,
    n_pcs: usize,
    standardization: &str,
    drop_monomorphic: bool,
    reml: RemlOptions,
    out: Option<&str>,
    output_format: &str,
) -> Result<()> {
    let prepared = prepare(genotypes_path, standardization, drop_monomorphic)?;
    let y = read_phenotype_csv(phenotype_path, column)
        .with_context(|| format!("Failed to load phenotype from '{}'", phenotype_path))?;

    let options = ScanOptions { n_pcs, reml };
    let results = association_scan(
        &y,
        &prepared.standardized,
        &prepared.spectral,
        &[],
        &options,
    )
    .context("Association scan failed")?;

    let lambda_gc = genomic_inflation(&results);
    eprintln!(
        "Scanned {} markers, genomic inflation = {:.3}",
        results.len(),
        lambda_gc
    );

    if let Some(path) = out {
        write_association_csv(path, &results, Some(prepared.marker_names.as_slice()))
            .with_context(|| format!("Failed to write results to '{}'", path))?;
        eprintln!("Wrote results to '{}'", path);
        return Ok(());
    }
    match output_format.to_lowercase().as_str() {
        "json" => {
            let value = scan_json(&results, &prepared.marker_names, lambda_gc)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => print_top_hits(&results, &prepared.marker_names, 10),
    }
    Ok(())
}

/// Non-finite statistics of failed markers serialize as `null`.
fn scan_json(
    results: &[AssociationResult],
    names: &[String],
    lambda_gc: f64,
) -> Result<serde_json::Value> {
    let rows = results
        .iter()
        .map(|r| {
            let mut row = serde_json::to_value(r)?;
            row["name"] = serde_json::json!(names[r.marker]);
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(serde_json::json!({
        "genomic_inflation": lambda_gc,
        "results": rows,
    }))
}

fn print_top_hits(results: &[AssociationResult], names: &[String], n: usize) {
    let mut sorted: Vec<&AssociationResult> = results.iter().filter(|r| r.p_value.is_finite()).collect();
    sorted.sort_by(|a, b| a.p_value.total_cmp(&b.p_value));

    println!(
        "{:<20} {:>12} {:>12} {:>10} {:>12}",
        "Marker", "Beta", "SE", "z", "p"
    );
    for r in sorted.into_iter().take(n) {
        println!(
            "{:<20} {:>12.6} {:>12.6} {:>10.4} {:>12.4e}",
            names[r.marker], r.beta, r.se, r.z, r.p_value
        );
    }
}

fn cmd_grm(
    genotypes_path: &str,
    standardization: &str,
    drop_monomorphic: bool,
    pcs_out: Option<&str>,
    n_pcs: usize,
    kinship_out: Option<&str>,
    summary_out: Option<&str>,
) -> Result<()> {
    let prepared = prepare(genotypes_path, standardization, drop_monomorphic)?;
    let kinship = &prepared.kinship;
    let spectral = &prepared.spectral;

    println!("Standardization:           {:?}", prepared.standardized.mode());
    println!("Kinship dimensions:        {0} x {0}", kinship.n_subjects());
    println!("Kinship mean diagonal:     {:.4}", kinship.mean_diagonal());
    println!("Kinship mean off-diagonal: {:.4}", kinship.mean_off_diagonal());
    println!(
        "Clamped eigenvalues:       {} (smallest raw {:.3e})",
        spectral.n_clamped(),
        spectral.min_raw_eigenvalue()
    );

    let share = spectral.variance_explained();
    println!("\nLeading components:");
    for k in 0..spectral.n_subjects().min(5) {
        println!(
            "  PC{}: eigenvalue {:.4} ({:.2}%)",
            k + 1,
            spectral.eigenvalues()[k],
            100.0 * share[k]
        );
    }

    if let Some(path) = pcs_out {
        let k = n_pcs.min(spectral.n_subjects());
        let pcs = spectral.principal_components(Some(k))?;
        write_matrix_csv(path, &pcs, "PC")
            .with_context(|| format!("Failed to write principal components to '{}'", path))?;
        eprintln!("Wrote {} principal components to '{}'", k, path);
    }
    if let Some(path) = kinship_out {
        write_matrix_csv(path, kinship.as_matrix(), "S")
            .with_context(|| format!("Failed to write kinship to '{}'", path))?;
    }
    if let Some(path) = summary_out {
        write_marker_summary_csv(path, &prepared.summary, Some(prepared.marker_names.as_slice()))
            .with_context(|| format!("Failed to write marker summary to '{}'", path))?;
    }
    Ok(())
}
