// pipeline.rs

use crate::cli::CliArgs;
use crate::error::Result;
use crate::join::{cell_type_index, left_join, JoinedRecord};
use crate::loader::{read_methylation_records, read_sample_metadata, LoaderOptions};
use crate::matrix::build_feature_matrix;
use crate::output::{self, file_safe, output_path};
use crate::plots;
use crate::ppca::{run_ppca, PpcaConfig, ScalingMode};
use crate::summary::{summarize, SummaryStat};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub(crate) methylation_path: PathBuf,
    pub(crate) metadata_path: PathBuf,
    pub(crate) output_prefix: String,
    /// Empty means every annotation present in the input.
    pub(crate) annotations: Vec<String>,
    pub(crate) max_missing_fraction: f64,
    pub(crate) loader: LoaderOptions,
    pub(crate) ppca: PpcaConfig,
}

impl PipelineConfig {
    pub(crate) fn from_cli(args: &CliArgs) -> Self {
        Self {
            methylation_path: args.methylation_path.clone(),
            metadata_path: args.metadata_path.clone(),
            output_prefix: args.output_prefix.clone(),
            annotations: args.annotations.clone(),
            max_missing_fraction: args.max_missing,
            loader: LoaderOptions {
                sample_suffix: args.sample_suffix.clone(),
            },
            ppca: PpcaConfig {
                n_components: args.components,
                scaling: args.scaling,
                max_iterations: args.max_iterations,
                tolerance: args.tolerance,
                seed: args.seed,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BranchReport {
    pub(crate) annotation: String,
    pub(crate) status: String,
    pub(crate) error: Option<String>,
    pub(crate) n_samples: Option<usize>,
    pub(crate) n_features: Option<usize>,
    pub(crate) explained_variance: Vec<f64>,
    pub(crate) noise_variance: Option<f64>,
    pub(crate) iterations: Option<usize>,
    pub(crate) converged: Option<bool>,
}

impl BranchReport {
    fn failed(annotation: &str, message: String) -> Self {
        Self {
            annotation: annotation.to_string(),
            status: "error".to_string(),
            error: Some(message),
            n_samples: None,
            n_features: None,
            explained_variance: Vec::new(),
            noise_variance: None,
            iterations: None,
            converged: None,
        }
    }

    pub(crate) fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunReport {
    pub(crate) methylation_path: PathBuf,
    pub(crate) metadata_path: PathBuf,
    pub(crate) n_records: usize,
    pub(crate) n_records_without_cell_type: usize,
    pub(crate) n_components: usize,
    pub(crate) scaling: ScalingMode,
    pub(crate) max_missing_fraction: f64,
    pub(crate) branches: Vec<BranchReport>,
}

impl RunReport {
    pub(crate) fn n_failed(&self) -> usize {
        self.branches.iter().filter(|b| !b.is_ok()).count()
    }
}

/// Annotation classes to analyse, in sorted order.
fn select_annotations(joined: &[JoinedRecord], requested: &[String]) -> Vec<String> {
    if !requested.is_empty() {
        return requested
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }
    joined
        .iter()
        .map(|r| r.anno.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Matrix, PPCA, tables and scatter plot for one annotation class.
fn run_branch(
    joined: &[JoinedRecord],
    annotation: &str,
    config: &PipelineConfig,
    cell_types: &HashMap<&str, &str>,
) -> Result<BranchReport> {
    let matrix = build_feature_matrix(joined, annotation, config.max_missing_fraction)?;
    let result = run_ppca(&matrix, &config.ppca)?;

    output::write_scores(&config.output_prefix, &result, cell_types)?;
    output::write_explained_variance(&config.output_prefix, &result)?;
    output::write_loadings(&config.output_prefix, &result)?;
    plots::render_pca_scatter(
        &result,
        cell_types,
        &output_path(&config.output_prefix, &format!("{}.pca.svg", file_safe(annotation))),
        &format!("PPCA: {}", annotation),
    )?;

    Ok(BranchReport {
        annotation: annotation.to_string(),
        status: "ok".to_string(),
        error: None,
        n_samples: Some(matrix.n_samples()),
        n_features: Some(matrix.n_features()),
        explained_variance: result.explained_variance.clone(),
        noise_variance: Some(result.noise_variance),
        iterations: Some(result.iterations),
        converged: Some(result.converged),
    })
}

fn write_summaries(joined: &[JoinedRecord], prefix: &str) -> Result<()> {
    let overall = summarize(joined, false);
    let by_cell_type = summarize(joined, true);
    output::write_summary(prefix, "summary", &overall)?;
    output::write_summary(prefix, "summary_by_cell_type", &by_cell_type)?;

    for stat in [SummaryStat::Mean, SummaryStat::Variance, SummaryStat::StdDev] {
        plots::render_summary_violins(
            &overall,
            stat,
            false,
            &output_path(prefix, &format!("{}_by_annotation.svg", stat.file_tag())),
            &format!("{} by annotation", stat.label()),
        )?;
        plots::render_summary_violins(
            &by_cell_type,
            stat,
            true,
            &output_path(prefix, &format!("{}_by_annotation_and_cell_type.svg", stat.file_tag())),
            &format!("{} by annotation and cell type", stat.label()),
        )?;
    }
    plots::render_mean_variance(
        &overall,
        &output_path(prefix, "mean_vs_variance.svg"),
        "Mean vs variance of methylation rate",
    )?;
    Ok(())
}

/// Runs the whole analysis. Per-annotation failures are logged and recorded
/// in the report; only input, join and summary failures abort the run.
pub(crate) fn run(config: &PipelineConfig) -> Result<RunReport> {
    let records = read_methylation_records(&config.methylation_path, &config.loader)?;
    let metadata = read_sample_metadata(&config.metadata_path)?;
    let n_records = records.len();
    let (joined, join_stats) = left_join(records, &metadata);
    let cell_types = cell_type_index(&metadata);

    write_summaries(&joined, &config.output_prefix)?;

    let annotations = select_annotations(&joined, &config.annotations);
    info!(
        "Analysing {} annotation class(es): {:?}",
        annotations.len(),
        annotations
    );

    let pb_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} annotations ({percent}%) ETA: {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let pb = ProgressBar::new(annotations.len() as u64).with_style(pb_style);

    let branches: Vec<BranchReport> = annotations
        .par_iter()
        .map(|annotation| {
            let outcome = run_branch(&joined, annotation, config, &cell_types);
            pb.inc(1);
            match outcome {
                Ok(report) => report,
                Err(e) => {
                    error!("Analysis of annotation '{}' failed: {}", annotation, e);
                    BranchReport::failed(annotation, e.to_string())
                }
            }
        })
        .collect();
    pb.finish_with_message("Annotation analyses complete.");

    let report = RunReport {
        methylation_path: config.methylation_path.clone(),
        metadata_path: config.metadata_path.clone(),
        n_records,
        n_records_without_cell_type: join_stats.unmatched,
        n_components: config.ppca.n_components,
        scaling: config.ppca.scaling,
        max_missing_fraction: config.max_missing_fraction,
        branches,
    };
    if report.n_failed() > 0 {
        warn!(
            "{} of {} annotation analyses failed; see errors above.",
            report.n_failed(),
            report.branches.len()
        );
    }
    output::write_run_summary(&config.output_prefix, &report)?;
    Ok(report)
}
