// cli.rs

use crate::matrix::DEFAULT_MAX_MISSING_FRACTION;
use crate::ppca::ScalingMode;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Probabilistic PCA and summary statistics for single-cell methylation rates.", long_about = None, propagate_version = true)]
pub(crate) struct CliArgs {
    /// Long table of rates (columns sample, id, anno, rate); gzip or plain TSV.
    #[arg(short = 'm', long = "methylation", required = true)]
    pub(crate) methylation_path: PathBuf,

    /// Space-delimited `sample cell_type` table without header.
    #[arg(short = 's', long = "metadata", required = true)]
    pub(crate) metadata_path: PathBuf,

    #[arg(short, long = "out", required = true)]
    pub(crate) output_prefix: String,

    #[arg(short = 'k', long, default_value_t = 2)]
    pub(crate) components: usize,

    /// Features with a missing fraction at or above this value are dropped.
    #[arg(long, default_value_t = DEFAULT_MAX_MISSING_FRACTION)]
    pub(crate) max_missing: f64,

    #[arg(long, value_enum, default_value_t = ScalingMode::UnitVariance)]
    pub(crate) scaling: ScalingMode,

    /// Annotation classes to analyse; defaults to every class in the input.
    #[arg(long, value_delimiter = ',')]
    pub(crate) annotations: Vec<String>,

    #[arg(long, default_value = ".tsv.gz")]
    pub(crate) sample_suffix: String,

    #[arg(long = "max-iter", default_value_t = 1000)]
    pub(crate) max_iterations: usize,

    #[arg(long, default_value_t = 1e-6)]
    pub(crate) tolerance: f64,

    #[arg(long, default_value_t = 42)]
    pub(crate) seed: u64,

    #[arg(short = 't', long)]
    pub(crate) threads: Option<usize>,

    #[arg(long, default_value = "Info")]
    pub(crate) log_level: String,
}
