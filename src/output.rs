// output.rs

use crate::error::Result;
use crate::pipeline::RunReport;
use crate::ppca::PcaResult;
use crate::summary::SummaryRow;
use log::info;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Replaces characters that do not belong in a file name.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

pub(crate) fn output_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix, suffix))
}

fn create_output_file(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            info!("Created output directory: {}", parent.display());
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn fmt_stat(value: f64) -> String {
    if value.is_finite() {
        format!("{:.6}", value)
    } else {
        "NA".to_string()
    }
}

pub(crate) fn write_scores(
    prefix: &str,
    result: &PcaResult,
    cell_types: &HashMap<&str, &str>,
) -> Result<PathBuf> {
    let path = output_path(prefix, &format!("{}.scores.tsv", file_safe(&result.annotation)));
    let mut writer = create_output_file(&path)?;

    write!(writer, "sample\tcell_type")?;
    for pc in 1..=result.n_components() {
        write!(writer, "\tPC{}", pc)?;
    }
    writeln!(writer)?;

    for (sample_idx, sample) in result.samples.iter().enumerate() {
        let cell_type = cell_types.get(sample.as_str()).copied().unwrap_or("NA");
        write!(writer, "{}\t{}", sample, cell_type)?;
        for score in result.scores.row(sample_idx) {
            write!(writer, "\t{:.6}", score)?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    info!("Wrote scores for '{}' to {}", result.annotation, path.display());
    Ok(path)
}

pub(crate) fn write_explained_variance(prefix: &str, result: &PcaResult) -> Result<PathBuf> {
    let path = output_path(
        prefix,
        &format!("{}.explained_variance.tsv", file_safe(&result.annotation)),
    );
    let mut writer = create_output_file(&path)?;
    writeln!(writer, "PC\texplained_variance")?;
    for (idx, fraction) in result.explained_variance.iter().enumerate() {
        writeln!(writer, "{}\t{:.6}", idx + 1, fraction)?;
    }
    writer.flush()?;
    Ok(path)
}

pub(crate) fn write_loadings(prefix: &str, result: &PcaResult) -> Result<PathBuf> {
    let path = output_path(prefix, &format!("{}.loadings.tsv", file_safe(&result.annotation)));
    let mut writer = create_output_file(&path)?;

    write!(writer, "id")?;
    for pc in 1..=result.n_components() {
        write!(writer, "\tPC{}_loading", pc)?;
    }
    writeln!(writer)?;

    for (feature_idx, feature) in result.features.iter().enumerate() {
        write!(writer, "{}", feature)?;
        for loading in result.loadings.row(feature_idx) {
            write!(writer, "\t{:.6}", loading)?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(path)
}

pub(crate) fn write_summary(prefix: &str, name: &str, rows: &[SummaryRow]) -> Result<PathBuf> {
    let path = output_path(prefix, &format!("{}.tsv", name));
    let mut writer = create_output_file(&path)?;
    writeln!(writer, "id\tanno\tcell_type\tn_obs\tmean\tvariance\tsd")?;
    for row in rows {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.id,
            row.anno,
            row.cell_type.as_deref().unwrap_or("NA"),
            row.n_obs,
            fmt_stat(row.mean),
            fmt_stat(row.variance),
            fmt_stat(row.sd)
        )?;
    }
    writer.flush()?;
    info!("Wrote {} summary rows to {}", rows.len(), path.display());
    Ok(path)
}

pub(crate) fn write_run_summary(prefix: &str, report: &RunReport) -> Result<PathBuf> {
    let path = output_path(prefix, "run_summary.json");
    let mut writer = create_output_file(&path)?;
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(path)
}
