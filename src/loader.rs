// loader.rs

use crate::error::{Result, ScmetError};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const REQUIRED_COLUMNS: [&str; 4] = ["sample", "id", "anno", "rate"];
const MISSING_TOKENS: [&str; 5] = ["", "NA", "NaN", "nan", "."];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MethylationRecord {
    pub(crate) sample: String,
    pub(crate) id: String,
    pub(crate) anno: String,
    pub(crate) rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SampleMetadata {
    pub(crate) sample: String,
    pub(crate) cell_type: String,
}

#[derive(Debug, Clone)]
pub(crate) struct LoaderOptions {
    /// Stripped from the end of every `sample` value of the rate table.
    pub(crate) sample_suffix: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            sample_suffix: ".tsv.gz".to_string(),
        }
    }
}

/// Opens `path` for reading, transparently decompressing gzip input.
fn open_maybe_gzip(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        debug!("{} is gzip-compressed.", path.display());
        let decoder: Box<dyn Read> = Box::new(MultiGzDecoder::new(reader));
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(reader))
    }
}

fn canonical_sample_id<'a>(raw: &'a str, suffix: &str) -> &'a str {
    if suffix.is_empty() {
        return raw;
    }
    raw.strip_suffix(suffix).unwrap_or(raw)
}

fn parse_rate(field: &str) -> std::result::Result<Option<f64>, String> {
    let trimmed = field.trim();
    if MISSING_TOKENS.contains(&trimmed) {
        return Ok(None);
    }
    let rate: f64 = trimmed
        .parse()
        .map_err(|_| format!("rate '{}' is not a number", trimmed))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("rate {} is outside [0, 1]", rate));
    }
    Ok(Some(rate))
}

/// Reads the long per-sample, per-feature rate table.
pub(crate) fn read_methylation_records(
    path: &Path,
    options: &LoaderOptions,
) -> Result<Vec<MethylationRecord>> {
    info!("Reading methylation rates from {}", path.display());
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_maybe_gzip(path)?);

    let headers = reader.headers()?.clone();
    let mut column_idx = [0usize; 4];
    for (slot, name) in column_idx.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| ScmetError::MissingColumn {
                column: name.to_string(),
                path: path.to_path_buf(),
            })?;
    }
    let [sample_idx, id_idx, anno_idx, rate_idx] = column_idx;

    let mut records = Vec::new();
    let mut n_missing_rates = 0usize;
    for row in reader.records() {
        let row = row?;
        let line = row.position().map_or(0, |p| p.line());
        let field = |idx: usize| row.get(idx).unwrap_or("");

        let rate = parse_rate(field(rate_idx)).map_err(|reason| ScmetError::MalformedRecord {
            path: path.to_path_buf(),
            line,
            reason,
        })?;
        if rate.is_none() {
            n_missing_rates += 1;
        }

        records.push(MethylationRecord {
            sample: canonical_sample_id(field(sample_idx).trim(), &options.sample_suffix)
                .to_string(),
            id: field(id_idx).trim().to_string(),
            anno: field(anno_idx).trim().to_string(),
            rate,
        });
    }

    info!(
        "Loaded {} methylation records ({} with missing rate) from {}",
        records.len(),
        n_missing_rates,
        path.display()
    );
    Ok(records)
}

/// Reads the headerless `sample cell_type` table.
pub(crate) fn read_sample_metadata(path: &Path) -> Result<Vec<SampleMetadata>> {
    info!("Reading sample metadata from {}", path.display());
    let reader = open_maybe_gzip(path)?;
    let mut metadata = Vec::new();

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(ScmetError::MalformedRecord {
                path: path.to_path_buf(),
                line: line_idx as u64 + 1,
                reason: format!("expected 2 columns (sample, cell_type), found {}", fields.len()),
            });
        }
        metadata.push(SampleMetadata {
            sample: fields[0].to_string(),
            cell_type: fields[1].to_string(),
        });
    }

    info!(
        "Loaded cell types for {} samples from {}",
        metadata.len(),
        path.display()
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use tempfile::tempdir;

    fn write_gz(path: &Path, content: &str) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn reads_gzipped_table_and_strips_sample_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rates.tsv.gz");
        write_gz(
            &path,
            "sample\tid\tanno\trate\tweight\n\
             E4.5-5_5.tsv.gz\tprom_1\tpromoters\t0.25\t3\n\
             E4.5-5_5.tsv.gz\tprom_2\tpromoters\tNA\t0\n\
             E6.5-1_2.tsv.gz\tcgi_9\tCGI\t1\t12\n",
        );

        let records = read_methylation_records(&path, &LoaderOptions::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sample, "E4.5-5_5");
        assert_eq!(records[0].id, "prom_1");
        assert_eq!(records[0].anno, "promoters");
        assert_eq!(records[0].rate, Some(0.25));
        assert_eq!(records[1].rate, None);
        assert_eq!(records[2].sample, "E6.5-1_2");
        assert_eq!(records[2].rate, Some(1.0));
    }

    #[test]
    fn reads_plain_text_with_reordered_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rates.tsv");
        std::fs::write(&path, "rate\tanno\tid\tsample\n0.5\tIAP\tiap_3\tcell_a\n").unwrap();

        let records = read_methylation_records(&path, &LoaderOptions::default()).unwrap();
        assert_eq!(
            records,
            vec![MethylationRecord {
                sample: "cell_a".to_string(),
                id: "iap_3".to_string(),
                anno: "IAP".to_string(),
                rate: Some(0.5),
            }]
        );
    }

    #[test]
    fn missing_column_is_named() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rates.tsv.gz");
        write_gz(&path, "sample\tid\trate\ncell_a\tf1\t0.1\n");

        let err = read_methylation_records(&path, &LoaderOptions::default()).unwrap_err();
        match err {
            ScmetError::MissingColumn { column, .. } => assert_eq!(column, "anno"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn out_of_range_rate_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rates.tsv");
        std::fs::write(&path, "sample\tid\tanno\trate\ncell_a\tf1\tCGI\t42\n").unwrap();

        let err = read_methylation_records(&path, &LoaderOptions::default()).unwrap_err();
        assert!(matches!(err, ScmetError::MalformedRecord { line: 2, .. }));
    }

    #[test]
    fn absent_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = read_methylation_records(&dir.path().join("nope.tsv.gz"), &LoaderOptions::default())
            .unwrap_err();
        assert!(matches!(err, ScmetError::Io(_)));
    }

    #[test]
    fn reads_space_delimited_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample_info.txt");
        std::fs::write(&path, "E4.5-5_5 E4.5\nE6.5-1_2  E6.5\n\n").unwrap();

        let metadata = read_sample_metadata(&path).unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[1].sample, "E6.5-1_2");
        assert_eq!(metadata[1].cell_type, "E6.5");
    }

    #[test]
    fn metadata_with_extra_column_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample_info.txt");
        std::fs::write(&path, "cell_a E4.5\ncell_b E6.5 extra\n").unwrap();

        let err = read_sample_metadata(&path).unwrap_err();
        assert!(matches!(err, ScmetError::MalformedRecord { line: 2, .. }));
    }
}
