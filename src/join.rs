// join.rs

use crate::loader::{MethylationRecord, SampleMetadata};
use log::{info, warn};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JoinedRecord {
    pub(crate) sample: String,
    pub(crate) id: String,
    pub(crate) anno: String,
    pub(crate) rate: Option<f64>,
    pub(crate) cell_type: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct JoinStats {
    pub(crate) matched: usize,
    pub(crate) unmatched: usize,
    pub(crate) unmatched_samples: BTreeSet<String>,
}

/// Index of sample id to cell type. Later entries win on duplicate samples.
pub(crate) fn cell_type_index(metadata: &[SampleMetadata]) -> HashMap<&str, &str> {
    let mut index = HashMap::with_capacity(metadata.len());
    for entry in metadata {
        if let Some(previous) = index.insert(entry.sample.as_str(), entry.cell_type.as_str()) {
            warn!(
                "Sample '{}' listed more than once in metadata ('{}' replaced by '{}').",
                entry.sample, previous, entry.cell_type
            );
        }
    }
    index
}

/// Left join of rate records onto sample metadata. Row count and order of
/// `records` are preserved.
pub(crate) fn left_join(
    records: Vec<MethylationRecord>,
    metadata: &[SampleMetadata],
) -> (Vec<JoinedRecord>, JoinStats) {
    let index = cell_type_index(metadata);
    let mut stats = JoinStats::default();

    let joined: Vec<JoinedRecord> = records
        .into_iter()
        .map(|record| {
            let cell_type = index.get(record.sample.as_str()).map(|ct| ct.to_string());
            if cell_type.is_some() {
                stats.matched += 1;
            } else {
                stats.unmatched += 1;
                stats.unmatched_samples.insert(record.sample.clone());
            }
            JoinedRecord {
                sample: record.sample,
                id: record.id,
                anno: record.anno,
                rate: record.rate,
                cell_type,
            }
        })
        .collect();

    info!(
        "Joined {} records with metadata: {} matched, {} without cell type.",
        joined.len(),
        stats.matched,
        stats.unmatched
    );
    if !stats.unmatched_samples.is_empty() {
        warn!(
            "{} sample(s) have no cell type (first 5): {:?}",
            stats.unmatched_samples.len(),
            stats.unmatched_samples.iter().take(5).collect::<Vec<_>>()
        );
    }
    (joined, stats)
}
