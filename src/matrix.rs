// matrix.rs

use crate::error::{Result, ScmetError};
use crate::join::JoinedRecord;
use log::{debug, info};
use ndarray::{Array2, Axis};
use std::collections::HashMap;

pub(crate) const DEFAULT_MAX_MISSING_FRACTION: f64 = 0.5;

/// Samples x features rates of one annotation class. Missing cells are NaN.
#[derive(Debug, Clone)]
pub(crate) struct FeatureMatrix {
    pub(crate) annotation: String,
    pub(crate) samples: Vec<String>,
    pub(crate) features: Vec<String>,
    /// Missing fraction of each retained column, aligned with `features`.
    pub(crate) missing_fraction: Vec<f64>,
    pub(crate) values: Array2<f64>,
}

impl FeatureMatrix {
    pub(crate) fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub(crate) fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub(crate) fn observed_fraction(&self) -> f64 {
        if self.missing_fraction.is_empty() {
            return 0.0;
        }
        1.0 - self.missing_fraction.iter().sum::<f64>() / self.missing_fraction.len() as f64
    }
}

/// Assigns each distinct key a dense index in order of first appearance.
fn intern<'a>(key: &'a str, index: &mut HashMap<&'a str, usize>, order: &mut Vec<String>) -> usize {
    *index.entry(key).or_insert_with(|| {
        order.push(key.to_string());
        order.len() - 1
    })
}

/// Pivots the rows of `annotation` into a samples x features matrix and keeps
/// the feature columns whose missing fraction is strictly below
/// `max_missing_fraction`.
pub(crate) fn build_feature_matrix(
    joined: &[JoinedRecord],
    annotation: &str,
    max_missing_fraction: f64,
) -> Result<FeatureMatrix> {
    if !(max_missing_fraction > 0.0 && max_missing_fraction <= 1.0) {
        return Err(ScmetError::InvalidParameter(format!(
            "Missing-fraction threshold must be in (0, 1], got {}",
            max_missing_fraction
        )));
    }

    let mut sample_index: HashMap<&str, usize> = HashMap::new();
    let mut feature_index: HashMap<&str, usize> = HashMap::new();
    let mut samples = Vec::new();
    let mut features = Vec::new();
    let mut cells: HashMap<(usize, usize), Option<f64>> = HashMap::new();

    for record in joined.iter().filter(|r| r.anno == annotation) {
        let row = intern(&record.sample, &mut sample_index, &mut samples);
        let col = intern(&record.id, &mut feature_index, &mut features);
        if cells.insert((row, col), record.rate).is_some() {
            return Err(ScmetError::AmbiguousPivot {
                annotation: annotation.to_string(),
                sample: record.sample.clone(),
                id: record.id.clone(),
            });
        }
    }

    if cells.is_empty() {
        return Err(ScmetError::EmptyAnnotation(annotation.to_string()));
    }

    let mut full = Array2::<f64>::from_elem((samples.len(), features.len()), f64::NAN);
    for (&(row, col), rate) in &cells {
        if let Some(rate) = rate {
            full[[row, col]] = *rate;
        }
    }

    let n_samples = samples.len() as f64;
    let column_missing: Vec<f64> = full
        .axis_iter(Axis(1))
        .map(|column| column.iter().filter(|v| v.is_nan()).count() as f64 / n_samples)
        .collect();

    let keep: Vec<usize> = column_missing
        .iter()
        .enumerate()
        .filter(|(_, missing)| **missing < max_missing_fraction)
        .map(|(col, _)| col)
        .collect();

    debug!(
        "Annotation '{}': {} of {} features have missing fraction below {}.",
        annotation,
        keep.len(),
        features.len(),
        max_missing_fraction
    );

    let values = full.select(Axis(1), &keep);
    let missing_fraction = keep.iter().map(|&col| column_missing[col]).collect();
    let features = keep.iter().map(|&col| features[col].clone()).collect();

    let matrix = FeatureMatrix {
        annotation: annotation.to_string(),
        samples,
        features,
        missing_fraction,
        values,
    };
    info!(
        "Built '{}' matrix: {} samples x {} features ({:.1}% observed).",
        annotation,
        matrix.n_samples(),
        matrix.n_features(),
        matrix.observed_fraction() * 100.0
    );
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(sample: &str, id: &str, anno: &str, rate: Option<f64>) -> JoinedRecord {
        JoinedRecord {
            sample: sample.to_string(),
            id: id.to_string(),
            anno: anno.to_string(),
            rate,
            cell_type: None,
        }
    }

    /// Ten samples; `n_missing` of them lack a rate for `id`.
    fn column(id: &str, n_missing: usize) -> Vec<JoinedRecord> {
        (0..10)
            .map(|i| {
                let rate = if i < n_missing { None } else { Some(0.1 * i as f64) };
                rec(&format!("s{i}"), id, "CGI", rate)
            })
            .collect()
    }

    #[test]
    fn threshold_is_strict() {
        let mut joined = column("keep_40pct", 4);
        joined.extend(column("drop_60pct", 6));
        joined.extend(column("drop_50pct", 5));

        let matrix = build_feature_matrix(&joined, "CGI", 0.5).unwrap();
        assert_eq!(matrix.features, vec!["keep_40pct".to_string()]);
        assert_eq!(matrix.n_samples(), 10);
        assert_eq!(matrix.missing_fraction, vec![0.4]);
        assert!(matrix.missing_fraction.iter().all(|&m| m < 0.5));
    }

    #[test]
    fn absent_pairs_count_as_missing() {
        let joined = vec![
            rec("a", "f1", "promoters", Some(0.1)),
            rec("b", "f1", "promoters", Some(0.2)),
            rec("c", "f1", "promoters", Some(0.3)),
            rec("a", "f2", "promoters", Some(0.9)),
            rec("c", "f3", "CGI", Some(0.5)),
        ];
        let matrix = build_feature_matrix(&joined, "promoters", 0.5).unwrap();
        assert_eq!(matrix.samples, vec!["a", "b", "c"]);
        assert_eq!(matrix.features, vec!["f1"]);
        assert_eq!(matrix.values.column(0).to_vec(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn preserves_first_appearance_order() {
        let joined = vec![
            rec("z", "f9", "IAP", Some(0.1)),
            rec("a", "f1", "IAP", Some(0.2)),
            rec("a", "f9", "IAP", Some(0.3)),
            rec("z", "f1", "IAP", None),
        ];
        let matrix = build_feature_matrix(&joined, "IAP", 1.0).unwrap();
        assert_eq!(matrix.samples, vec!["z", "a"]);
        assert_eq!(matrix.features, vec!["f9", "f1"]);
        assert_eq!(matrix.values[[1, 0]], 0.3);
        assert!(matrix.values[[0, 1]].is_nan());
    }

    #[test]
    fn duplicate_sample_feature_pair_is_rejected() {
        let joined = vec![
            rec("a", "f1", "genebody", Some(0.1)),
            rec("b", "f1", "genebody", Some(0.2)),
            rec("a", "f1", "genebody", Some(0.3)),
        ];
        let err = build_feature_matrix(&joined, "genebody", 0.5).unwrap_err();
        match err {
            ScmetError::AmbiguousPivot { sample, id, .. } => {
                assert_eq!(sample, "a");
                assert_eq!(id, "f1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicates_in_other_annotations_are_ignored() {
        let joined = vec![
            rec("a", "f1", "genebody", Some(0.1)),
            rec("a", "f1", "genebody", Some(0.3)),
            rec("a", "f1", "promoters", Some(0.5)),
        ];
        assert!(build_feature_matrix(&joined, "promoters", 0.5).is_ok());
    }

    #[test]
    fn unknown_annotation_is_empty() {
        let joined = vec![rec("a", "f1", "CGI", Some(0.1))];
        let err = build_feature_matrix(&joined, "active_enhancers", 0.5).unwrap_err();
        assert!(matches!(err, ScmetError::EmptyAnnotation(_)));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let joined = vec![rec("a", "f1", "CGI", Some(0.1))];
        assert!(matches!(
            build_feature_matrix(&joined, "CGI", 0.0).unwrap_err(),
            ScmetError::InvalidParameter(_)
        ));
        assert!(matches!(
            build_feature_matrix(&joined, "CGI", 1.5).unwrap_err(),
            ScmetError::InvalidParameter(_)
        ));
    }
}
