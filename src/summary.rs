// summary.rs

use crate::join::JoinedRecord;
use log::info;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SummaryRow {
    pub(crate) id: String,
    pub(crate) anno: String,
    pub(crate) cell_type: Option<String>,
    pub(crate) n_obs: usize,
    pub(crate) mean: f64,
    pub(crate) variance: f64,
    pub(crate) sd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SummaryStat {
    Mean,
    Variance,
    StdDev,
}

impl SummaryStat {
    pub(crate) fn value(self, row: &SummaryRow) -> f64 {
        match self {
            SummaryStat::Mean => row.mean,
            SummaryStat::Variance => row.variance,
            SummaryStat::StdDev => row.sd,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            SummaryStat::Mean => "mean rate",
            SummaryStat::Variance => "variance of rate",
            SummaryStat::StdDev => "sd of rate",
        }
    }

    pub(crate) fn file_tag(self) -> &'static str {
        match self {
            SummaryStat::Mean => "mean",
            SummaryStat::Variance => "variance",
            SummaryStat::StdDev => "sd",
        }
    }
}

type GroupKey<'a> = (&'a str, &'a str, Option<&'a str>);

/// Per-feature mean, sample variance and sd of the rate, optionally split by
/// cell type. Missing rates are dropped; an all-missing group yields NaN.
pub(crate) fn summarize(joined: &[JoinedRecord], by_cell_type: bool) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<GroupKey<'_>, Vec<f64>> = BTreeMap::new();
    for record in joined {
        let cell_type = if by_cell_type {
            record.cell_type.as_deref()
        } else {
            None
        };
        let rates = groups
            .entry((record.id.as_str(), record.anno.as_str(), cell_type))
            .or_default();
        if let Some(rate) = record.rate {
            rates.push(rate);
        }
    }

    let rows: Vec<SummaryRow> = groups
        .into_iter()
        .map(|((id, anno, cell_type), rates)| SummaryRow {
            id: id.to_string(),
            anno: anno.to_string(),
            cell_type: cell_type.map(str::to_string),
            n_obs: rates.len(),
            mean: rates.iter().mean(),
            variance: rates.iter().variance(),
            sd: rates.iter().std_dev(),
        })
        .collect();

    info!(
        "Summarised {} records into {} groups{}.",
        joined.len(),
        rows.len(),
        if by_cell_type { " by cell type" } else { "" }
    );
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rec(sample: &str, id: &str, cell_type: Option<&str>, rate: Option<f64>) -> JoinedRecord {
        JoinedRecord {
            sample: sample.to_string(),
            id: id.to_string(),
            anno: "promoters".to_string(),
            rate,
            cell_type: cell_type.map(str::to_string),
        }
    }

    #[test]
    fn missing_rates_are_dropped() {
        let joined = vec![
            rec("a", "f1", None, Some(0.2)),
            rec("b", "f1", None, Some(0.4)),
            rec("c", "f1", None, Some(0.6)),
            rec("d", "f1", None, None),
        ];
        let rows = summarize(&joined, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].n_obs, 3);
        assert_abs_diff_eq!(rows[0].mean, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[0].variance, 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[0].sd, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn grouped_by_cell_type() {
        let joined = vec![
            rec("a", "f1", Some("E4.5"), Some(0.1)),
            rec("b", "f1", Some("E4.5"), Some(0.3)),
            rec("c", "f1", Some("E6.5"), Some(0.7)),
            rec("d", "f1", Some("E6.5"), Some(0.9)),
        ];
        let rows = summarize(&joined, true);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].cell_type.as_deref(), Some("E4.5"));
        assert_abs_diff_eq!(rows[0].mean, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[0].sd, 0.1414, epsilon = 1e-4);

        assert_eq!(rows[1].cell_type.as_deref(), Some("E6.5"));
        assert_abs_diff_eq!(rows[1].mean, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[1].sd, 0.1414, epsilon = 1e-4);
    }

    #[test]
    fn ungrouped_ignores_cell_type() {
        let joined = vec![
            rec("a", "f1", Some("E4.5"), Some(0.1)),
            rec("c", "f1", Some("E6.5"), Some(0.7)),
        ];
        let rows = summarize(&joined, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cell_type, None);
        assert_eq!(rows[0].n_obs, 2);
    }

    #[test]
    fn all_missing_group_is_nan_not_error() {
        let joined = vec![rec("a", "f1", None, None), rec("b", "f1", None, None)];
        let rows = summarize(&joined, false);
        assert_eq!(rows[0].n_obs, 0);
        assert!(rows[0].mean.is_nan());
        assert!(rows[0].variance.is_nan());
        assert!(rows[0].sd.is_nan());
    }

    #[test]
    fn single_observation_has_mean_but_no_variance() {
        let joined = vec![rec("a", "f1", None, Some(0.5))];
        let rows = summarize(&joined, false);
        assert_abs_diff_eq!(rows[0].mean, 0.5, epsilon = 1e-12);
        assert!(rows[0].variance.is_nan());
    }

    #[test]
    fn unlabelled_records_form_their_own_group() {
        let joined = vec![
            rec("a", "f1", Some("E4.5"), Some(0.1)),
            rec("orphan", "f1", None, Some(0.7)),
        ];
        let rows = summarize(&joined, true);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cell_type, None);
        assert_eq!(rows[1].cell_type.as_deref(), Some("E4.5"));
    }
}
