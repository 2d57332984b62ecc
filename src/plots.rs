// plots.rs

use crate::error::{Result, ScmetError};
use crate::ppca::PcaResult;
use crate::summary::{SummaryRow, SummaryStat};
use log::{debug, info, warn};
use plotters::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{Continuous, Normal};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::path::Path;

const SCATTER_SIZE: (u32, u32) = (800, 600);
const PANEL_WIDTH: u32 = 520;
const PANEL_HEIGHT: u32 = 600;
const VIOLIN_HALF_WIDTH: f64 = 0.4;
const KDE_GRID_POINTS: usize = 64;
const JITTER_SEED: u64 = 7;
const MISSING_LABEL: &str = "NA";

/// Number of point marks drawn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RenderStats {
    pub(crate) marks: usize,
}

fn render_err<E: std::fmt::Display>(e: E) -> ScmetError {
    ScmetError::Render(e.to_string())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Finite min..max of `values` with 5% padding on both ends.
fn padded_range<I: IntoIterator<Item = f64>>(values: I) -> Range<f64> {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return -1.0..1.0;
    }
    if (hi - lo).abs() < f64::EPSILON {
        return (lo - 0.5)..(hi + 0.5);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad)..(hi + pad)
}

fn series_color(idx: usize) -> RGBAColor {
    Palette99::pick(idx).to_rgba()
}

/// Scatter of the first two components, one circle per sample coloured by
/// cell type. A single-component result is drawn against a zero y axis.
pub(crate) fn render_pca_scatter(
    result: &PcaResult,
    cell_types: &HashMap<&str, &str>,
    path: &Path,
    title: &str,
) -> Result<RenderStats> {
    if result.n_components() == 0 {
        return Err(ScmetError::Render(format!(
            "no components to plot for '{}'",
            result.annotation
        )));
    }
    ensure_parent_dir(path)?;

    let xs = result.scores.column(0).to_vec();
    let ys = if result.n_components() > 1 {
        result.scores.column(1).to_vec()
    } else {
        vec![0.0; xs.len()]
    };

    let mut groups: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for (sample_idx, sample) in result.samples.iter().enumerate() {
        let label = cell_types.get(sample.as_str()).copied().unwrap_or(MISSING_LABEL);
        groups
            .entry(label)
            .or_default()
            .push((xs[sample_idx], ys[sample_idx]));
    }

    let pct = |idx: usize| result.explained_variance.get(idx).map_or(0.0, |v| v * 100.0);
    let x_desc = format!("PC1 ({:.1}%)", pct(0));
    let y_desc = if result.n_components() > 1 {
        format!("PC2 ({:.1}%)", pct(1))
    } else {
        "(single component)".to_string()
    };

    let root = SVGBackend::new(path, SCATTER_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(45)
        .y_label_area_size(55)
        .build_cartesian_2d(padded_range(xs.iter().copied()), padded_range(ys.iter().copied()))
        .map_err(render_err)?;
    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()
        .map_err(render_err)?;

    let mut stats = RenderStats::default();
    for (idx, (label, points)) in groups.iter().enumerate() {
        let color = series_color(idx);
        chart
            .draw_series(points.iter().map(|&(x, y)| Circle::new((x, y), 5, color.filled())))
            .map_err(render_err)?
            .label(*label)
            .legend(move |(x, y)| Circle::new((x, y), 5, color.filled()));
        stats.marks += points.len();
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(render_err)?;
    root.present().map_err(render_err)?;

    info!("Wrote PCA scatter ({} points) to {}", stats.marks, path.display());
    Ok(stats)
}

/// Gaussian KDE evaluated on a grid spanning the observed range, scaled so
/// the widest point is `half_width`. Returns (value, width) pairs, or `None`
/// when the values carry no spread.
pub(crate) fn violin_outline(values: &[f64], half_width: f64) -> Option<Vec<(f64, f64)>> {
    if values.len() < 2 {
        return None;
    }
    let sd = values.iter().std_dev();
    if !(sd > 0.0) {
        return None;
    }
    let n = values.len() as f64;
    let iqr = Data::new(values.to_vec()).interquartile_range();
    let spread = if iqr > 0.0 { sd.min(iqr / 1.34) } else { sd };
    let bandwidth = 0.9 * spread * n.powf(-0.2);

    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let kernel = Normal::new(0.0, 1.0).ok()?;
    let step = (hi - lo) / (KDE_GRID_POINTS - 1) as f64;

    let density: Vec<(f64, f64)> = (0..KDE_GRID_POINTS)
        .map(|i| {
            let y = lo + step * i as f64;
            let d = values
                .iter()
                .map(|v| kernel.pdf((y - v) / bandwidth))
                .sum::<f64>()
                / (n * bandwidth);
            (y, d)
        })
        .collect();

    let peak = density.iter().map(|&(_, d)| d).fold(0.0_f64, f64::max);
    if !(peak > 0.0) {
        return None;
    }
    Some(
        density
            .into_iter()
            .map(|(y, d)| (y, d / peak * half_width))
            .collect(),
    )
}

/// Width of the outline at `y`, by linear interpolation.
fn width_at(outline: &[(f64, f64)], y: f64) -> f64 {
    match outline.iter().position(|&(oy, _)| oy >= y) {
        Some(0) => outline[0].1,
        Some(i) => {
            let (y0, w0) = outline[i - 1];
            let (y1, w1) = outline[i];
            if (y1 - y0).abs() < f64::EPSILON {
                w1
            } else {
                w0 + (w1 - w0) * (y - y0) / (y1 - y0)
            }
        }
        None => outline.last().map_or(0.0, |&(_, w)| w),
    }
}

/// One violin per annotation with a jittered point per summary row, optionally
/// split into one panel per cell type.
pub(crate) fn render_summary_violins(
    rows: &[SummaryRow],
    stat: SummaryStat,
    facet_by_cell_type: bool,
    path: &Path,
    title: &str,
) -> Result<RenderStats> {
    ensure_parent_dir(path)?;

    let finite_rows: Vec<&SummaryRow> = rows
        .iter()
        .filter(|row| {
            let keep = stat.value(row).is_finite();
            if !keep {
                debug!(
                    "Skipping {} of feature '{}' ({}): not finite.",
                    stat.file_tag(),
                    row.id,
                    row.anno
                );
            }
            keep
        })
        .collect();
    if finite_rows.is_empty() {
        warn!("No finite {} values to plot for {}", stat.file_tag(), path.display());
    }

    let annotations: Vec<&str> = finite_rows
        .iter()
        .map(|row| row.anno.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let anno_pos: HashMap<&str, usize> = annotations
        .iter()
        .enumerate()
        .map(|(idx, anno)| (*anno, idx))
        .collect();

    let mut facets: BTreeMap<&str, Vec<&SummaryRow>> = BTreeMap::new();
    for row in &finite_rows {
        let facet = if facet_by_cell_type {
            row.cell_type.as_deref().unwrap_or(MISSING_LABEL)
        } else {
            ""
        };
        facets.entry(facet).or_default().push(*row);
    }
    if facets.is_empty() {
        facets.insert("", Vec::new());
    }

    let y_range = padded_range(finite_rows.iter().map(|row| stat.value(row)));
    let x_range = -0.5..(annotations.len().max(1) as f64 - 0.5);
    let x_formatter = |x: &f64| {
        let rounded = x.round();
        if (x - rounded).abs() < 1e-6 && rounded >= 0.0 {
            annotations
                .get(rounded as usize)
                .map_or_else(String::new, |anno| anno.to_string())
        } else {
            String::new()
        }
    };

    let n_panels = facets.len() as u32;
    let root = SVGBackend::new(path, (PANEL_WIDTH * n_panels, PANEL_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;
    let root = root.titled(title, ("sans-serif", 24)).map_err(render_err)?;
    let panels = root.split_evenly((1, facets.len()));

    let mut rng = ChaCha8Rng::seed_from_u64(JITTER_SEED);
    let mut stats = RenderStats::default();

    for (panel, (facet, facet_rows)) in panels.iter().zip(facets.iter()) {
        let mut builder = ChartBuilder::on(panel);
        builder
            .margin(15)
            .x_label_area_size(40)
            .y_label_area_size(60);
        if !facet.is_empty() {
            builder.caption(*facet, ("sans-serif", 18));
        }
        let mut chart = builder
            .build_cartesian_2d(x_range.clone(), y_range.clone())
            .map_err(render_err)?;
        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(annotations.len().max(1))
            .x_label_formatter(&x_formatter)
            .x_desc("annotation")
            .y_desc(stat.label())
            .draw()
            .map_err(render_err)?;

        let mut by_anno: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for row in facet_rows {
            by_anno
                .entry(anno_pos[row.anno.as_str()])
                .or_default()
                .push(stat.value(row));
        }

        for (pos, values) in &by_anno {
            let color = series_color(*pos);
            let centre = *pos as f64;
            let outline = violin_outline(values, VIOLIN_HALF_WIDTH);

            if let Some(outline) = &outline {
                let mut polygon: Vec<(f64, f64)> =
                    outline.iter().map(|&(y, w)| (centre + w, y)).collect();
                polygon.extend(outline.iter().rev().map(|&(y, w)| (centre - w, y)));
                chart
                    .draw_series(std::iter::once(Polygon::new(
                        polygon.clone(),
                        color.mix(0.3).filled(),
                    )))
                    .map_err(render_err)?;
                polygon.push(polygon[0]);
                chart
                    .draw_series(std::iter::once(PathElement::new(polygon, color.stroke_width(1))))
                    .map_err(render_err)?;
            }

            let points: Vec<(f64, f64)> = values
                .iter()
                .map(|&y| {
                    let spread = outline
                        .as_deref()
                        .map_or(VIOLIN_HALF_WIDTH * 0.25, |o| width_at(o, y) * 0.8);
                    (centre + rng.random_range(-1.0..=1.0) * spread, y)
                })
                .collect();
            chart
                .draw_series(points.iter().map(|&p| Circle::new(p, 2, color.filled())))
                .map_err(render_err)?;
            stats.marks += points.len();
        }
    }

    root.present().map_err(render_err)?;
    info!(
        "Wrote {} violin plot ({} points) to {}",
        stat.file_tag(),
        stats.marks,
        path.display()
    );
    Ok(stats)
}

/// Mean against variance, one point per summary row, coloured by annotation.
pub(crate) fn render_mean_variance(
    rows: &[SummaryRow],
    path: &Path,
    title: &str,
) -> Result<RenderStats> {
    ensure_parent_dir(path)?;

    let mut groups: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for row in rows {
        if row.mean.is_finite() && row.variance.is_finite() {
            groups
                .entry(row.anno.as_str())
                .or_default()
                .push((row.mean, row.variance));
        } else {
            debug!("Skipping feature '{}' ({}): mean/variance not finite.", row.id, row.anno);
        }
    }

    let all_points = groups.values().flatten();
    let x_range = padded_range(all_points.clone().map(|p| p.0));
    let y_range = padded_range(all_points.map(|p| p.1));

    let root = SVGBackend::new(path, SCATTER_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, y_range)
        .map_err(render_err)?;
    chart
        .configure_mesh()
        .x_desc("mean rate")
        .y_desc("variance of rate")
        .draw()
        .map_err(render_err)?;

    let mut stats = RenderStats::default();
    for (idx, (anno, points)) in groups.iter().enumerate() {
        let color = series_color(idx);
        chart
            .draw_series(points.iter().map(|&p| Circle::new(p, 3, color.mix(0.7).filled())))
            .map_err(render_err)?
            .label(*anno)
            .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
        stats.marks += points.len();
    }
    if !groups.is_empty() {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()
            .map_err(render_err)?;
    }
    root.present().map_err(render_err)?;

    info!("Wrote mean-variance plot ({} points) to {}", stats.marks, path.display());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn row(id: &str, anno: &str, cell_type: Option<&str>, mean: f64, variance: f64) -> SummaryRow {
        SummaryRow {
            id: id.to_string(),
            anno: anno.to_string(),
            cell_type: cell_type.map(str::to_string),
            n_obs: 3,
            mean,
            variance,
            sd: variance.sqrt(),
        }
    }

    fn rows() -> Vec<SummaryRow> {
        vec![
            row("p1", "promoters", Some("E4.5"), 0.10, 0.010),
            row("p2", "promoters", Some("E4.5"), 0.20, 0.020),
            row("p3", "promoters", Some("E6.5"), 0.15, 0.015),
            row("c1", "CGI", Some("E4.5"), 0.05, 0.002),
            row("c2", "CGI", Some("E6.5"), 0.08, 0.004),
            row("c3", "CGI", Some("E6.5"), 0.12, 0.003),
            row("g1", "genebody", None, 0.70, 0.050),
        ]
    }

    #[test]
    fn violin_outline_peaks_at_half_width() {
        let outline = violin_outline(&[0.1, 0.2, 0.2, 0.3, 0.5], 0.4).unwrap();
        assert_eq!(outline.len(), KDE_GRID_POINTS);
        let peak = outline.iter().map(|&(_, w)| w).fold(0.0_f64, f64::max);
        assert!((peak - 0.4).abs() < 1e-12);
        assert!((outline[0].0 - 0.1).abs() < 1e-12);
        assert!((outline[KDE_GRID_POINTS - 1].0 - 0.5).abs() < 1e-12);
        assert!(outline.iter().all(|&(_, w)| w > 0.0));
    }

    #[test]
    fn violin_outline_needs_spread() {
        assert!(violin_outline(&[0.3], 0.4).is_none());
        assert!(violin_outline(&[0.3, 0.3, 0.3], 0.4).is_none());
    }

    #[test]
    fn scatter_draws_one_mark_per_sample() {
        let dir = tempdir().unwrap();
        let result = PcaResult {
            annotation: "promoters".to_string(),
            samples: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            features: vec!["f1".into(), "f2".into()],
            scores: array![[-1.0, 0.2], [-0.5, -0.3], [0.4, 0.1], [1.1, 0.0]],
            loadings: array![[0.8, -0.6], [0.6, 0.8]],
            explained_variance: vec![0.9, 0.1],
            noise_variance: 1e-3,
            iterations: 12,
            converged: true,
        };
        let cell_types: HashMap<&str, &str> = [("a", "E4.5"), ("b", "E4.5"), ("c", "E6.5")]
            .into_iter()
            .collect();
        let path = dir.path().join("plots/promoters.pca.svg");

        let stats = render_pca_scatter(&result, &cell_types, &path, "promoters").unwrap();
        assert_eq!(stats.marks, 4);
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn violins_draw_one_mark_per_row() {
        let dir = tempdir().unwrap();
        let rows = rows();

        let path = dir.path().join("mean.svg");
        let stats =
            render_summary_violins(&rows, SummaryStat::Mean, false, &path, "Mean rate").unwrap();
        assert_eq!(stats.marks, rows.len());

        let path = dir.path().join("variance_by_cell_type.svg");
        let stats =
            render_summary_violins(&rows, SummaryStat::Variance, true, &path, "Variance").unwrap();
        assert_eq!(stats.marks, rows.len());
        assert!(path.exists());
    }

    #[test]
    fn non_finite_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let mut rows = rows();
        rows.push(row("empty", "CGI", None, f64::NAN, f64::NAN));

        let stats = render_summary_violins(
            &rows,
            SummaryStat::StdDev,
            false,
            &dir.path().join("sd.svg"),
            "sd",
        )
        .unwrap();
        assert_eq!(stats.marks, rows.len() - 1);

        let stats =
            render_mean_variance(&rows, &dir.path().join("mean_var.svg"), "mean vs variance")
                .unwrap();
        assert_eq!(stats.marks, rows.len() - 1);
    }

    #[test]
    fn empty_input_renders_empty_chart() {
        let dir = tempdir().unwrap();
        let stats = render_summary_violins(
            &[],
            SummaryStat::Mean,
            true,
            &dir.path().join("empty.svg"),
            "empty",
        )
        .unwrap();
        assert_eq!(stats.marks, 0);
    }
}
