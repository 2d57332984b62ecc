// ppca.rs
//
// Probabilistic PCA fitted by EM with missing entries imputed from the
// current reconstruction at every E-step (Roweis 1998; Verbeek's variant).

use crate::error::{Result, ScmetError};
use crate::matrix::FeatureMatrix;
use log::{debug, info, warn};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::Serialize;

const MIN_NOISE_VARIANCE: f64 = 1e-10;
const MIN_COLUMN_SD: f64 = 1e-12;
const MIN_COMPONENT_FRACTION: f64 = 1e-12;
const MIN_ITERATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ScalingMode {
    /// Centre only.
    #[value(name = "none")]
    #[serde(rename = "none")]
    CenterOnly,
    /// Centre and divide by the column standard deviation.
    #[value(name = "uv")]
    UnitVariance,
    /// Centre and divide by the square root of the column standard deviation.
    Pareto,
}

#[derive(Debug, Clone)]
pub(crate) struct PpcaConfig {
    pub(crate) n_components: usize,
    pub(crate) scaling: ScalingMode,
    pub(crate) max_iterations: usize,
    pub(crate) tolerance: f64,
    pub(crate) seed: u64,
}

impl Default for PpcaConfig {
    fn default() -> Self {
        Self {
            n_components: 2,
            scaling: ScalingMode::UnitVariance,
            max_iterations: 1000,
            tolerance: 1e-6,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PcaResult {
    pub(crate) annotation: String,
    pub(crate) samples: Vec<String>,
    pub(crate) features: Vec<String>,
    /// n_samples x k
    pub(crate) scores: Array2<f64>,
    /// n_features x k, orthonormal columns
    pub(crate) loadings: Array2<f64>,
    pub(crate) explained_variance: Vec<f64>,
    /// Isotropic noise variance in scaled units.
    pub(crate) noise_variance: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
}

impl PcaResult {
    pub(crate) fn n_components(&self) -> usize {
        self.scores.ncols()
    }
}

fn degenerate(msg: impl Into<String>) -> ScmetError {
    ScmetError::DegenerateReduction(msg.into())
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Inverse and log-determinant of a symmetric positive definite matrix.
fn spd_inverse(a: &Array2<f64>, what: &str) -> Result<(Array2<f64>, f64)> {
    let chol = to_dmatrix(a)
        .cholesky()
        .ok_or_else(|| degenerate(format!("{} is not positive definite", what)))?;
    let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
    Ok((from_dmatrix(&chol.inverse()), log_det))
}

/// Centres and scales `values` column-wise using observed entries only.
/// Missing cells come back as 0 and are listed in the returned index.
fn standardize(
    matrix: &FeatureMatrix,
    scaling: ScalingMode,
) -> Result<(Array2<f64>, Vec<(usize, usize)>)> {
    let mut y = matrix.values.clone();
    for (j, mut column) in y.axis_iter_mut(Axis(1)).enumerate() {
        let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        let feature = &matrix.features[j];
        if observed.is_empty() {
            return Err(degenerate(format!("feature '{}' has no observed values", feature)));
        }
        let n_obs = observed.len() as f64;
        let mean = observed.iter().sum::<f64>() / n_obs;

        let scale = match scaling {
            ScalingMode::CenterOnly => 1.0,
            ScalingMode::UnitVariance | ScalingMode::Pareto => {
                if observed.len() < 2 {
                    return Err(degenerate(format!(
                        "feature '{}' has fewer than 2 observed values and cannot be scaled",
                        feature
                    )));
                }
                let var = observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n_obs - 1.0);
                let sd = var.sqrt();
                if sd <= MIN_COLUMN_SD {
                    return Err(degenerate(format!(
                        "feature '{}' is constant across observed samples",
                        feature
                    )));
                }
                if scaling == ScalingMode::Pareto {
                    sd.sqrt()
                } else {
                    sd
                }
            }
        };

        column.mapv_inplace(|v| if v.is_nan() { 0.0 } else { (v - mean) / scale });
    }

    let hidden: Vec<(usize, usize)> = matrix
        .values
        .indexed_iter()
        .filter(|(_, v)| v.is_nan())
        .map(|(idx, _)| idx)
        .collect();
    Ok((y, hidden))
}

fn impute(y: &mut Array2<f64>, hidden: &[(usize, usize)], x: &Array2<f64>, c: &Array2<f64>) {
    for &(i, j) in hidden {
        y[[i, j]] = x.row(i).dot(&c.row(j));
    }
}

fn observed_residual(
    y: &Array2<f64>,
    hidden: &[(usize, usize)],
    x: &Array2<f64>,
    c: &Array2<f64>,
) -> f64 {
    let mut residual = x.dot(&c.t()) - y;
    for &(i, j) in hidden {
        residual[[i, j]] = 0.0;
    }
    residual.mapv(|v| v * v).sum()
}

/// Runs probabilistic PCA on a matrix that may contain NaN cells.
pub(crate) fn run_ppca(matrix: &FeatureMatrix, config: &PpcaConfig) -> Result<PcaResult> {
    let k = config.n_components;
    let n = matrix.n_samples();
    let d = matrix.n_features();

    if k == 0 {
        return Err(ScmetError::InvalidParameter(
            "Number of components must be > 0.".to_string(),
        ));
    }
    if n < 2 {
        return Err(degenerate(format!("PCA requires at least 2 samples, found {}", n)));
    }
    if d == 0 {
        return Err(degenerate("PCA requires at least 1 feature, found 0"));
    }
    let max_k = (n - 1).min(d);
    if k > max_k {
        return Err(degenerate(format!(
            "requested {} components but a {} x {} matrix supports at most {}",
            k, n, d, max_k
        )));
    }
    if config.max_iterations == 0 || !(config.tolerance > 0.0) {
        return Err(ScmetError::InvalidParameter(
            "max_iterations must be > 0 and tolerance must be positive.".to_string(),
        ));
    }

    let (mut y, hidden) = standardize(matrix, config.scaling)?;
    let n_missing = hidden.len() as f64;
    let (nf, df) = (n as f64, d as f64);

    info!(
        "Running PPCA on '{}': k={}, {} x {}, {} missing cells, scaling={:?}, seed={}",
        matrix.annotation, k, n, d, hidden.len(), config.scaling, config.seed
    );

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut c: Array2<f64> = Array2::from_shape_simple_fn((d, k), || rng.sample(StandardNormal));
    let mut ctc = c.t().dot(&c);
    let (ctc_inv, _) = spd_inverse(&ctc, "initial loading Gram matrix")?;
    let mut x = y.dot(&c).dot(&ctc_inv);
    let mut ss = (observed_residual(&y, &hidden, &x, &c) / (nf * df - n_missing))
        .max(MIN_NOISE_VARIANCE);

    let identity = Array2::<f64>::eye(k);
    let mut old_objective = f64::INFINITY;
    let mut iterations = 1;
    let mut converged = false;

    while iterations < config.max_iterations {
        // log det(Sx) = -log det(I + C'C / ss)
        let (sx, precision_log_det) =
            spd_inverse(&(&identity + &(&ctc / ss)), "posterior covariance")?;
        let ss_old = ss;

        if !hidden.is_empty() {
            impute(&mut y, &hidden, &x, &c);
        }

        x = y.dot(&c).dot(&sx) / ss;
        let sum_xtx = x.t().dot(&x);
        let (m_inv, _) = spd_inverse(&(&sum_xtx + &(&sx * nf)), "M-step system")?;
        c = y.t().dot(&x).dot(&m_inv);
        ctc = c.t().dot(&c);

        let residual = (x.dot(&c.t()) - &y).mapv(|v| v * v).sum();
        ss = ((residual + nf * (&ctc * &sx).sum() + n_missing * ss_old) / (nf * df))
            .max(MIN_NOISE_VARIANCE);

        let objective = nf * df
            + nf * (df * ss.ln() + sx.diag().sum() + precision_log_det)
            + sum_xtx.diag().sum()
            - n_missing * ss_old.ln();
        if !objective.is_finite() {
            return Err(degenerate(format!(
                "EM objective became non-finite at iteration {}",
                iterations
            )));
        }
        let relative_change = (1.0 - objective / old_objective).abs();
        old_objective = objective;
        iterations += 1;

        if iterations % 100 == 0 {
            debug!(
                "PPCA '{}' iteration {}: objective={:.6}, relative change={:.3e}, ss={:.3e}",
                matrix.annotation, iterations, objective, relative_change, ss
            );
        }
        if relative_change < config.tolerance && iterations > MIN_ITERATIONS {
            converged = true;
            break;
        }
    }

    if converged {
        info!("PPCA '{}' converged after {} iterations.", matrix.annotation, iterations);
    } else {
        warn!(
            "PPCA '{}' did not converge within {} iterations; using last estimate.",
            matrix.annotation, config.max_iterations
        );
    }

    if !hidden.is_empty() {
        impute(&mut y, &hidden, &x, &c);
    }

    let (scores, loadings, explained_variance) = rotate_to_principal_axes(y, &c)?;
    for (idx, fraction) in explained_variance.iter().enumerate() {
        if !fraction.is_finite() || *fraction < MIN_COMPONENT_FRACTION {
            return Err(degenerate(format!(
                "component {} of '{}' explains no variance ({:e}); requested components exceed the usable rank",
                idx + 1,
                matrix.annotation,
                fraction
            )));
        }
    }

    info!(
        "PPCA '{}' explained variance: {:?}",
        matrix.annotation,
        explained_variance.iter().map(|v| format!("{:.4}", v)).collect::<Vec<_>>()
    );

    Ok(PcaResult {
        annotation: matrix.annotation.clone(),
        samples: matrix.samples.clone(),
        features: matrix.features.clone(),
        scores,
        loadings,
        explained_variance,
        noise_variance: ss,
        iterations,
        converged,
    })
}

/// Orthonormalises the fitted loadings and rotates them onto the eigenvectors
/// of the projected covariance, ordered by decreasing variance. Returns
/// scores, loadings and per-component fractions of the total variance of the
/// completed data.
fn rotate_to_principal_axes(
    completed: Array2<f64>,
    c: &Array2<f64>,
) -> Result<(Array2<f64>, Array2<f64>, Vec<f64>)> {
    let n = completed.nrows();
    let k = c.ncols();
    let denom = (n - 1) as f64;

    let means: Array1<f64> = completed
        .mean_axis(Axis(0))
        .ok_or_else(|| degenerate("cannot centre an empty matrix"))?;
    let centred = &completed - &means;
    let total_variance = centred.mapv(|v| v * v).sum() / denom;
    if !(total_variance > 0.0) {
        return Err(degenerate("completed data has zero total variance"));
    }

    let q = from_dmatrix(&to_dmatrix(c).qr().q());
    let projected = centred.dot(&q);
    let cov = projected.t().dot(&projected) / denom;

    let eigen = SymmetricEigen::new(to_dmatrix(&cov));
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let rotation = Array2::from_shape_fn((k, k), |(i, j)| eigen.eigenvectors[(i, order[j])]);
    let mut loadings = q.dot(&rotation);

    // Largest-magnitude loading of each component is made positive.
    for mut column in loadings.axis_iter_mut(Axis(1)) {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }

    let scores = centred.dot(&loadings);
    let explained_variance = scores
        .axis_iter(Axis(1))
        .map(|pc| pc.mapv(|v| v * v).sum() / denom / total_variance)
        .collect();

    Ok((scores, loadings, explained_variance))
}
