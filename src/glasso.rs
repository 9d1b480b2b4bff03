// glasso.rs
//
// Sparse inverse covariance estimation: coordinate-descent graphical lasso with
// the regularization strength picked by K-fold cross-validation over a
// refined log-spaced alpha grid.

use crate::error::{MacchiatoError, Result};
use crate::matrix_ops::{
    all_finite, empirical_covariance, inverse_symmetric, logdet_spd, pinvh, select_square,
};
use log::{debug, warn};
use ndarray::{s, Array1, Array2, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct GraphicalLassoConfig {
    /// Stop when the duality gap falls below this value.
    pub tol: f64,
    /// Tolerance of the inner lasso coordinate descent.
    pub enet_tol: f64,
    pub max_iter: usize,
}

impl Default for GraphicalLassoConfig {
    fn default() -> Self {
        Self {
            tol: 1e-4,
            enet_tol: 1e-4,
            max_iter: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphicalLassoCvConfig {
    pub n_alphas: usize,
    pub n_refinements: usize,
    pub folds: usize,
    pub lasso: GraphicalLassoConfig,
}

impl Default for GraphicalLassoCvConfig {
    fn default() -> Self {
        Self {
            n_alphas: 4,
            n_refinements: 4,
            folds: 5,
            lasso: GraphicalLassoConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SparseInverseFit {
    pub covariance: Array2<f64>,
    pub precision: Array2<f64>,
    pub alpha: f64,
    pub iterations: usize,
}

/// Smallest alpha for which every off-diagonal precision entry is zero.
pub fn alpha_max(emp_cov: &Array2<f64>) -> f64 {
    let mut max = 0.0f64;
    for ((i, j), v) in emp_cov.indexed_iter() {
        if i != j {
            max = max.max(v.abs());
        }
    }
    max
}

/// Gaussian log-likelihood of `emp_cov` under `precision`, as used to score held-out folds.
pub fn log_likelihood(emp_cov: &Array2<f64>, precision: &Array2<f64>) -> f64 {
    let p = precision.nrows() as f64;
    let mut ll = -(emp_cov * precision).sum() + logdet_spd(precision);
    ll -= p * (2.0 * std::f64::consts::PI).ln();
    ll / 2.0
}

fn dual_gap(emp_cov: &Array2<f64>, precision: &Array2<f64>, alpha: f64) -> f64 {
    let n = precision.nrows() as f64;
    let off_diagonal_l1 =
        precision.mapv(f64::abs).sum() - precision.diag().mapv(f64::abs).sum();
    (emp_cov * precision).sum() - n + alpha * off_diagonal_l1
}

/// Cyclic coordinate descent for min ½ wᵀQw − qᵀw + α‖w‖₁.
fn lasso_gram(
    gram: &Array2<f64>,
    target: &Array1<f64>,
    alpha: f64,
    mut w: Array1<f64>,
    max_iter: usize,
    tol: f64,
) -> Array1<f64> {
    let p = w.len();
    for _ in 0..max_iter {
        let mut w_max = 0.0f64;
        let mut d_w_max = 0.0f64;
        for j in 0..p {
            let q_jj = gram[[j, j]];
            if q_jj == 0.0 {
                continue;
            }
            let w_old = w[j];
            let rho = target[j] - gram.row(j).dot(&w) + q_jj * w_old;
            let shrunk = rho.abs() - alpha;
            w[j] = if shrunk > 0.0 { rho.signum() * shrunk / q_jj } else { 0.0 };
            d_w_max = d_w_max.max((w[j] - w_old).abs());
            w_max = w_max.max(w[j].abs());
        }
        if w_max == 0.0 || d_w_max / w_max < tol {
            break;
        }
    }
    w
}

/// L1-penalized maximum-likelihood precision estimate for a fixed `alpha`.
///
/// `init` warm-starts the covariance (its off-diagonal is shrunk by 5% and its
/// diagonal reset to the empirical one).
pub fn graphical_lasso(
    emp_cov: &Array2<f64>,
    alpha: f64,
    init: Option<&Array2<f64>>,
    config: &GraphicalLassoConfig,
) -> Result<SparseInverseFit> {
    let n = emp_cov.nrows();
    if alpha == 0.0 {
        return Ok(SparseInverseFit {
            covariance: emp_cov.clone(),
            precision: inverse_symmetric(emp_cov)?,
            alpha,
            iterations: 0,
        });
    }

    let mut covariance = init.unwrap_or(emp_cov).clone() * 0.95;
    covariance.diag_mut().assign(&emp_cov.diag());
    let mut precision = pinvh(&covariance)?;

    let mut iterations = 0;
    let mut converged = false;
    for iteration in 0..config.max_iter {
        iterations = iteration + 1;
        for idx in 0..n {
            let others: Vec<usize> = (0..n).filter(|&k| k != idx).collect();
            let sub_covariance = select_square(&covariance, &others);
            let row: Array1<f64> = others.iter().map(|&k| emp_cov[[idx, k]]).collect();

            let scale = precision[[idx, idx]] + 1000.0 * f64::EPSILON;
            let start: Array1<f64> = others.iter().map(|&k| -precision[[k, idx]] / scale).collect();
            let coefs = lasso_gram(
                &sub_covariance,
                &row,
                alpha,
                start,
                config.max_iter,
                config.enet_tol,
            );

            let cov_column: Array1<f64> = others.iter().map(|&k| covariance[[k, idx]]).collect();
            let diagonal = 1.0 / (covariance[[idx, idx]] - cov_column.dot(&coefs));
            precision[[idx, idx]] = diagonal;
            for (pos, &k) in others.iter().enumerate() {
                precision[[k, idx]] = -diagonal * coefs[pos];
                precision[[idx, k]] = -diagonal * coefs[pos];
            }
            let updated = sub_covariance.dot(&coefs);
            for (pos, &k) in others.iter().enumerate() {
                covariance[[idx, k]] = updated[pos];
                covariance[[k, idx]] = updated[pos];
            }
        }
        if !precision.sum().is_finite() {
            return Err(MacchiatoError::EstimationFailed(format!(
                "graphical lasso diverged at alpha={:.6}: non-finite precision",
                alpha
            )));
        }
        let gap = dual_gap(emp_cov, &precision, alpha);
        if gap.abs() < config.tol {
            converged = true;
            break;
        }
    }
    if !converged {
        debug!(
            "graphical lasso did not converge within {} iterations (alpha={:.6})",
            config.max_iter, alpha
        );
    }

    Ok(SparseInverseFit {
        covariance,
        precision,
        alpha,
        iterations,
    })
}

/// Contiguous K-fold split of `n` samples; the first `n % k` folds get one extra sample.
fn kfold_ranges(n: usize, k: usize) -> Vec<(usize, usize)> {
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|fold| {
            let len = base + usize::from(fold < extra);
            let range = (start, start + len);
            start += len;
            range
        })
        .collect()
}

fn logspace(start_exp: f64, stop_exp: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![10f64.powf(start_exp)];
    }
    let step = (stop_exp - start_exp) / (count - 1) as f64;
    (0..count)
        .map(|i| 10f64.powf(start_exp + step * i as f64))
        .collect()
}

/// Held-out scores of each alpha (descending order) on one fold, warm-starting along the path.
fn score_fold(
    data: &Array2<f64>,
    test_range: (usize, usize),
    alphas: &[f64],
    config: &GraphicalLassoConfig,
) -> Vec<f64> {
    let (start, end) = test_range;
    let train_rows: Vec<usize> = (0..data.nrows()).filter(|&r| r < start || r >= end).collect();
    let train = data.select(Axis(0), &train_rows);
    let test = data.slice(s![start..end, ..]).to_owned();
    let train_cov = empirical_covariance(&train);
    let test_cov = empirical_covariance(&test);

    let mut warm: Option<Array2<f64>> = None;
    alphas
        .iter()
        .map(|&alpha| match graphical_lasso(&train_cov, alpha, warm.as_ref(), config) {
            Ok(fit) => {
                let score = log_likelihood(&test_cov, &fit.precision);
                warm = Some(fit.covariance);
                if score.is_finite() { score } else { f64::NEG_INFINITY }
            }
            Err(e) => {
                debug!("alpha {:.6} failed on fold {:?}: {}", alpha, test_range, e);
                warm = None;
                f64::NEG_INFINITY
            }
        })
        .collect()
}

/// Graphical lasso with alpha selected by cross-validated log-likelihood.
///
/// `data` is (time points x regions).
pub fn graphical_lasso_cv(data: &Array2<f64>, config: &GraphicalLassoCvConfig) -> Result<SparseInverseFit> {
    let (n_samples, n_features) = data.dim();
    if n_samples < 2 * config.folds {
        return Err(MacchiatoError::EstimationFailed(format!(
            "sparse inverse estimation needs at least {} time points for {}-fold cross-validation, found {}",
            2 * config.folds,
            config.folds,
            n_samples
        )));
    }
    let emp_cov = empirical_covariance(data);
    let top = alpha_max(&emp_cov);
    if top <= 0.0 || n_features < 2 {
        debug!("covariance is already diagonal; skipping the alpha search");
        return graphical_lasso(&emp_cov, 0.0, None, &config.lasso);
    }

    let folds = kfold_ranges(n_samples, config.folds);
    let mut alphas = logspace((0.01 * top).log10(), top.log10(), config.n_alphas);
    alphas.reverse();

    // (alpha, mean held-out score), kept sorted by decreasing alpha
    let mut path: Vec<(f64, f64)> = Vec::new();
    let mut best_index = 0;
    for refinement in 0..config.n_refinements {
        let fold_scores: Vec<Vec<f64>> = folds
            .par_iter()
            .map(|&range| score_fold(data, range, &alphas, &config.lasso))
            .collect();
        for (i, &alpha) in alphas.iter().enumerate() {
            let mean = fold_scores.iter().map(|scores| scores[i]).sum::<f64>() / folds.len() as f64;
            path.push((alpha, mean));
        }
        path.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut best_score = f64::NEG_INFINITY;
        let mut last_finite = 0;
        for (index, &(_, score)) in path.iter().enumerate() {
            let score = if score >= 0.1 / f64::EPSILON { f64::NAN } else { score };
            if score.is_finite() {
                last_finite = index;
            }
            if score >= best_score {
                best_score = score;
                best_index = index;
            }
        }
        debug!(
            "graphical lasso CV refinement {}: best alpha {:.6} (score {:.4})",
            refinement + 1,
            path[best_index].0,
            best_score
        );

        let (upper, lower) = if best_index == 0 {
            (path[0].0, path[1].0)
        } else if best_index == last_finite && best_index != path.len() - 1 {
            (path[best_index].0, path[best_index + 1].0)
        } else if best_index == path.len() - 1 {
            (path[best_index].0, 0.01 * path[best_index].0)
        } else {
            (path[best_index - 1].0, path[best_index + 1].0)
        };
        let refined = logspace(upper.log10(), lower.log10(), config.n_alphas + 2);
        alphas = refined[1..refined.len() - 1].to_vec();
    }

    let best_alpha = path[best_index].0;
    if path.iter().all(|&(_, score)| !score.is_finite()) {
        warn!("every cross-validated alpha produced a non-finite score; using alpha={:.6}", best_alpha);
    }
    let fit = graphical_lasso(&emp_cov, best_alpha, None, &config.lasso)?;
    if !all_finite(&fit.covariance) || !all_finite(&fit.precision) {
        return Err(MacchiatoError::EstimationFailed(format!(
            "graphical lasso produced non-finite estimates at alpha={:.6}",
            best_alpha
        )));
    }
    Ok(fit)
}
