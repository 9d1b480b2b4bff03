// matrix_ops.rs
//
// Small dense linear-algebra helpers shared by the estimators and graph metrics.

use crate::error::{MacchiatoError, Result};
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Eigh, Inverse, UPLO};

/// Maximum-likelihood covariance of (samples x features) data: centred, divided by n.
pub(crate) fn empirical_covariance(data: &Array2<f64>) -> Array2<f64> {
    let n_samples = data.nrows().max(1) as f64;
    let means = data
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(data.ncols()));
    let centred = data - &means.insert_axis(Axis(0));
    centred.t().dot(&centred) / n_samples
}

pub(crate) fn symmetrize(m: &Array2<f64>) -> Array2<f64> {
    (m + &m.t()) * 0.5
}

pub(crate) fn all_finite(m: &Array2<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Inverse of a symmetric matrix, symmetrized to remove round-off asymmetry.
pub(crate) fn inverse_symmetric(m: &Array2<f64>) -> Result<Array2<f64>> {
    let inv = m.inv()?;
    if !all_finite(&inv) {
        return Err(MacchiatoError::EstimationFailed(
            "matrix is singular, inverse is not finite".to_string(),
        ));
    }
    Ok(symmetrize(&inv))
}

/// Applies `f` to the eigenvalues of a symmetric matrix: V diag(f(λ)) Vᵀ.
pub(crate) fn map_symmetric_eigenvalues<F>(m: &Array2<f64>, f: F) -> Result<Array2<f64>>
where
    F: Fn(f64) -> f64,
{
    let (eigenvalues, eigenvectors) = m.eigh(UPLO::Lower)?;
    let mapped = eigenvalues.mapv(f);
    let scaled = &eigenvectors * &mapped.insert_axis(Axis(0));
    Ok(scaled.dot(&eigenvectors.t()))
}

/// Pseudo-inverse of a symmetric matrix; eigenvalues below the cutoff are dropped.
pub(crate) fn pinvh(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (eigenvalues, _) = m.eigh(UPLO::Lower)?;
    let largest = eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let cutoff = largest * m.nrows() as f64 * f64::EPSILON;
    map_symmetric_eigenvalues(m, |l| if l.abs() > cutoff { 1.0 / l } else { 0.0 })
}

/// log det of a symmetric positive definite matrix, `-inf` otherwise.
pub(crate) fn logdet_spd(m: &Array2<f64>) -> f64 {
    match m.eigh(UPLO::Lower) {
        Ok((eigenvalues, _)) if eigenvalues.iter().all(|&l| l > 0.0) => {
            eigenvalues.iter().map(|l| l.ln()).sum()
        }
        _ => f64::NEG_INFINITY,
    }
}

/// Square sub-matrix on the given rows/columns.
pub(crate) fn select_square(m: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    m.select(Axis(0), indices).select(Axis(1), indices)
}

/// Rounds to the given number of decimals, ties to even.
pub(crate) fn round_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}
