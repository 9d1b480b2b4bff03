// network.rs
//
// Connectivity matrix estimation from parcellated timeseries.

use crate::error::{MacchiatoError, Result};
use crate::glasso::{graphical_lasso_cv, GraphicalLassoCvConfig};
use crate::matrix_ops::{
    all_finite, empirical_covariance, inverse_symmetric, map_symmetric_eigenvalues, symmetrize,
};
use crate::parcellate::ParcellatedTimeseries;
use log::{debug, warn};
use ndarray::Array2;
use std::fmt;
use std::str::FromStr;

/// Correlations are clamped to ±(1 - ε) before `atanh`.
pub const FISHER_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkMethod {
    Correlation,
    PartialCorrelation,
    DynamicTimeWarping,
    Tangent,
    Covariance,
    Precision,
    SparseInversePrecision,
    SparseInverseCovariance,
}

impl NetworkMethod {
    pub const ALL: [NetworkMethod; 8] = [
        NetworkMethod::Correlation,
        NetworkMethod::PartialCorrelation,
        NetworkMethod::DynamicTimeWarping,
        NetworkMethod::Tangent,
        NetworkMethod::Covariance,
        NetworkMethod::Precision,
        NetworkMethod::SparseInversePrecision,
        NetworkMethod::SparseInverseCovariance,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NetworkMethod::Correlation => "correlation",
            NetworkMethod::PartialCorrelation => "partial_correlation",
            NetworkMethod::DynamicTimeWarping => "dynamic_time_warping",
            NetworkMethod::Tangent => "tangent",
            NetworkMethod::Covariance => "covariance",
            NetworkMethod::Precision => "precision",
            NetworkMethod::SparseInversePrecision => "sparse_inverse_precision",
            NetworkMethod::SparseInverseCovariance => "sparse_inverse_covariance",
        }
    }

    pub fn is_supported(self) -> bool {
        self != NetworkMethod::DynamicTimeWarping
    }

    /// Parses a list of selectors; `All` anywhere expands to every method.
    /// Duplicates are dropped, first occurrence wins.
    pub fn parse_selection<S: AsRef<str>>(selectors: &[S]) -> Result<Vec<NetworkMethod>> {
        if selectors.iter().any(|s| s.as_ref().trim().eq_ignore_ascii_case("all")) {
            return Ok(Self::ALL.to_vec());
        }
        let mut methods = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let method: NetworkMethod = selector.as_ref().parse()?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        Ok(methods)
    }
}

impl FromStr for NetworkMethod {
    type Err = MacchiatoError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == normalized)
            .ok_or_else(|| MacchiatoError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for NetworkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityMatrix {
    pub matrix: Array2<f64>,
    pub method: NetworkMethod,
    pub fishers_transform_applied: bool,
}

impl ConnectivityMatrix {
    pub fn region_count(&self) -> usize {
        self.matrix.nrows()
    }
}

/// `atanh(r)` with `r` clamped away from ±1 so the result stays finite.
pub fn fisher_r_to_z(r: f64) -> f64 {
    r.clamp(-1.0 + FISHER_EPSILON, 1.0 - FISHER_EPSILON).atanh()
}

/// Stateless apart from its configuration; one instance is shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct NetworkEstimator {
    pub sparse_config: GraphicalLassoCvConfig,
}

impl NetworkEstimator {
    pub fn estimate(
        &self,
        timeseries: &ParcellatedTimeseries,
        method: NetworkMethod,
        apply_fishers_z: bool,
    ) -> Result<ConnectivityMatrix> {
        let (time_count, region_count) = (timeseries.time_count(), timeseries.region_count());
        if region_count == 0 {
            return Err(MacchiatoError::EmptyGraph);
        }
        if time_count < 2 {
            return Err(MacchiatoError::EstimationFailed(format!(
                "{} has {} time point(s); at least 2 are required",
                timeseries.source_scan_id, time_count
            )));
        }
        debug!(
            "Estimating {} for {} ({} time points x {} regions)",
            method, timeseries.source_scan_id, time_count, region_count
        );

        let data = &timeseries.data;
        let mut matrix = match method {
            NetworkMethod::Correlation => correlation(&empirical_covariance(data))?,
            NetworkMethod::Covariance => empirical_covariance(data),
            NetworkMethod::PartialCorrelation => {
                partial_correlation(&inverse_symmetric(&empirical_covariance(data))?)
            }
            NetworkMethod::Precision => inverse_symmetric(&empirical_covariance(data))?,
            NetworkMethod::SparseInverseCovariance | NetworkMethod::SparseInversePrecision => {
                let fit = graphical_lasso_cv(data, &self.sparse_config)?;
                debug!(
                    "Sparse inverse fit for {}: alpha={:.6}, {} iteration(s)",
                    timeseries.source_scan_id, fit.alpha, fit.iterations
                );
                if method == NetworkMethod::SparseInverseCovariance {
                    symmetrize(&fit.covariance)
                } else {
                    symmetrize(&fit.precision)
                }
            }
            NetworkMethod::Tangent => {
                self.estimate_tangent(&empirical_covariance(data), &Array2::eye(region_count))?
            }
            NetworkMethod::DynamicTimeWarping => {
                return Err(MacchiatoError::UnsupportedMethod(method.name().to_string()));
            }
        };

        if !all_finite(&matrix) {
            return Err(MacchiatoError::EstimationFailed(format!(
                "{} matrix for {} contains non-finite values",
                method, timeseries.source_scan_id
            )));
        }

        let fishers_transform_applied = apply_fishers_z && method == NetworkMethod::Correlation;
        if fishers_transform_applied {
            matrix.mapv_inplace(fisher_r_to_z);
        } else if apply_fishers_z {
            debug!("Fisher r-to-z only applies to correlation; leaving {} untouched", method);
        }

        Ok(ConnectivityMatrix {
            matrix,
            method,
            fishers_transform_applied,
        })
    }

    /// Tangent-space embedding `logm(W C W)`, `W = R^{-1/2}`. Single-scan
    /// estimation uses the identity as `R`.
    pub fn estimate_tangent(&self, covariance: &Array2<f64>, reference: &Array2<f64>) -> Result<Array2<f64>> {
        let n = covariance.nrows();
        if reference.dim() != (n, n) {
            return Err(MacchiatoError::DimensionMismatch {
                expected: n,
                found: reference.nrows(),
            });
        }
        let whitening = map_symmetric_eigenvalues(reference, |l| {
            if l > 0.0 { 1.0 / l.sqrt() } else { f64::NAN }
        })?;
        if !all_finite(&whitening) {
            return Err(MacchiatoError::EstimationFailed(
                "tangent reference is not positive definite".to_string(),
            ));
        }
        let whitened = symmetrize(&whitening.dot(covariance).dot(&whitening));
        let embedded = map_symmetric_eigenvalues(&whitened, |l| if l > 0.0 { l.ln() } else { f64::NAN })?;
        if !all_finite(&embedded) {
            return Err(MacchiatoError::EstimationFailed(
                "covariance is not positive definite; tangent embedding undefined".to_string(),
            ));
        }
        Ok(symmetrize(&embedded))
    }
}

fn correlation(covariance: &Array2<f64>) -> Result<Array2<f64>> {
    let std = covariance.diag().mapv(f64::sqrt);
    if let Some(region) = std.iter().position(|&s| s == 0.0 || !s.is_finite()) {
        return Err(MacchiatoError::EstimationFailed(format!(
            "region {} has zero variance; correlation undefined",
            region
        )));
    }
    let n = covariance.nrows();
    let mut corr = Array2::from_shape_fn((n, n), |(i, j)| covariance[[i, j]] / (std[i] * std[j]));
    corr.diag_mut().fill(1.0);
    Ok(corr)
}

fn partial_correlation(precision: &Array2<f64>) -> Array2<f64> {
    let n = precision.nrows();
    let mut partial = Array2::from_shape_fn((n, n), |(i, j)| {
        -precision[[i, j]] / (precision[[i, i]] * precision[[j, j]]).sqrt()
    });
    partial.diag_mut().fill(1.0);
    partial
}

/// Removes methods this build cannot estimate, warning for each one.
pub fn drop_unsupported(methods: Vec<NetworkMethod>) -> Vec<NetworkMethod> {
    let (supported, dropped): (Vec<_>, Vec<_>) = methods.into_iter().partition(|m| m.is_supported());
    for method in dropped {
        warn!("Network method {} is not supported and will be skipped.", method);
    }
    supported
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn synthetic(time_count: usize, region_count: usize, seed: u64) -> ParcellatedTimeseries {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let shared: Vec<f64> = (0..time_count).map(|_| normal.sample(&mut rng)).collect();
        let data = Array2::from_shape_fn((time_count, region_count), |(t, r)| {
            0.5 * shared[t] * (r as f64 + 1.0) / region_count as f64 + normal.sample(&mut rng)
        });
        ParcellatedTimeseries::new("sub-01_task-rest", data)
    }

    fn assert_symmetric(m: &Array2<f64>) {
        for i in 0..m.nrows() {
            for j in 0..m.ncols() {
                assert!((m[[i, j]] - m[[j, i]]).abs() < 1e-9, "asymmetric at ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn every_supported_method_yields_square_matrix() {
        let ts = synthetic(100, 5, 1);
        let estimator = NetworkEstimator::default();
        for method in NetworkMethod::ALL.iter().copied().filter(|m| m.is_supported()) {
            let result = estimator.estimate(&ts, method, false).unwrap();
            assert_eq!(result.matrix.dim(), (5, 5), "{}", method);
            assert_eq!(result.method, method);
        }
    }

    #[test]
    fn dense_estimates_are_symmetric() {
        let ts = synthetic(100, 5, 2);
        let estimator = NetworkEstimator::default();
        for method in [
            NetworkMethod::Correlation,
            NetworkMethod::Covariance,
            NetworkMethod::Precision,
            NetworkMethod::PartialCorrelation,
            NetworkMethod::Tangent,
        ] {
            assert_symmetric(&estimator.estimate(&ts, method, false).unwrap().matrix);
        }
    }

    #[test]
    fn correlation_diagonal_is_one() {
        let ts = synthetic(100, 5, 3);
        let result = NetworkEstimator::default()
            .estimate(&ts, NetworkMethod::Correlation, false)
            .unwrap();
        assert!(result.matrix.diag().iter().all(|&d| d == 1.0));
        assert!(!result.fishers_transform_applied);
    }

    #[test]
    fn fisher_transform_of_one_half() {
        assert!((fisher_r_to_z(0.5) - 0.5493).abs() < 1e-4);
        assert!(fisher_r_to_z(1.0).is_finite());
        assert!(fisher_r_to_z(-1.0).is_finite());
    }

    #[test]
    fn fisher_flag_applies_to_correlation_only() {
        let ts = synthetic(100, 5, 4);
        let estimator = NetworkEstimator::default();
        let corr = estimator.estimate(&ts, NetworkMethod::Correlation, true).unwrap();
        assert!(corr.fishers_transform_applied);
        assert!((corr.matrix[[0, 0]] - fisher_r_to_z(1.0)).abs() < 1e-12);

        let cov = estimator.estimate(&ts, NetworkMethod::Covariance, true).unwrap();
        assert!(!cov.fishers_transform_applied);
        let plain = estimator.estimate(&ts, NetworkMethod::Covariance, false).unwrap();
        assert_eq!(cov.matrix, plain.matrix);
    }

    #[test]
    fn dynamic_time_warping_is_unsupported() {
        let ts = synthetic(20, 3, 5);
        let err = NetworkEstimator::default()
            .estimate(&ts, NetworkMethod::DynamicTimeWarping, false)
            .unwrap_err();
        assert!(matches!(err, MacchiatoError::UnsupportedMethod(_)));
    }

    #[test]
    fn covariance_matches_sample_covariance() {
        let ts = synthetic(100, 5, 6);
        let result = NetworkEstimator::default()
            .estimate(&ts, NetworkMethod::Covariance, false)
            .unwrap();

        let means = ts.data.mean_axis(Axis(0)).unwrap();
        for i in 0..5 {
            for j in 0..5 {
                let mut acc = 0.0;
                for t in 0..100 {
                    acc += (ts.data[[t, i]] - means[i]) * (ts.data[[t, j]] - means[j]);
                }
                assert!((result.matrix[[i, j]] - acc / 100.0).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn precision_inverts_covariance() {
        let ts = synthetic(100, 4, 7);
        let estimator = NetworkEstimator::default();
        let cov = estimator.estimate(&ts, NetworkMethod::Covariance, false).unwrap().matrix;
        let prec = estimator.estimate(&ts, NetworkMethod::Precision, false).unwrap().matrix;
        let identity = cov.dot(&prec);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((identity[[i, j]] - expected).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn tangent_with_identity_reference_is_log_of_covariance() {
        let ts = synthetic(100, 4, 8);
        let estimator = NetworkEstimator::default();
        let cov = estimator.estimate(&ts, NetworkMethod::Covariance, false).unwrap().matrix;
        let tangent = estimator.estimate(&ts, NetworkMethod::Tangent, false).unwrap().matrix;
        let back = map_symmetric_eigenvalues(&tangent, f64::exp).unwrap();
        for (a, b) in cov.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn tangent_at_its_own_reference_is_zero() {
        let ts = synthetic(100, 4, 10);
        let estimator = NetworkEstimator::default();
        let cov = estimator.estimate(&ts, NetworkMethod::Covariance, false).unwrap().matrix;
        let tangent = estimator.estimate_tangent(&cov, &cov).unwrap();
        assert!(tangent.iter().all(|v| v.abs() < 1e-8));

        let err = estimator.estimate_tangent(&cov, &Array2::eye(3)).unwrap_err();
        assert_eq!(err.kind(), "DimensionMismatch");
        let err = estimator.estimate_tangent(&cov, &Array2::zeros((4, 4))).unwrap_err();
        assert_eq!(err.kind(), "EstimationFailed");
    }

    #[test]
    fn zero_variance_region_fails_correlation() {
        let mut ts = synthetic(50, 3, 9);
        ts.data.column_mut(1).fill(2.0);
        let err = NetworkEstimator::default()
            .estimate(&ts, NetworkMethod::Correlation, false)
            .unwrap_err();
        assert_eq!(err.kind(), "EstimationFailed");
    }

    #[test]
    fn empty_and_short_timeseries() {
        let estimator = NetworkEstimator::default();
        let empty = ParcellatedTimeseries::new("empty", Array2::zeros((10, 0)));
        assert!(matches!(
            estimator.estimate(&empty, NetworkMethod::Covariance, false),
            Err(MacchiatoError::EmptyGraph)
        ));
        let short = ParcellatedTimeseries::new("short", Array2::ones((1, 3)));
        assert_eq!(
            estimator
                .estimate(&short, NetworkMethod::Covariance, false)
                .unwrap_err()
                .kind(),
            "EstimationFailed"
        );
    }

    #[test]
    fn selectors_parse_case_insensitively() {
        assert_eq!("Correlation".parse::<NetworkMethod>().unwrap(), NetworkMethod::Correlation);
        assert_eq!(
            "sparse-inverse-precision".parse::<NetworkMethod>().unwrap(),
            NetworkMethod::SparseInversePrecision
        );
        assert!(matches!(
            "pearson".parse::<NetworkMethod>(),
            Err(MacchiatoError::UnsupportedMethod(_))
        ));
        assert_eq!(NetworkMethod::parse_selection(&["All"]).unwrap().len(), 8);
        assert_eq!(
            NetworkMethod::parse_selection(&["covariance", "covariance", "tangent"]).unwrap(),
            vec![NetworkMethod::Covariance, NetworkMethod::Tangent]
        );
        let supported = drop_unsupported(NetworkMethod::ALL.to_vec());
        assert_eq!(supported.len(), 7);
        assert!(!supported.contains(&NetworkMethod::DynamicTimeWarping));
    }
}
