// error.rs

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning one scan into network matrices and graph metrics.
///
/// Every variant is fatal for the scan being processed. Nothing is retried
/// locally; the pipeline attaches the scan and stage (see [`ScanFailure`]) and
/// moves on to the next scan.
#[derive(Debug, Error)]
pub enum MacchiatoError {
    #[error("invalid atlas file {path}: {reason}")]
    InvalidAtlasFormat { path: PathBuf, reason: String },

    #[error("scan file does not exist: {0}")]
    ScanNotFound(PathBuf),

    #[error("invalid scan file {path}: {reason}")]
    InvalidScanFormat { path: PathBuf, reason: String },

    #[error("parcellation of {scan} failed: {reason}")]
    ParcellationFailed { scan: PathBuf, reason: String },

    #[error("dimension mismatch: expected {expected} regions, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("unsupported network method '{0}'")]
    UnsupportedMethod(String),

    #[error("network estimation failed: {0}")]
    EstimationFailed(String),

    #[error("unsupported graph metric '{0}'")]
    UnsupportedMetric(String),

    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("failed to write result '{dataset}': {reason}")]
    Output { dataset: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = MacchiatoError> = std::result::Result<T, E>;

impl MacchiatoError {
    /// Short machine-friendly name of the error kind, used in batch failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MacchiatoError::InvalidAtlasFormat { .. } => "InvalidAtlasFormat",
            MacchiatoError::ScanNotFound(_) => "ScanNotFound",
            MacchiatoError::InvalidScanFormat { .. } => "InvalidScanFormat",
            MacchiatoError::ParcellationFailed { .. } => "ParcellationFailed",
            MacchiatoError::DimensionMismatch { .. } => "DimensionMismatch",
            MacchiatoError::UnsupportedMethod(_) => "UnsupportedMethod",
            MacchiatoError::EstimationFailed(_) => "EstimationFailed",
            MacchiatoError::UnsupportedMetric(_) => "UnsupportedMetric",
            MacchiatoError::EmptyGraph => "EmptyGraph",
            MacchiatoError::Output { .. } => "Output",
            MacchiatoError::Io(_) => "Io",
        }
    }
}

impl From<ndarray_linalg::error::LinalgError> for MacchiatoError {
    fn from(e: ndarray_linalg::error::LinalgError) -> Self {
        MacchiatoError::EstimationFailed(format!("linear algebra error: {}", e))
    }
}

/// The step of the per-scan pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parcellation,
    NetworkEstimation,
    GraphMetric,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parcellation => "parcellation",
            Stage::NetworkEstimation => "network estimation",
            Stage::GraphMetric => "graph metric",
            Stage::Output => "output",
        };
        f.write_str(name)
    }
}

/// A scan-attributed failure: which scan, which stage, which error.
#[derive(Debug, Error)]
#[error("scan {scan} failed during {stage} [{kind}]: {source}", kind = .source.kind())]
pub struct ScanFailure {
    pub scan: PathBuf,
    pub stage: Stage,
    #[source]
    pub source: MacchiatoError,
}

impl ScanFailure {
    pub fn new(scan: impl Into<PathBuf>, stage: Stage, source: MacchiatoError) -> Self {
        Self {
            scan: scan.into(),
            stage,
            source,
        }
    }
}
