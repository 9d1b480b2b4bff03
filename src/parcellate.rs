// parcellate.rs

use crate::atlas::ParcelLabelCatalog;
use crate::cifti::{self, CiftiFile, CiftiIntent};
use crate::error::{MacchiatoError, Result};
use log::{debug, info, warn};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Axis handed to the reducer: parcels replace the brainordinate columns.
pub const REDUCTION_AXIS: &str = "COLUMN";

/// One scan's region-reduced signal, (T time points x N regions).
#[derive(Debug, Clone)]
pub struct ParcellatedTimeseries {
    pub source_scan_id: String,
    pub data: Array2<f64>,
}

impl ParcellatedTimeseries {
    pub fn new(source_scan_id: impl Into<String>, data: Array2<f64>) -> Self {
        Self {
            source_scan_id: source_scan_id.into(),
            data,
        }
    }

    pub fn time_count(&self) -> usize {
        self.data.nrows()
    }

    pub fn region_count(&self) -> usize {
        self.data.ncols()
    }
}

/// Maps a dense scan plus a label atlas to a parcellated file at `output`.
///
/// Contract: on success a valid parcellated CIFTI file exists at `output`.
pub trait ParcelReducer: Sync {
    fn reduce(&self, scan: &Path, atlas: &Path, axis: &str, output: &Path) -> Result<()>;
}

/// Runs Connectome Workbench's `wb_command -cifti-parcellate`.
#[derive(Debug, Clone)]
pub struct WorkbenchReducer {
    pub wb_command: PathBuf,
}

impl WorkbenchReducer {
    pub fn new(wb_command: impl Into<PathBuf>) -> Self {
        Self {
            wb_command: wb_command.into(),
        }
    }
}

impl ParcelReducer for WorkbenchReducer {
    fn reduce(&self, scan: &Path, atlas: &Path, axis: &str, output: &Path) -> Result<()> {
        debug!(
            "{} -cifti-parcellate {} {} {} {}",
            self.wb_command.display(),
            scan.display(),
            atlas.display(),
            axis,
            output.display()
        );
        let result = Command::new(&self.wb_command)
            .arg("-cifti-parcellate")
            .arg(scan)
            .arg(atlas)
            .arg(axis)
            .arg(output)
            .output()
            .map_err(|e| MacchiatoError::ParcellationFailed {
                scan: scan.to_path_buf(),
                reason: format!("failed to launch {}: {}", self.wb_command.display(), e),
            })?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            debug!("wb_command: {}", line);
        }
        if !result.status.success() {
            return Err(MacchiatoError::ParcellationFailed {
                scan: scan.to_path_buf(),
                reason: format!(
                    "wb_command exited with {}: {}",
                    result.status,
                    stderr.lines().last().unwrap_or("").trim()
                ),
            });
        }
        Ok(())
    }
}

/// Atlas settings for a parcellation run, passed in explicitly at construction.
#[derive(Debug, Clone)]
pub struct ParcellationConfig {
    pub atlas_path: PathBuf,
    pub atlas_name: String,
}

/// Validates scans, runs the reducer and loads the parcel-by-time matrix.
pub struct ScanParcellator<R: ParcelReducer> {
    config: ParcellationConfig,
    catalog: Arc<ParcelLabelCatalog>,
    reducer: R,
}

impl<R: ParcelReducer> ScanParcellator<R> {
    pub fn new(config: ParcellationConfig, catalog: Arc<ParcelLabelCatalog>, reducer: R) -> Self {
        Self {
            config,
            catalog,
            reducer,
        }
    }

    /// `{output_dir}/{scan_prefix}_{atlas_name}.ptseries.nii`. Only dense
    /// time series (`.dtseries.nii`) are scans.
    pub fn parcellated_path(&self, scan_path: &Path, output_dir: &Path) -> Result<PathBuf> {
        let file_name = scan_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MacchiatoError::InvalidScanFormat {
                path: scan_path.to_path_buf(),
                reason: "path has no file name".to_string(),
            })?;
        let (prefix, suffix) = file_name.split_once('.').unwrap_or((file_name.as_str(), ""));
        let parcellated_suffix = match suffix {
            "dtseries.nii" => "ptseries.nii",
            other => {
                return Err(MacchiatoError::InvalidScanFormat {
                    path: scan_path.to_path_buf(),
                    reason: format!("unsupported file suffix '.{}'", other),
                })
            }
        };
        Ok(output_dir.join(format!(
            "{}_{}.{}",
            prefix, self.config.atlas_name, parcellated_suffix
        )))
    }

    /// Full reduction: validate the scan, invoke the reducer, validate and load its output.
    pub fn parcellate(&self, scan_path: &Path, output_dir: &Path) -> Result<ParcellatedTimeseries> {
        info!(
            "Parcellating {} with atlas {} ({})",
            scan_path.display(),
            self.config.atlas_name,
            self.config.atlas_path.display()
        );
        if !scan_path.is_file() {
            return Err(MacchiatoError::ScanNotFound(scan_path.to_path_buf()));
        }
        let scan = CiftiFile::open(scan_path).map_err(|e| MacchiatoError::InvalidScanFormat {
            path: scan_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        match scan.intent() {
            CiftiIntent::DenseSeries => {}
            other => {
                return Err(MacchiatoError::InvalidScanFormat {
                    path: scan_path.to_path_buf(),
                    reason: format!(
                        "expected a dense CIFTI series, found intent {:?} (code {})",
                        other,
                        other.code()
                    ),
                })
            }
        }

        debug!(
            "{} index maps: {:?}",
            scan_path.display(),
            cifti::index_map_types(&scan.xml).unwrap_or_default()
        );

        let output_path = self.parcellated_path(scan_path, output_dir)?;
        std::fs::create_dir_all(output_dir)?;
        self.reducer.reduce(
            scan_path,
            &self.config.atlas_path,
            REDUCTION_AXIS,
            &output_path,
        )?;

        self.load_parcellated(scan_path, &output_path)
    }

    /// Validates and loads an already parcellated file produced for `scan_path`.
    pub fn load_parcellated(
        &self,
        scan_path: &Path,
        parcellated_path: &Path,
    ) -> Result<ParcellatedTimeseries> {
        let failed = |reason: String| MacchiatoError::ParcellationFailed {
            scan: scan_path.to_path_buf(),
            reason,
        };
        if !parcellated_path.is_file() {
            return Err(failed(format!(
                "no parcellated output at {}",
                parcellated_path.display()
            )));
        }
        let parcellated = CiftiFile::open(parcellated_path).map_err(|e| failed(e.to_string()))?;
        if parcellated.intent() != CiftiIntent::ParcellatedSeries {
            return Err(MacchiatoError::InvalidScanFormat {
                path: parcellated_path.to_path_buf(),
                reason: format!(
                    "expected a parcellated series, found intent {:?} (code {})",
                    parcellated.intent(),
                    parcellated.intent().code()
                ),
            });
        }
        let data = parcellated
            .read_matrix(parcellated_path)
            .map_err(|e| failed(e.to_string()))?;

        let expected = self.catalog.count();
        if data.ncols() != expected {
            return Err(MacchiatoError::DimensionMismatch {
                expected,
                found: data.ncols(),
            });
        }
        if let Ok(names) = cifti::parse_parcel_names(&parcellated.xml) {
            if names.as_slice() != self.catalog.labels() {
                warn!(
                    "Parcel names in {} differ from the atlas label order; columns are used as stored.",
                    parcellated_path.display()
                );
            }
        }

        debug!(
            "Loaded parcellated timeseries {} ({} time points x {} regions)",
            parcellated_path.display(),
            data.nrows(),
            data.ncols()
        );
        Ok(ParcellatedTimeseries::new(
            scan_path.to_string_lossy().into_owned(),
            data,
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cifti::fixtures::{parcel_series_xml, write_cifti};

    /// Stands in for wb_command: writes a fixed parcellated series.
    pub(crate) struct FixedReducer {
        pub(crate) parcels: Vec<String>,
        pub(crate) data: Array2<f64>,
    }

    impl ParcelReducer for FixedReducer {
        fn reduce(&self, _scan: &Path, _atlas: &Path, axis: &str, output: &Path) -> Result<()> {
            assert_eq!(axis, REDUCTION_AXIS);
            let names: Vec<&str> = self.parcels.iter().map(String::as_str).collect();
            write_cifti(
                output,
                CiftiIntent::ParcellatedSeries,
                &parcel_series_xml(&names, self.data.nrows()),
                &self.data,
            );
            Ok(())
        }
    }

    /// A reducer that exits without producing anything.
    pub(crate) struct SilentReducer;

    impl ParcelReducer for SilentReducer {
        fn reduce(&self, _scan: &Path, _atlas: &Path, _axis: &str, _output: &Path) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cifti::fixtures::{dense_series_xml, label_xml, write_cifti};
    use ndarray::Array2;

    fn catalog(names: &[&str]) -> Arc<ParcelLabelCatalog> {
        let table: Vec<(i32, String)> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as i32 + 1, n.to_string()))
            .collect();
        Arc::new(ParcelLabelCatalog::from_label_table(&table))
    }

    fn config() -> ParcellationConfig {
        ParcellationConfig {
            atlas_path: PathBuf::from("/atlases/Glasser.dlabel.nii"),
            atlas_name: "glasser".to_string(),
        }
    }

    fn write_dense_scan(path: &Path, timepoints: usize) {
        write_cifti(
            path,
            CiftiIntent::DenseSeries,
            &dense_series_xml(timepoints),
            &Array2::zeros((timepoints, 8)),
        );
    }

    #[test]
    fn derives_parcellated_path_from_scan_name() {
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let path = parcellator
            .parcellated_path(
                Path::new("/data/sub-01/rfMRI_REST1_LR_Atlas_hp2000_clean.dtseries.nii"),
                Path::new("/out/sub-01"),
            )
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/out/sub-01/rfMRI_REST1_LR_Atlas_hp2000_clean_glasser.ptseries.nii")
        );
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator
            .parcellated_path(Path::new("/data/bold.nii.gz"), Path::new("/out"))
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");
    }

    #[test]
    fn missing_scan_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator
            .parcellate(&dir.path().join("missing.dtseries.nii"), dir.path())
            .unwrap_err();
        assert!(matches!(err, MacchiatoError::ScanNotFound(_)));
    }

    #[test]
    fn malformed_scan_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        std::fs::write(&scan, b"definitely not cifti").unwrap();
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator.parcellate(&scan, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");
    }

    #[test]
    fn label_file_is_not_a_scan() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("atlas.dtseries.nii");
        write_cifti(
            &scan,
            CiftiIntent::DenseLabels,
            &label_xml(&[(1, "A")]),
            &Array2::zeros((1, 8)),
        );
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator.parcellate(&scan, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");
    }

    #[test]
    fn reducer_without_output_fails_parcellation() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        write_dense_scan(&scan, 12);
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator.parcellate(&scan, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, MacchiatoError::ParcellationFailed { .. }));
    }

    #[test]
    fn loads_reduced_timeseries() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        write_dense_scan(&scan, 4);
        let data = Array2::from_shape_fn((4, 3), |(t, r)| (t * 3 + r) as f64);
        let reducer = FixedReducer {
            parcels: vec!["A".into(), "B".into(), "C".into()],
            data: data.clone(),
        };
        let parcellator = ScanParcellator::new(config(), catalog(&["A", "B", "C"]), reducer);
        let out_dir = dir.path().join("out");
        let ts = parcellator.parcellate(&scan, &out_dir).unwrap();

        assert_eq!(ts.time_count(), 4);
        assert_eq!(ts.region_count(), 3);
        assert_eq!(ts.data, data);
        assert!(out_dir.join("rest_glasser.ptseries.nii").is_file());
    }

    #[test]
    fn dense_scalars_are_not_scans() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        write_cifti(
            &scan,
            CiftiIntent::DenseScalars,
            &dense_series_xml(1),
            &Array2::zeros((1, 8)),
        );
        let parcellator = ScanParcellator::new(config(), catalog(&["A"]), SilentReducer);
        let err = parcellator.parcellate(&scan, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");

        let err = parcellator
            .parcellated_path(Path::new("/data/rest.dscalar.nii"), dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");
    }

    #[test]
    fn dense_file_at_parcellated_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        let parcellator = ScanParcellator::new(config(), catalog(&["A", "B", "C"]), SilentReducer);
        let parcellated = parcellator.parcellated_path(&scan, dir.path()).unwrap();
        // right column count, wrong kind of file
        write_cifti(
            &parcellated,
            CiftiIntent::DenseSeries,
            &dense_series_xml(4),
            &Array2::ones((4, 3)),
        );
        let err = parcellator.load_parcellated(&scan, &parcellated).unwrap_err();
        assert_eq!(err.kind(), "InvalidScanFormat");
    }

    #[test]
    fn region_count_must_match_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("rest.dtseries.nii");
        write_dense_scan(&scan, 4);
        let reducer = FixedReducer {
            parcels: vec!["A".into(), "B".into()],
            data: Array2::ones((4, 2)),
        };
        let parcellator = ScanParcellator::new(config(), catalog(&["A", "B", "C"]), reducer);
        let err = parcellator.parcellate(&scan, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            MacchiatoError::DimensionMismatch { expected: 3, found: 2 }
        ));
    }
}
