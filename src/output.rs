// output.rs
//
// Result sinks: per-scan TSV files, or one pre-allocated NumPy array per
// dataset shared by all workers.

use crate::discovery::ScanIdentity;
use crate::error::{MacchiatoError, Result};
use crate::graph::{GraphMetricResult, MetricValues};
use crate::network::ConnectivityMatrix;
use log::{debug, info};
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGNMENT: usize = 64;
const F32_BYTES: u64 = 4;

/// Borrowed values of one result, as handed to a sink.
#[derive(Debug, Clone, Copy)]
pub enum ResultValues<'a> {
    Vector(ArrayView1<'a, f64>),
    Matrix(ArrayView2<'a, f64>),
}

impl<'a> ResultValues<'a> {
    fn shape(&self) -> Vec<usize> {
        match self {
            ResultValues::Vector(v) => vec![v.len()],
            ResultValues::Matrix(m) => vec![m.nrows(), m.ncols()],
        }
    }
}

impl<'a> From<&'a ConnectivityMatrix> for ResultValues<'a> {
    fn from(matrix: &'a ConnectivityMatrix) -> Self {
        ResultValues::Matrix(matrix.matrix.view())
    }
}

impl<'a> From<&'a GraphMetricResult> for ResultValues<'a> {
    fn from(result: &'a GraphMetricResult) -> Self {
        match &result.values {
            MetricValues::NodeVector(v) => ResultValues::Vector(v.view()),
            MetricValues::EdgeMatrix(m) => ResultValues::Matrix(m.view()),
        }
    }
}

/// Destination of per-scan results. Shared by all workers.
///
/// A scan is recorded whole or not at all: the pipeline only calls `record`
/// once every result of the scan has been computed, and calls `discard` for
/// the datasets already written if a later `record` of the same scan fails.
pub trait ResultSink: Sync {
    /// Stores `values` under `dataset` for the scan at position `index` of the run.
    fn record(&self, index: usize, scan: &ScanIdentity, dataset: &str, values: ResultValues<'_>) -> Result<()>;

    /// Removes whatever was written for `datasets` of an incomplete scan.
    fn discard(&self, _index: usize, _scan: &ScanIdentity, _datasets: &[String]) -> Result<()> {
        Ok(())
    }

    /// Called once after the run; `completed[i]` is true when scan `i` was
    /// recorded in full.
    fn finish(&self, _completed: &[bool]) -> Result<()> {
        Ok(())
    }
}

/// Writes `{root}/sub-<s>[/ses-<t>]/{fmri_name}_{atlas_name}_{dataset}.tsv`.
pub struct FlatFileSink {
    root: PathBuf,
    atlas_name: String,
    labels: Vec<String>,
}

impl FlatFileSink {
    pub fn new(root: impl Into<PathBuf>, atlas_name: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            root: root.into(),
            atlas_name: atlas_name.into(),
            labels,
        }
    }

    pub fn path_for(&self, scan: &ScanIdentity, dataset: &str) -> PathBuf {
        scan.output_dir(&self.root)
            .join(format!("{}_{}_{}.tsv", scan.fmri_name, self.atlas_name, dataset))
    }

    fn label(&self, idx: usize) -> String {
        self.labels
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("region_{}", idx + 1))
    }

    fn write_values<W: Write>(&self, writer: &mut W, values: &ResultValues<'_>) -> std::io::Result<()> {
        match values {
            ResultValues::Vector(v) => {
                writeln!(writer, "Region\tValue")?;
                for (idx, value) in v.iter().enumerate() {
                    writeln!(writer, "{}\t{:.6}", self.label(idx), value)?;
                }
            }
            ResultValues::Matrix(m) => {
                write!(writer, "Region")?;
                for col in 0..m.ncols() {
                    write!(writer, "\t{}", self.label(col))?;
                }
                writeln!(writer)?;
                for (row_idx, row) in m.rows().into_iter().enumerate() {
                    write!(writer, "{}", self.label(row_idx))?;
                    for value in row.iter() {
                        write!(writer, "\t{:.6}", value)?;
                    }
                    writeln!(writer)?;
                }
            }
        }
        writer.flush()
    }
}

impl ResultSink for FlatFileSink {
    fn record(&self, _index: usize, scan: &ScanIdentity, dataset: &str, values: ResultValues<'_>) -> Result<()> {
        let path = self.path_for(scan, dataset);
        let output_error = |e: std::io::Error| MacchiatoError::Output {
            dataset: dataset.to_string(),
            reason: format!("{}: {}", path.display(), e),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(output_error)?;
        }
        let mut writer = File::create(&path).map(BufWriter::new).map_err(output_error)?;
        self.write_values(&mut writer, &values).map_err(output_error)?;
        debug!("Wrote {} for {} to {}", dataset, scan, path.display());
        Ok(())
    }

    fn discard(&self, _index: usize, scan: &ScanIdentity, datasets: &[String]) -> Result<()> {
        for dataset in datasets {
            let path = self.path_for(scan, dataset);
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed incomplete result {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MacchiatoError::Output {
                        dataset: dataset.clone(),
                        reason: format!("{}: {}", path.display(), e),
                    })
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateManifest {
    pub atlas_path: PathBuf,
    pub atlas_name: String,
    pub labels: Vec<String>,
    pub scans: Vec<PathBuf>,
    /// Per scan index: whether every dataset row holds a computed result.
    /// Rows of incomplete scans are zero and must be ignored.
    pub completed: Vec<bool>,
    /// Dataset name to array shape, leading axis = scan index.
    pub datasets: BTreeMap<String, Vec<usize>>,
}

impl AggregateManifest {
    fn write(&self, path: &Path) -> Result<()> {
        let output_error = |reason: String| MacchiatoError::Output {
            dataset: "manifest".to_string(),
            reason: format!("{}: {}", path.display(), reason),
        };
        let mut writer = File::create(path)
            .map(BufWriter::new)
            .map_err(|e| output_error(e.to_string()))?;
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| output_error(e.to_string()))?;
        writer.flush().map_err(|e| output_error(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct AggregateDataset {
    path: PathBuf,
    data_offset: u64,
    /// Shape of one scan's entry.
    entry_shape: Vec<usize>,
}

impl AggregateDataset {
    fn entry_len(&self) -> usize {
        self.entry_shape.iter().product()
    }
}

/// One `.npy` array per dataset, shaped `(scan_count, ...)` and zero-filled
/// up front. Workers write disjoint scan rows through their own file handles.
pub struct AggregateSink {
    scan_count: usize,
    datasets: BTreeMap<String, AggregateDataset>,
    manifest: AggregateManifest,
    manifest_path: PathBuf,
}

fn npy_header(shape: &[usize]) -> Vec<u8> {
    let dims = match shape {
        [single] => format!("({},)", single),
        _ => format!(
            "({})",
            shape.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut dict = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}", dims);
    // magic + version + u16 length + dict + newline, padded to the alignment
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (NPY_ALIGNMENT - unpadded % NPY_ALIGNMENT) % NPY_ALIGNMENT;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut header = Vec::with_capacity(unpadded + padding);
    header.extend_from_slice(NPY_MAGIC);
    header.extend_from_slice(&[1, 0]);
    header.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    header.extend_from_slice(dict.as_bytes());
    header
}

impl AggregateSink {
    /// Creates every dataset file and the manifest under `output_dir`.
    ///
    /// `datasets` maps each dataset name to the shape of a single scan's entry
    /// (`[N]` or `[N, N]`).
    pub fn create(
        output_dir: &Path,
        atlas_path: &Path,
        atlas_name: &str,
        labels: &[String],
        scans: &[&ScanIdentity],
        datasets: &[(String, Vec<usize>)],
    ) -> Result<Self> {
        let output_error = |dataset: &str, e: std::io::Error| MacchiatoError::Output {
            dataset: dataset.to_string(),
            reason: e.to_string(),
        };
        fs::create_dir_all(output_dir).map_err(|e| output_error("*", e))?;

        let scan_count = scans.len();
        let mut created = BTreeMap::new();
        let mut manifest_shapes = BTreeMap::new();
        for (name, entry_shape) in datasets {
            let mut shape = vec![scan_count];
            shape.extend_from_slice(entry_shape);
            let header = npy_header(&shape);
            let path = output_dir.join(format!("{}_{}.npy", atlas_name, name));

            let mut file = File::create(&path).map_err(|e| output_error(name, e))?;
            file.write_all(&header).map_err(|e| output_error(name, e))?;
            let data_len = shape.iter().product::<usize>() as u64 * F32_BYTES;
            file.set_len(header.len() as u64 + data_len)
                .map_err(|e| output_error(name, e))?;
            debug!("Allocated {} with shape {:?}", path.display(), shape);

            created.insert(
                name.clone(),
                AggregateDataset {
                    path,
                    data_offset: header.len() as u64,
                    entry_shape: entry_shape.clone(),
                },
            );
            manifest_shapes.insert(name.clone(), shape);
        }

        let manifest = AggregateManifest {
            atlas_path: atlas_path.to_path_buf(),
            atlas_name: atlas_name.to_string(),
            labels: labels.to_vec(),
            scans: scans.iter().map(|s| s.path.clone()).collect(),
            completed: vec![false; scan_count],
            datasets: manifest_shapes,
        };
        let manifest_path = output_dir.join(format!("{}_manifest.json", atlas_name));
        manifest.write(&manifest_path)?;
        info!(
            "Created {} aggregate dataset(s) for {} scans in {}.",
            created.len(),
            scan_count,
            output_dir.display()
        );

        Ok(Self {
            scan_count,
            datasets: created,
            manifest,
            manifest_path,
        })
    }

    fn write_row(&self, target: &AggregateDataset, index: usize, bytes: &[u8]) -> std::io::Result<()> {
        let offset = target.data_offset + (index * target.entry_len()) as u64 * F32_BYTES;
        let mut file = OpenOptions::new().write(true).open(&target.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }
}

impl ResultSink for AggregateSink {
    fn record(&self, index: usize, scan: &ScanIdentity, dataset: &str, values: ResultValues<'_>) -> Result<()> {
        let output_error = |reason: String| MacchiatoError::Output {
            dataset: dataset.to_string(),
            reason,
        };
        let target = self
            .datasets
            .get(dataset)
            .ok_or_else(|| output_error("dataset was not allocated".to_string()))?;
        if index >= self.scan_count {
            return Err(output_error(format!(
                "scan index {} out of range for {} scans",
                index, self.scan_count
            )));
        }
        if values.shape() != target.entry_shape {
            return Err(output_error(format!(
                "shape {:?} does not match allocated entry shape {:?}",
                values.shape(),
                target.entry_shape
            )));
        }

        let mut bytes = Vec::with_capacity(target.entry_len() * F32_BYTES as usize);
        let mut push = |v: f64| bytes.extend_from_slice(&(v as f32).to_le_bytes());
        match values {
            ResultValues::Vector(v) => v.iter().copied().for_each(&mut push),
            ResultValues::Matrix(m) => m.iter().copied().for_each(&mut push),
        }

        self.write_row(target, index, &bytes)
            .map_err(|e| output_error(e.to_string()))?;
        debug!("Wrote {} for {} at index {}", dataset, scan, index);
        Ok(())
    }

    fn discard(&self, index: usize, scan: &ScanIdentity, datasets: &[String]) -> Result<()> {
        if index >= self.scan_count {
            return Ok(());
        }
        for dataset in datasets {
            if let Some(target) = self.datasets.get(dataset) {
                let zeros = vec![0u8; target.entry_len() * F32_BYTES as usize];
                self.write_row(target, index, &zeros)
                    .map_err(|e| MacchiatoError::Output {
                        dataset: dataset.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }
        debug!("Cleared {} dataset row(s) of {} at index {}", datasets.len(), scan, index);
        Ok(())
    }

    fn finish(&self, completed: &[bool]) -> Result<()> {
        if completed.len() != self.scan_count {
            return Err(MacchiatoError::Output {
                dataset: "manifest".to_string(),
                reason: format!(
                    "{} completion flags for {} scans",
                    completed.len(),
                    self.scan_count
                ),
            });
        }
        let manifest = AggregateManifest {
            completed: completed.to_vec(),
            ..self.manifest.clone()
        };
        manifest.write(&self.manifest_path)?;
        info!(
            "Manifest {} marks {} of {} scan(s) complete.",
            self.manifest_path.display(),
            completed.iter().filter(|&&c| c).count(),
            self.scan_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};
    use std::io::Read;

    fn scan(path: &str) -> ScanIdentity {
        ScanIdentity::from_path(path)
    }

    fn read_f32s(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn npy_header_is_aligned_and_describes_shape() {
        let header = npy_header(&[3, 5, 5]);
        assert_eq!(header.len() % NPY_ALIGNMENT, 0);
        assert_eq!(&header[..6], NPY_MAGIC);
        let text = String::from_utf8_lossy(&header[10..]);
        assert!(text.contains("'shape': (3, 5, 5)"));
        assert!(text.ends_with('\n'));
        assert!(String::from_utf8_lossy(&npy_header(&[4])).contains("'shape': (4,)"));
    }

    #[test]
    fn flat_sink_writes_labelled_tables() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlatFileSink::new(dir.path(), "Glasser", vec!["A".to_string(), "B".to_string()]);
        let scan = scan("/in/sub-01/ses-02/func/sub-01_ses-02_task-rest_bold.dtseries.nii");

        let matrix = array![[1.0, 0.25], [0.25, 1.0]];
        sink.record(0, &scan, "correlation", ResultValues::Matrix(matrix.view()))
            .unwrap();
        let path = dir
            .path()
            .join("sub-01/ses-02/sub-01_ses-02_task-rest_bold_Glasser_correlation.tsv");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Region\tA\tB\nA\t1.000000\t0.250000\nB\t0.250000\t1.000000\n");

        let vector = Array1::from(vec![0.5, 1.5]);
        sink.record(0, &scan, "correlation_strength", ResultValues::Vector(vector.view()))
            .unwrap();
        let text = fs::read_to_string(sink.path_for(&scan, "correlation_strength")).unwrap();
        assert_eq!(text, "Region\tValue\nA\t0.500000\nB\t1.500000\n");
    }

    #[test]
    fn aggregate_sink_writes_rows_at_scan_index() {
        let dir = tempfile::tempdir().unwrap();
        let first = scan("/in/sub-01/rest1.dtseries.nii");
        let second = scan("/in/sub-02/rest1.dtseries.nii");
        let labels = vec!["A".to_string(), "B".to_string()];
        let sink = AggregateSink::create(
            dir.path(),
            Path::new("/atlas/Glasser.dlabel.nii"),
            "Glasser",
            &labels,
            &[&first, &second],
            &[
                ("covariance".to_string(), vec![2, 2]),
                ("covariance_strength".to_string(), vec![2]),
            ],
        )
        .unwrap();

        let matrix = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        sink.record(1, &second, "covariance", ResultValues::Matrix(matrix.view()))
            .unwrap();

        let mut bytes = Vec::new();
        File::open(dir.path().join("Glasser_covariance.npy"))
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let header_len = npy_header(&[2, 2, 2]).len();
        assert_eq!(bytes.len(), header_len + 8 * 4);
        assert_eq!(
            read_f32s(&bytes[header_len..]),
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0]
        );

        let manifest: AggregateManifest = serde_json::from_str(
            &fs::read_to_string(dir.path().join("Glasser_manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.labels, labels);
        assert_eq!(manifest.scans.len(), 2);
        assert_eq!(manifest.completed, vec![false, false]);
        assert_eq!(manifest.datasets["covariance"], vec![2, 2, 2]);
        assert_eq!(manifest.datasets["covariance_strength"], vec![2, 2]);
    }

    #[test]
    fn aggregate_discard_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let first = scan("/in/sub-01/rest.dtseries.nii");
        let second = scan("/in/sub-02/rest.dtseries.nii");
        let sink = AggregateSink::create(
            dir.path(),
            Path::new("atlas.dlabel.nii"),
            "atlas",
            &[],
            &[&first, &second],
            &[("strength".to_string(), vec![2])],
        )
        .unwrap();
        let values = Array1::from(vec![3.0, 4.0]);
        sink.record(0, &first, "strength", ResultValues::Vector(values.view()))
            .unwrap();
        sink.record(1, &second, "strength", ResultValues::Vector(values.view()))
            .unwrap();
        sink.discard(1, &second, &["strength".to_string()]).unwrap();
        sink.finish(&[true, false]).unwrap();

        let bytes = fs::read(dir.path().join("atlas_strength.npy")).unwrap();
        let header_len = npy_header(&[2, 2]).len();
        assert_eq!(read_f32s(&bytes[header_len..]), vec![3.0, 4.0, 0.0, 0.0]);
        let manifest: AggregateManifest = serde_json::from_str(
            &fs::read_to_string(dir.path().join("atlas_manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.completed, vec![true, false]);
        assert_eq!(manifest.datasets["strength"], vec![2, 2]);

        assert_eq!(sink.finish(&[true]).unwrap_err().kind(), "Output");
    }

    #[test]
    fn flat_discard_removes_written_tables() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlatFileSink::new(dir.path(), "atlas", Vec::new());
        let only = scan("/in/sub-01/func/sub-01_task-rest_bold.dtseries.nii");
        let values = Array1::from(vec![1.0]);
        sink.record(0, &only, "covariance_strength", ResultValues::Vector(values.view()))
            .unwrap();
        assert!(sink.path_for(&only, "covariance_strength").is_file());

        sink.discard(
            0,
            &only,
            &["covariance_strength".to_string(), "never_written".to_string()],
        )
        .unwrap();
        assert!(!sink.path_for(&only, "covariance_strength").exists());
    }

    #[test]
    fn aggregate_sink_rejects_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let only = scan("/in/sub-01/rest.dtseries.nii");
        let sink = AggregateSink::create(
            dir.path(),
            Path::new("atlas.dlabel.nii"),
            "atlas",
            &[],
            &[&only],
            &[("strength".to_string(), vec![3])],
        )
        .unwrap();
        let short = Array1::from(vec![1.0, 2.0]);
        let long = Array1::from(vec![1.0, 2.0, 3.0]);

        for (index, dataset, values) in [
            (0, "strength", short.view()),
            (1, "strength", long.view()),
            (0, "clustering", long.view()),
        ] {
            let err = sink
                .record(index, &only, dataset, ResultValues::Vector(values))
                .unwrap_err();
            assert_eq!(err.kind(), "Output");
        }
        sink.record(0, &only, "strength", ResultValues::Vector(long.view()))
            .unwrap();
    }
}
