// pipeline.rs
//
// Per-scan processing (parcellate, estimate, derive metrics, record) and the
// parallel dispatch over a discovered batch.

use crate::discovery::{ScanBatch, ScanIdentity};
use crate::error::{MacchiatoError, Result, ScanFailure, Stage};
use crate::graph::{GraphMetric, GraphMetricEngine, GraphMetricResult, ResultShape};
use crate::network::{drop_unsupported, ConnectivityMatrix, NetworkEstimator, NetworkMethod};
use crate::output::{ResultSink, ResultValues};
use crate::parcellate::{ParcelReducer, ParcellatedTimeseries, ScanParcellator};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Dataset name under which a result is recorded: the method name, or
/// `{method}_{metric}` for graph metrics.
pub fn dataset_name(method: NetworkMethod, metric: Option<GraphMetric>) -> String {
    match metric {
        Some(metric) => format!("{}_{}", method.name(), metric.name()),
        None => method.name().to_string(),
    }
}

/// What to compute for every scan, resolved once from the command line.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub methods: Vec<NetworkMethod>,
    pub metrics: Vec<GraphMetric>,
    pub apply_fishers_z: bool,
    /// Re-run parcellation even when its output already exists.
    pub overwrite: bool,
    pub output_dir: PathBuf,
}

impl RunPlan {
    pub fn resolve<S: AsRef<str>>(
        method_selectors: &[S],
        metric_selectors: &[S],
        apply_fishers_z: bool,
        overwrite: bool,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let expands_all = method_selectors
            .iter()
            .any(|s| s.as_ref().trim().eq_ignore_ascii_case("all"));
        let mut methods = NetworkMethod::parse_selection(method_selectors)?;
        if expands_all {
            methods = drop_unsupported(methods);
        } else if let Some(unsupported) = methods.iter().find(|m| !m.is_supported()) {
            return Err(MacchiatoError::UnsupportedMethod(unsupported.name().to_string()));
        }
        if methods.is_empty() {
            return Err(MacchiatoError::UnsupportedMethod(
                "no network method selected".to_string(),
            ));
        }
        let metrics = GraphMetric::parse_selection(metric_selectors)?;

        Ok(Self {
            methods,
            metrics,
            apply_fishers_z,
            overwrite,
            output_dir: output_dir.into(),
        })
    }

    /// Every dataset this plan records, with the per-scan entry shape for N regions.
    pub fn datasets(&self, region_count: usize) -> Vec<(String, Vec<usize>)> {
        let mut datasets = Vec::new();
        for &method in &self.methods {
            datasets.push((dataset_name(method, None), vec![region_count, region_count]));
            for &metric in &self.metrics {
                let shape = match metric.shape() {
                    ResultShape::PerNodeVector => vec![region_count],
                    ResultShape::PerEdgeMatrix => vec![region_count, region_count],
                };
                datasets.push((dataset_name(method, Some(metric)), shape));
            }
        }
        datasets
    }
}

/// One computed result of a scan, held until the whole scan has succeeded.
#[derive(Debug)]
enum ScanResult {
    Network(ConnectivityMatrix),
    Metric(GraphMetricResult),
}

impl ScanResult {
    fn values(&self) -> ResultValues<'_> {
        match self {
            ScanResult::Network(matrix) => matrix.into(),
            ScanResult::Metric(result) => result.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub recorded: usize,
    pub failures: Vec<ScanFailure>,
}

impl ScanOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub scan_count: usize,
    pub recorded: usize,
    pub failures: Vec<ScanFailure>,
}

impl RunSummary {
    pub fn failed_scans(&self) -> usize {
        let mut scans: Vec<&Path> = self.failures.iter().map(|f| f.scan.as_path()).collect();
        scans.sort();
        scans.dedup();
        scans.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ScanPipeline<'a, R: ParcelReducer> {
    pub parcellator: &'a ScanParcellator<R>,
    pub estimator: &'a NetworkEstimator,
    pub engine: &'a GraphMetricEngine,
    pub plan: &'a RunPlan,
    pub sink: &'a dyn ResultSink,
}

impl<'a, R: ParcelReducer> ScanPipeline<'a, R> {
    fn timeseries_for(&self, scan: &ScanIdentity, output_dir: &Path) -> Result<ParcellatedTimeseries> {
        let parcellated = self.parcellator.parcellated_path(&scan.path, output_dir)?;
        if parcellated.is_file() {
            if self.plan.overwrite {
                debug!("Removing stale parcellated output {}", parcellated.display());
            } else {
                match self.parcellator.load_parcellated(&scan.path, &parcellated) {
                    Ok(timeseries) => {
                        info!("Reusing parcellated output {}", parcellated.display());
                        return Ok(timeseries);
                    }
                    Err(e) => warn!(
                        "Existing parcellated output {} is unusable ({}); parcellating again.",
                        parcellated.display(),
                        e
                    ),
                }
            }
            std::fs::remove_file(&parcellated)?;
        }
        self.parcellator.parcellate(&scan.path, output_dir)
    }

    /// Every planned matrix and metric of one scan, in recording order.
    fn compute_scan(&self, scan: &ScanIdentity) -> Result<Vec<(String, ScanResult)>, ScanFailure> {
        let fail = |stage: Stage, e: MacchiatoError| ScanFailure::new(&scan.path, stage, e);
        let output_dir = scan.output_dir(&self.plan.output_dir);
        let timeseries = self
            .timeseries_for(scan, &output_dir)
            .map_err(|e| fail(Stage::Parcellation, e))?;

        let mut results = Vec::new();
        for &method in &self.plan.methods {
            let matrix = self
                .estimator
                .estimate(&timeseries, method, self.plan.apply_fishers_z)
                .map_err(|e| fail(Stage::NetworkEstimation, e))?;
            let metrics = self
                .plan
                .metrics
                .iter()
                .map(|&metric| {
                    self.engine
                        .compute(&matrix, metric)
                        .map(|result| (dataset_name(method, Some(metric)), ScanResult::Metric(result)))
                        .map_err(|e| fail(Stage::GraphMetric, e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            results.push((dataset_name(method, None), ScanResult::Network(matrix)));
            results.extend(metrics);
        }
        Ok(results)
    }

    /// Computes every planned method and metric for one scan, then records
    /// them. Any failure leaves the scan with no recorded result.
    pub fn process_scan(&self, index: usize, scan: &ScanIdentity) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let results = match self.compute_scan(scan) {
            Ok(results) => results,
            Err(failure) => {
                outcome.failures.push(failure);
                return outcome;
            }
        };

        let mut written = Vec::with_capacity(results.len());
        for (dataset, result) in &results {
            written.push(dataset.clone());
            if let Err(e) = self.sink.record(index, scan, dataset, result.values()) {
                outcome.failures.push(ScanFailure::new(&scan.path, Stage::Output, e));
                if let Err(e) = self.sink.discard(index, scan, &written) {
                    outcome.failures.push(ScanFailure::new(&scan.path, Stage::Output, e));
                }
                return outcome;
            }
        }
        outcome.recorded = written.len();
        debug!("Recorded {} result(s) for {}", outcome.recorded, scan);
        outcome
    }

    /// Processes every scan of the batch in parallel. Scan indices follow the
    /// batch order; failures are logged and collected, never fatal to siblings.
    pub fn run(&self, batch: &ScanBatch) -> anyhow::Result<RunSummary> {
        if let ScanBatch::Combined(groups) = batch {
            warn!(
                "Combining resting scans is not implemented; processing the {} scans of {} group(s) individually.",
                batch.len(),
                groups.len()
            );
        }
        let scans = batch.scans();
        info!(
            "Processing {} scan(s) with methods {:?} and metrics {:?}",
            scans.len(),
            self.plan.methods.iter().map(|m| m.name()).collect::<Vec<_>>(),
            self.plan.metrics.iter().map(|m| m.name()).collect::<Vec<_>>()
        );

        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} scans ({percent}%) ETA: {eta}",
            )
            .map_err(|e| anyhow::anyhow!("Failed to create progress bar style: {}", e))?
            .progress_chars("=> ");
        let pb = ProgressBar::new(scans.len() as u64).with_style(style);

        let outcomes: Vec<ScanOutcome> = scans
            .par_iter()
            .enumerate()
            .map(|(index, scan)| {
                let outcome = self.process_scan(index, scan);
                pb.inc(1);
                outcome
            })
            .collect();
        pb.finish_with_message("Scan processing complete.");

        let completed: Vec<bool> = outcomes.iter().map(ScanOutcome::is_complete).collect();
        self.sink
            .finish(&completed)
            .map_err(|e| anyhow::anyhow!("Failed to finalize results: {}", e))?;

        let mut summary = RunSummary {
            scan_count: scans.len(),
            ..RunSummary::default()
        };
        for outcome in outcomes {
            summary.recorded += outcome.recorded;
            summary.failures.extend(outcome.failures);
        }
        for failure in &summary.failures {
            error!("{}", failure);
        }
        info!(
            "Recorded {} result(s) for {} scan(s); {} scan(s) had failures.",
            summary.recorded,
            summary.scan_count,
            summary.failed_scans()
        );
        Ok(summary)
    }
}
