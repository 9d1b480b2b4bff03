// main.rs

mod atlas;
mod cifti;
mod discovery;
mod error;
mod glasso;
mod graph;
mod matrix_ops;
mod network;
mod output;
mod parcellate;
mod pipeline;

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::{path::Path, sync::Arc, time::Instant};

use crate::atlas::ParcelLabelCatalog;
use crate::discovery::DiscoveryQuery;
use crate::graph::GraphMetricEngine;
use crate::network::NetworkEstimator;
use crate::output::{AggregateSink, FlatFileSink, ResultSink};
use crate::parcellate::{ParcellationConfig, ScanParcellator, WorkbenchReducer};
use crate::pipeline::{RunPlan, ScanPipeline};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting macchiato with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Resolve what to compute before touching any data ---
    let plan = RunPlan::resolve(
        &cli_args.network_matrix_calculation,
        &cli_args.graph_theory,
        cli_args.apply_fishers_r_to_z_transform,
        cli_args.overwrite,
        &cli_args.output_dir,
    )?;
    if cli_args.apply_fishers_r_to_z_transform
        && !plan.methods.contains(&network::NetworkMethod::Correlation)
    {
        warn!("Fisher r-to-z transform requested but correlation is not among the selected methods; it will have no effect.");
    }

    // --- 2. Load the atlas ---
    let atlas_name = cli_args.atlas_name()?;
    let catalog = Arc::new(ParcelLabelCatalog::load(&cli_args.parcellation_file)?);
    debug!(
        "Parcel labels (first 5): {:?}",
        catalog.labels().iter().take(5).collect::<Vec<_>>()
    );

    // --- 3. Discover scans ---
    let query = DiscoveryQuery {
        input_dir: cli_args.input_dir.clone(),
        preprocessing: cli_args.preprocessing_type,
        ica_outputs: cli_args.use_ica_outputs,
        combine: cli_args.combine_resting_scans,
        registration: cli_args.reg_name,
        participant_labels: cli_args.participant_label.clone(),
        session_labels: cli_args.session_label.clone(),
    };
    let batch = discovery::discover(&query)
        .with_context(|| format!("Scan discovery failed in {}", cli_args.input_dir.display()))?;

    // --- 4. Prepare the result sink ---
    let sink: Box<dyn ResultSink> = match cli_args.group {
        cli::AnalysisLevel::Participant => Box::new(FlatFileSink::new(
            &cli_args.output_dir,
            atlas_name.as_str(),
            catalog.labels().to_vec(),
        )),
        cli::AnalysisLevel::Batch => Box::new(AggregateSink::create(
            &cli_args.output_dir,
            &cli_args.parcellation_file,
            &atlas_name,
            catalog.labels(),
            &batch.scans(),
            &plan.datasets(catalog.count()),
        )?),
    };

    // --- 5. Process every scan ---
    let parcellator = ScanParcellator::new(
        ParcellationConfig {
            atlas_path: cli_args.parcellation_file.clone(),
            atlas_name: atlas_name.clone(),
        },
        Arc::clone(&catalog),
        WorkbenchReducer::new(&cli_args.wb_command),
    );
    let estimator = NetworkEstimator::default();
    let engine = GraphMetricEngine::default();
    let pipeline = ScanPipeline {
        parcellator: &parcellator,
        estimator: &estimator,
        engine: &engine,
        plan: &plan,
        sink: sink.as_ref(),
    };
    let summary = pipeline.run(&batch)?;

    if !summary.is_success() {
        return Err(anyhow!(
            "{} of {} scan(s) failed. See errors above.",
            summary.failed_scans(),
            summary.scan_count
        ));
    }

    info!(
        "macchiato finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use super::{anyhow, Path, Result};
    use crate::discovery::{Preprocessing, Registration};
    use clap::{ArgAction, Parser, ValueEnum};
    use std::path::PathBuf;

    #[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum AnalysisLevel {
        /// Flat files per subject/session.
        Participant,
        /// One shared array per dataset, indexed by scan.
        Batch,
    }

    /// Accepts yes/no in any casing, plus y/n and true/false.
    pub(crate) fn parse_yes_no(value: &str) -> Result<bool, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" => Ok(true),
            "no" | "n" | "false" => Ok(false),
            other => Err(format!("expected yes or no, found '{}'", other)),
        }
    }

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Resting-state fMRI connectivity matrices and graph metrics.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// BIDS-like directory holding the preprocessed scans.
        pub(crate) input_dir: PathBuf,

        pub(crate) output_dir: PathBuf,

        #[arg(long, value_enum, default_value_t = AnalysisLevel::Participant)]
        pub(crate) group: AnalysisLevel,

        #[arg(long, num_args = 1..)]
        pub(crate) participant_label: Vec<String>,

        #[arg(long, num_args = 1..)]
        pub(crate) session_label: Vec<String>,

        #[arg(long, default_value = "HCP")]
        pub(crate) preprocessing_type: Preprocessing,

        #[arg(long, value_parser = parse_yes_no, action = ArgAction::Set, default_value = "no")]
        pub(crate) use_ica_outputs: bool,

        #[arg(long, value_parser = parse_yes_no, action = ArgAction::Set, default_value = "no")]
        pub(crate) combine_resting_scans: bool,

        #[arg(long, value_parser = parse_yes_no, action = ArgAction::Set, default_value = "no")]
        pub(crate) apply_fishers_r_to_z_transform: bool,

        #[arg(long, default_value = "MSMAll_2_d40_WRN")]
        pub(crate) reg_name: Registration,

        /// CIFTI label atlas (.dlabel.nii).
        #[arg(long, required = true)]
        pub(crate) parcellation_file: PathBuf,

        /// Short atlas name used in output file names. Defaults to the atlas file name.
        #[arg(long)]
        pub(crate) parcellation_name: Option<String>,

        #[arg(long, num_args = 1.., default_value = "correlation")]
        pub(crate) network_matrix_calculation: Vec<String>,

        #[arg(long, num_args = 1.., default_value = "NONE")]
        pub(crate) graph_theory: Vec<String>,

        /// Re-run parcellation even if its output exists.
        #[arg(long)]
        pub(crate) overwrite: bool,

        #[arg(long, env = "WB_COMMAND", default_value = "wb_command")]
        pub(crate) wb_command: PathBuf,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn atlas_name(&self) -> Result<String> {
            if let Some(name) = &self.parcellation_name {
                return Ok(name.clone());
            }
            Path::new(&self.parcellation_file)
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('.').next())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow!(
                        "Cannot derive an atlas name from {}; pass --parcellation-name.",
                        self.parcellation_file.display()
                    )
                })
        }
    }

}
