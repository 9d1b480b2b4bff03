// discovery.rs
//
// Locates resting-state dense timeseries under a BIDS-like input tree.

use crate::error::{MacchiatoError, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

pub const DENSE_SERIES_SUFFIX: &str = ".dtseries.nii";
pub const MSMALL_REGISTRATION: &str = "MSMAll_2_d40_WRN";
const ABCD_SUFFIX: &str = "_bold_timeseries.dtseries.nii";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessing {
    Hcp,
    Fmriprep,
    Abcd,
}

impl FromStr for Preprocessing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hcp" => Ok(Preprocessing::Hcp),
            "fmriprep" => Ok(Preprocessing::Fmriprep),
            "abcd" => Ok(Preprocessing::Abcd),
            other => Err(format!(
                "unknown preprocessing type '{}' (expected HCP, fmriprep or ABCD)",
                other
            )),
        }
    }
}

impl fmt::Display for Preprocessing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Preprocessing::Hcp => "HCP",
            Preprocessing::Fmriprep => "fmriprep",
            Preprocessing::Abcd => "ABCD",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    MsmAll,
    Native,
}

impl FromStr for Registration {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(MSMALL_REGISTRATION) {
            Ok(Registration::MsmAll)
        } else if s.eq_ignore_ascii_case("none") {
            Ok(Registration::Native)
        } else {
            Err(format!(
                "unknown registration '{}' (expected {} or NONE)",
                s, MSMALL_REGISTRATION
            ))
        }
    }
}

/// One discovered scan and the identity parsed from its path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanIdentity {
    pub path: PathBuf,
    pub subject: Option<String>,
    pub session: Option<String>,
    /// File name up to its first `.`.
    pub fmri_name: String,
}

impl ScanIdentity {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fmri_name = file_name.split('.').next().unwrap_or_default().to_string();

        // directory components first, then underscore-separated filename entities
        let mut tokens: Vec<String> = path
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        tokens.extend(fmri_name.split('_').map(str::to_string));

        let entity = |prefix: &str| {
            tokens
                .iter()
                .find_map(|t| t.strip_prefix(prefix).filter(|v| !v.is_empty()))
                .map(str::to_string)
        };
        let subject = entity("sub-");
        let session = entity("ses-");

        Self {
            path,
            subject,
            session,
            fmri_name,
        }
    }

    /// `sub-<s>[/ses-<t>]` below `root`, or `root` itself for scans without a subject.
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        let mut dir = root.to_path_buf();
        if let Some(subject) = &self.subject {
            dir.push(format!("sub-{}", subject));
            if let Some(session) = &self.session {
                dir.push(format!("ses-{}", session));
            }
        }
        dir
    }
}

impl fmt::Display for ScanIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.subject, &self.session) {
            (Some(sub), Some(ses)) => write!(f, "sub-{}/ses-{}/{}", sub, ses, self.fmri_name),
            (Some(sub), None) => write!(f, "sub-{}/{}", sub, self.fmri_name),
            _ => f.write_str(&self.fmri_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub input_dir: PathBuf,
    pub preprocessing: Preprocessing,
    pub ica_outputs: bool,
    pub combine: bool,
    pub registration: Registration,
    pub participant_labels: Vec<String>,
    pub session_labels: Vec<String>,
}

impl DiscoveryQuery {
    fn accepts_file_name(&self, name: &str) -> bool {
        if !name.ends_with(DENSE_SERIES_SUFFIX) || !name.to_ascii_lowercase().contains("rest") {
            return false;
        }
        let msmall = name.contains(MSMALL_REGISTRATION);
        match self.preprocessing {
            Preprocessing::Hcp => {
                let registration_ok = match self.registration {
                    Registration::MsmAll => msmall,
                    Registration::Native => !msmall,
                };
                let filter_ok = if self.ica_outputs {
                    name.contains("_hp2000_clean")
                } else {
                    name.contains("_hp2000") && !name.contains("clean")
                };
                registration_ok && filter_ok
            }
            Preprocessing::Fmriprep => {
                if self.ica_outputs {
                    name.contains("smoothAROMAnonaggr")
                } else {
                    name.contains("preproc")
                }
            }
            Preprocessing::Abcd => name.ends_with(ABCD_SUFFIX),
        }
    }

    fn accepts_identity(&self, scan: &ScanIdentity) -> bool {
        label_matches(&self.participant_labels, scan.subject.as_deref(), "sub-")
            && label_matches(&self.session_labels, scan.session.as_deref(), "ses-")
    }
}

fn label_matches(wanted: &[String], found: Option<&str>, prefix: &str) -> bool {
    if wanted.is_empty() {
        return true;
    }
    match found {
        Some(found) => wanted
            .iter()
            .any(|w| w.strip_prefix(prefix).unwrap_or(w) == found),
        None => false,
    }
}

/// Discovered scans, sorted so that index assignment is stable across runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanBatch {
    Single(Vec<ScanIdentity>),
    Combined(Vec<Vec<ScanIdentity>>),
}

impl ScanBatch {
    pub fn scans(&self) -> Vec<&ScanIdentity> {
        match self {
            ScanBatch::Single(scans) => scans.iter().collect(),
            ScanBatch::Combined(groups) => groups.iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScanBatch::Single(scans) => scans.len(),
            ScanBatch::Combined(groups) => groups.iter().map(Vec::len).sum(),
        }
    }
}

/// Regular files under `dir` in file-name order. Directory symlinks are not
/// descended; symlinks to files are kept.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let file_type = entry.file_type();
        if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub fn discover(query: &DiscoveryQuery) -> Result<ScanBatch> {
    if !query.input_dir.is_dir() {
        return Err(MacchiatoError::ScanNotFound(query.input_dir.clone()));
    }
    if query.preprocessing == Preprocessing::Abcd && query.ica_outputs {
        warn!("ICA outputs are not distinguished for ABCD data; ignoring --use-ica-outputs.");
    }

    let files = collect_files(&query.input_dir)?;
    debug!("Scanned {} files under {}", files.len(), query.input_dir.display());

    let mut scans: Vec<ScanIdentity> = files
        .iter()
        .filter(|p| {
            p.file_name()
                .map(|n| query.accepts_file_name(&n.to_string_lossy()))
                .unwrap_or(false)
        })
        .map(ScanIdentity::from_path)
        .filter(|scan| query.accepts_identity(scan))
        .collect();
    scans.sort();

    if scans.is_empty() {
        return Err(MacchiatoError::ScanNotFound(query.input_dir.clone()));
    }
    info!(
        "Found {} {} resting-state scan(s) under {}.",
        scans.len(),
        query.preprocessing,
        query.input_dir.display()
    );

    if !query.combine {
        return Ok(ScanBatch::Single(scans));
    }

    let mut groups: BTreeMap<(Option<String>, Option<String>), Vec<ScanIdentity>> = BTreeMap::new();
    for scan in scans {
        groups
            .entry((scan.subject.clone(), scan.session.clone()))
            .or_default()
            .push(scan);
    }
    let mut combined = Vec::new();
    for ((subject, session), group) in groups {
        if group.len() == 2 {
            combined.push(group);
        } else {
            warn!(
                "Skipping sub-{} ses-{}: combining needs exactly 2 resting scans, found {}.",
                subject.as_deref().unwrap_or("?"),
                session.as_deref().unwrap_or("?"),
                group.len()
            );
        }
    }
    if combined.is_empty() {
        return Err(MacchiatoError::ScanNotFound(query.input_dir.clone()));
    }
    Ok(ScanBatch::Combined(combined))
}
