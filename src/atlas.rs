// atlas.rs

use crate::cifti::{self, CiftiFile};
use crate::error::{MacchiatoError, Result};
use log::{debug, info};
use std::path::Path;

/// Label names marked with this substring are background / unassigned.
pub const UNKNOWN_LABEL_MARKER: &str = "???";

/// Ordered region names of a parcellation atlas.
///
/// The number of labels fixes the dimension N of every connectivity matrix
/// computed with this atlas. Built once per run and shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelLabelCatalog {
    labels: Vec<String>,
}

impl ParcelLabelCatalog {
    /// Reads the label table embedded in a CIFTI-2 label atlas (`.dlabel.nii`).
    pub fn load<P: AsRef<Path>>(atlas_path: P) -> Result<Self> {
        let path = atlas_path.as_ref();
        let invalid = |reason: String| MacchiatoError::InvalidAtlasFormat {
            path: path.to_path_buf(),
            reason,
        };

        let atlas = CiftiFile::open(path).map_err(|e| invalid(e.to_string()))?;
        let table = cifti::parse_label_table(&atlas.xml).map_err(|e| invalid(e.to_string()))?;
        debug!(
            "Atlas {} declares {} labels (intent {:?})",
            path.display(),
            table.len(),
            atlas.intent()
        );

        let catalog = Self::from_label_table(&table);
        if catalog.is_empty() {
            return Err(invalid(format!(
                "none of its {} labels names a parcel",
                table.len()
            )));
        }
        info!(
            "Loaded {} parcel labels from atlas {}.",
            catalog.count(),
            path.display()
        );
        Ok(catalog)
    }

    /// Builds a catalog from decoded (key, name) entries, dropping unknown ones.
    pub fn from_label_table(table: &[(i32, String)]) -> Self {
        let labels = table
            .iter()
            .filter(|(_, name)| !name.contains(UNKNOWN_LABEL_MARKER))
            .map(|(_, name)| name.clone())
            .collect();
        Self { labels }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn count(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
