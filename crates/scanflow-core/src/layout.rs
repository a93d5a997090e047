//! Persisted output layout
//!
//! Every top-level output lives under a directory derived from its
//! [`IterationKey`], so re-running a partially failed job finds completed work
//! in predictable places.

use scanflow_common::{IterationKey, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPORT_FILE: &str = "run_report.json";

/// Files produced for one key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub key: Option<IterationKey>,
    /// Output role (e.g. `commonspace_bold`, `brain_mask`) to file
    pub files: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/sub-X[/ses-Y][/run-Z]`
    #[must_use]
    pub fn key_dir(&self, key: &IterationKey) -> PathBuf {
        self.root.join(key.relative_dir())
    }

    /// Scratch space for intermediate files of one node instance
    #[must_use]
    pub fn work_dir(&self, node: &str, key: Option<&IterationKey>) -> PathBuf {
        let base = self.root.join("work").join(node);
        match key {
            Some(key) => base.join(key.to_string()),
            None => base,
        }
    }

    #[must_use]
    pub fn template_dir(&self) -> PathBuf {
        self.root.join("template")
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    /// Write `manifest.json` for `key` and return its path
    pub async fn write_manifest(&self, key: &IterationKey, manifest: &Manifest) -> Result<PathBuf> {
        let dir = self.key_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::from)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Manifest of a previous run, if one was written
    pub fn read_manifest(&self, key: &IterationKey) -> Option<Manifest> {
        let contents = std::fs::read_to_string(self.key_dir(key).join(MANIFEST_FILE)).ok()?;
        serde_json::from_str(&contents).ok()
    }
}
