//! Scan discovery
//!
//! A [`ScanSource`] turns a data root into [`ScanRecord`]s; [`ScanInventory`]
//! holds them in deterministic key order.

use scanflow_common::{DiscoveryError, IterationKey, Modality, Result, ScanRecord};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Discovery collaborator
pub trait ScanSource: Send + Sync {
    /// Data root the records were discovered under
    fn root(&self) -> &Path;

    /// Every scan under the root, in any order
    fn scan(&self) -> Result<Vec<ScanRecord>>;
}

/// Walks a BIDS-style directory tree.
///
/// Accepts `.nii` / `.nii.gz` files named `sub-<id>[_ses-<id>][_run-<id>]..._<suffix>`
/// whose suffix maps to a [`Modality`]; everything else is ignored.
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    root: PathBuf,
}

impl FilesystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(&self, dir: &Path, records: &mut Vec<ScanRecord>) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, records)?;
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_scan_name(name) {
                Some((key, modality)) => records.push(ScanRecord::new(key, modality, &path)),
                None => debug!("Ignoring {}", path.display()),
            }
        }
        Ok(())
    }
}

impl ScanSource for FilesystemSource {
    fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> Result<Vec<ScanRecord>> {
        if !self.root.is_dir() {
            return Err(DiscoveryError::NoSubjects(self.root.clone()).into());
        }
        let mut records = Vec::new();
        self.walk(&self.root, &mut records)?;
        Ok(records)
    }
}

/// Parse `sub-01_ses-2_task-rest_run-1_bold.nii.gz` into its key and modality
#[must_use]
pub fn parse_scan_name(name: &str) -> Option<(IterationKey, Modality)> {
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))?;
    let mut parts: Vec<&str> = stem.split('_').collect();
    let suffix = parts.pop()?;
    let modality = Modality::from_suffix(suffix)?;

    let mut subject = None;
    let mut session = None;
    let mut run = None;
    for part in parts {
        if let Some(v) = part.strip_prefix("sub-") {
            subject = Some(v);
        } else if let Some(v) = part.strip_prefix("ses-") {
            session = Some(v);
        } else if let Some(v) = part.strip_prefix("run-") {
            run = Some(v);
        }
    }
    let subject = subject.filter(|s| !s.is_empty())?;
    let key = IterationKey {
        subject: subject.to_string(),
        session: session.map(str::to_string),
        run: run.map(str::to_string),
    };
    Some((key, modality))
}

/// Immutable, key-ordered scan records
#[derive(Debug, Clone)]
pub struct ScanInventory {
    root: PathBuf,
    records: Vec<ScanRecord>,
}

impl ScanInventory {
    /// Discover through `source`. Zero subjects is a discovery error.
    pub fn discover(source: &dyn ScanSource) -> Result<Self> {
        let records = source.scan()?;
        let inventory = Self::from_records(source.root(), records)?;
        info!(
            "Discovered {} scans for {} subjects under {}",
            inventory.records.len(),
            inventory.subjects().len(),
            inventory.root.display()
        );
        Ok(inventory)
    }

    pub fn from_records(root: impl Into<PathBuf>, mut records: Vec<ScanRecord>) -> Result<Self> {
        let root = root.into();
        if records.is_empty() {
            return Err(DiscoveryError::NoSubjects(root).into());
        }
        records.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.modality.cmp(&b.modality))
                .then(a.path.cmp(&b.path))
        });
        Ok(Self { root, records })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    pub fn of_modality(&self, modality: Modality) -> impl Iterator<Item = &ScanRecord> {
        self.records.iter().filter(move |r| r.modality == modality)
    }

    #[must_use]
    pub fn subjects(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.key.subject.as_str()).collect()
    }
}
