//! Run report aggregating every outcome of one scheduler run

use chrono::{DateTime, Utc};
use scanflow_common::{ErrorKind, IterationKey, Result};
use scanflow_core::ResourceCost;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

/// A top-level output that completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub node: String,
    pub key: Option<IterationKey>,
    pub outputs: Value,
}

/// A node that failed on its own (not because of an upstream failure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub node: String,
    pub key: Option<IterationKey>,
    pub kind: ErrorKind,
    pub message: String,
}

/// A node that never ran because something upstream failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub node: String,
    pub key: Option<IterationKey>,
    /// Label of the root failure, e.g. `register[sub-01_run-2]`
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outputs: Vec<OutputRecord>,
    pub failures: Vec<FailureRecord>,
    pub skipped: Vec<SkippedRecord>,
    pub nodes_run: usize,
    pub cache_hits: usize,
    pub peak_usage: ResourceCost,
}

impl RunReport {
    pub(crate) fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_secs: 0.0,
            outputs: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            nodes_run: 0,
            cache_hits: 0,
            peak_usage: ResourceCost::default(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Distinct keys with at least one root failure (global failures excluded)
    #[must_use]
    pub fn failed_keys(&self) -> BTreeSet<&IterationKey> {
        self.failures.iter().filter_map(|f| f.key.as_ref()).collect()
    }

    /// Keys of completed top-level outputs
    #[must_use]
    pub fn succeeded_keys(&self) -> BTreeSet<&IterationKey> {
        self.outputs.iter().filter_map(|o| o.key.as_ref()).collect()
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    pub async fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::from)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents).map_err(std::io::Error::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_keys_and_exit_code() {
        let mut report = RunReport::start();
        assert_eq!(report.exit_code(), 0);

        let key = IterationKey::run("01", None, "2");
        report.failures.push(FailureRecord {
            node: "register".to_string(),
            key: Some(key.clone()),
            kind: ErrorKind::RegistrationFailure,
            message: "exit 1".to_string(),
        });
        report.failures.push(FailureRecord {
            node: "resample".to_string(),
            key: Some(key.clone()),
            kind: ErrorKind::Io,
            message: "disk full".to_string(),
        });
        assert_eq!(report.failed_keys().len(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_written_report_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("run_report.json");
        let mut report = RunReport::start();
        report.outputs.push(OutputRecord {
            node: "sink".to_string(),
            key: Some(IterationKey::subject("01")),
            outputs: serde_json::json!({"manifest": "sub-01/manifest.json"}),
        });
        report.write_json(&path).await.unwrap();
        assert_eq!(RunReport::read_json(&path).unwrap(), report);
    }
}
