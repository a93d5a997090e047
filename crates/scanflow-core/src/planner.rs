//! Fan-out planning
//!
//! Turns an inventory into the iteration sources the task graph expands over.

use crate::config::Topology;
use crate::inventory::ScanInventory;
use scanflow_common::{DiscoveryError, IterationKey, Keyed, Modality, Result, ScanRecord};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Run label given to functional scans named without a `run-` entity, so a
/// run never shares its session's key (and output directory)
pub const DEFAULT_RUN: &str = "1";

/// Iteration sources for one run.
///
/// `top_level` drives the main expansion. In the paired topology it holds one
/// anatomical scan per subject+session and `runs` holds the functional scans,
/// each keyed under its parent. In the flat topology `top_level` holds one
/// functional scan per subject+session+run and `runs` is empty.
#[derive(Debug, Clone)]
pub struct IterationPlan {
    pub topology: Topology,
    pub top_level: Vec<Keyed<ScanRecord>>,
    pub runs: Vec<Keyed<ScanRecord>>,
}

impl IterationPlan {
    pub fn top_level_keys(&self) -> impl Iterator<Item = &IterationKey> {
        self.top_level.iter().map(|k| &k.key)
    }

    pub fn run_keys(&self) -> impl Iterator<Item = &IterationKey> {
        self.runs.iter().map(|k| &k.key)
    }

    /// Number of top-level replicas
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.top_level.len()
    }

    /// Functional runs belonging to a paired top-level key
    pub fn runs_of<'a>(
        &'a self,
        parent: &'a IterationKey,
    ) -> impl Iterator<Item = &'a Keyed<ScanRecord>> + 'a {
        self.runs.iter().filter(move |r| parent.is_prefix_of(&r.key))
    }
}

/// Builds an [`IterationPlan`] for the selected topology
#[derive(Debug, Clone, Copy)]
pub struct IterationPlanner {
    topology: Topology,
}

impl IterationPlanner {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn plan(&self, inventory: &ScanInventory) -> Result<IterationPlan> {
        let functional = unique_by_key(inventory, Modality::Functional, run_key)?;
        if functional.is_empty() {
            return Err(DiscoveryError::NoSubjects(inventory.root().to_path_buf()).into());
        }

        let plan = match self.topology {
            Topology::Flat => IterationPlan {
                topology: Topology::Flat,
                top_level: functional.into_values().collect(),
                runs: Vec::new(),
            },
            Topology::Paired => {
                let anatomical =
                    unique_by_key(inventory, Modality::Anatomical, IterationKey::without_run)?;

                let mut top_level = Vec::new();
                let mut parents: Vec<IterationKey> =
                    functional.keys().map(IterationKey::without_run).collect();
                parents.dedup();
                for parent in parents {
                    let anat = anatomical.get(&parent).ok_or_else(|| {
                        DiscoveryError::MissingModality {
                            key: parent.clone(),
                            modality: Modality::Anatomical,
                        }
                    })?;
                    top_level.push(anat.clone());
                }
                for key in anatomical.keys() {
                    if !top_level.iter().any(|t| &t.key == key) {
                        warn!("Anatomical scan for {} has no functional runs, skipping", key);
                    }
                }
                IterationPlan {
                    topology: Topology::Paired,
                    top_level,
                    runs: functional.into_values().collect(),
                }
            }
        };

        info!(
            "Planned {} top-level replicas and {} nested runs ({} topology)",
            plan.top_level.len(),
            plan.runs.len(),
            plan.topology
        );
        Ok(plan)
    }
}

fn run_key(key: &IterationKey) -> IterationKey {
    match key.run {
        Some(_) => key.clone(),
        None => IterationKey::run(key.subject.clone(), key.session.clone(), DEFAULT_RUN),
    }
}

/// Group records of one modality under `key_of(record.key)`, rejecting
/// ambiguous keys. The map iterates in key order.
fn unique_by_key(
    inventory: &ScanInventory,
    modality: Modality,
    key_of: impl Fn(&IterationKey) -> IterationKey,
) -> Result<BTreeMap<IterationKey, Keyed<ScanRecord>>> {
    let mut grouped: BTreeMap<IterationKey, Vec<&ScanRecord>> = BTreeMap::new();
    for record in inventory.of_modality(modality) {
        grouped.entry(key_of(&record.key)).or_default().push(record);
    }

    let mut unique = BTreeMap::new();
    for (key, records) in grouped {
        if records.len() > 1 {
            return Err(DiscoveryError::DuplicateMatch {
                key,
                modality,
                paths: records.iter().map(|r| r.path.clone()).collect(),
            }
            .into());
        }
        let record = records[0].clone();
        unique.insert(key.clone(), Keyed::new(key, record));
    }
    Ok(unique)
}
