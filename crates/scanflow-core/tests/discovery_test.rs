//! Discovery and planning over a BIDS-style tree on disk

use scanflow_common::{ErrorKind, IterationKey, Modality};
use scanflow_core::{FilesystemSource, IterationPlanner, ScanInventory, Topology};
use std::path::Path;

fn touch(root: &Path, relative: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("Failed to create dirs");
    std::fs::write(&path, b"").expect("Failed to write file");
}

/// `subjects` x `sessions` sessions, each with a T1w and `runs` bold runs
fn dataset(root: &Path, subjects: usize, sessions: usize, runs: usize) {
    for s in 1..=subjects {
        for t in 1..=sessions {
            let dir = format!("sub-{s:02}/ses-{t}");
            touch(root, &format!("{dir}/anat/sub-{s:02}_ses-{t}_T1w.nii.gz"));
            for r in 1..=runs {
                touch(
                    root,
                    &format!("{dir}/func/sub-{s:02}_ses-{t}_task-rest_run-{r}_bold.nii.gz"),
                );
            }
        }
    }
}

fn discover(root: &Path) -> ScanInventory {
    ScanInventory::discover(&FilesystemSource::new(root)).expect("Discovery failed")
}

#[test]
fn test_replica_counts_per_topology() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset(dir.path(), 3, 2, 2);
    let inventory = discover(dir.path());
    assert_eq!(inventory.records().len(), 3 * 2 * 3);
    assert_eq!(inventory.subjects().len(), 3);

    let flat = IterationPlanner::new(Topology::Flat)
        .plan(&inventory)
        .expect("flat plan");
    assert_eq!(flat.replica_count(), 12);
    assert!(flat.runs.is_empty());

    let paired = IterationPlanner::new(Topology::Paired)
        .plan(&inventory)
        .expect("paired plan");
    assert_eq!(paired.replica_count(), 6);
    assert_eq!(paired.runs.len(), 12);
    assert!(paired
        .top_level
        .iter()
        .all(|t| t.value.modality == Modality::Anatomical && t.key.run.is_none()));
}

#[test]
fn test_keys_are_sorted_and_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset(dir.path(), 2, 1, 3);
    let first: Vec<IterationKey> = IterationPlanner::new(Topology::Flat)
        .plan(&discover(dir.path()))
        .expect("plan")
        .top_level_keys()
        .cloned()
        .collect();
    let second: Vec<IterationKey> = IterationPlanner::new(Topology::Flat)
        .plan(&discover(dir.path()))
        .expect("plan")
        .top_level_keys()
        .cloned()
        .collect();

    assert_eq!(first, second);
    let mut sorted = first.clone();
    sorted.sort();
    assert_eq!(first, sorted);
    assert_eq!(first[0].to_string(), "sub-01_ses-1_run-1");
}

#[test]
fn test_unrelated_files_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset(dir.path(), 1, 1, 1);
    touch(dir.path(), "dataset_description.json");
    touch(dir.path(), "sub-01/ses-1/func/sub-01_ses-1_run-1_bold.json");
    touch(dir.path(), "sub-01/ses-1/dwi/sub-01_ses-1_dwi.nii.gz");
    touch(dir.path(), "derivatives/notes.txt");

    let inventory = discover(dir.path());
    assert_eq!(inventory.records().len(), 2);
}

#[test]
fn test_session_without_anatomical_is_missing_modality() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset(dir.path(), 2, 1, 1);
    std::fs::remove_file(
        dir.path()
            .join("sub-02/ses-1/anat/sub-02_ses-1_T1w.nii.gz"),
    )
    .expect("remove");

    let inventory = discover(dir.path());
    let err = IterationPlanner::new(Topology::Paired)
        .plan(&inventory)
        .expect_err("paired planning must fail");
    assert_eq!(err.kind(), ErrorKind::Discovery);
    assert!(err.to_string().contains("sub-02_ses-1"));

    // The flat topology never looks at anatomical scans
    let flat = IterationPlanner::new(Topology::Flat)
        .plan(&inventory)
        .expect("flat plan");
    assert_eq!(flat.replica_count(), 2);
}

#[test]
fn test_two_anatomical_candidates_are_ambiguous() {
    let dir = tempfile::tempdir().expect("tempdir");
    dataset(dir.path(), 1, 1, 1);
    touch(dir.path(), "sub-01/ses-1/anat/sub-01_ses-1_T2w.nii.gz");

    let err = IterationPlanner::new(Topology::Paired)
        .plan(&discover(dir.path()))
        .expect_err("duplicate anatomical scans must fail");
    assert_eq!(err.kind(), ErrorKind::Discovery);
    assert!(err.to_string().contains("sub-01_ses-1"));
}

#[test]
fn test_missing_root_is_a_discovery_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = ScanInventory::discover(&FilesystemSource::new(dir.path().join("absent")))
        .expect_err("no data root");
    assert_eq!(err.kind(), ErrorKind::Discovery);

    let empty = ScanInventory::discover(&FilesystemSource::new(dir.path()))
        .expect_err("no scans");
    assert_eq!(empty.kind(), ErrorKind::Discovery);
}
