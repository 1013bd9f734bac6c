//! Invalidation Tests
//!
//! Only the clusters touched by an edit are dropped and regenerated.

use crate::common::*;
use ndarray::ArrayD;
use std::collections::BTreeMap;

fn snapshot(
    ts: &TestStore,
    field: &str,
    clusters: &[ClusterId],
) -> BTreeMap<ClusterId, ArrayD<f32>> {
    clusters
        .iter()
        .map(|&c| (c, ts.store.load_clusters(field, &[c]).unwrap()))
        .collect()
}

#[test]
fn invalidate_touches_only_one_cluster() {
    let mut ts = TestStore::generated();
    let others = vec![0, 1, 3, 4];
    let features_before = snapshot(&ts, "features", &others);
    let waveforms_before = snapshot(&ts, "waveforms", &others);
    ts.store.mean_masks(2).unwrap();
    ts.store.mean_masks(3).unwrap();

    ts.store.invalidate(2).unwrap();
    assert!(ts.store.features(2).unwrap_err().is_missing_field());
    assert_eq!(ts.store.field_state(2, "mean_masks").unwrap(), FieldState::Ungenerated);
    assert_eq!(ts.store.field_state(3, "mean_masks").unwrap(), FieldState::Cached);

    let report = ts.store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 1);
    assert_eq!(report.item("features_masks").unwrap().clusters_skipped, 4);
    assert_eq!(report.item("waveforms").unwrap().clusters_generated, 1);

    assert_eq!(snapshot(&ts, "features", &others), features_before);
    assert_eq!(snapshot(&ts, "waveforms", &others), waveforms_before);
    assert_eq!(ts.store.features(2).unwrap(), ts.expected_features(&ts.spikes(2)));
}

#[test]
fn merge_regenerates_only_the_new_cluster() {
    let mut ts = TestStore::generated();
    ts.store.mean_masks(4).unwrap();
    let untouched = vec![2, 3, 4];
    let before = snapshot(&ts, "features", &untouched);

    let merged: Vec<i64> = ts
        .recording
        .spike_clusters()
        .into_iter()
        .map(|c| if c == 0 || c == 1 { 10 } else { c })
        .collect();
    let delta = ts.store.set_assignment(&merged).unwrap();
    assert_eq!(delta.removed, vec![0, 1]);
    assert_eq!(delta.added, vec![10]);
    assert!(delta.changed.is_empty());

    assert_eq!(ts.store.clusters(), vec![2, 3, 4, 10]);
    assert!(matches!(
        ts.store.features(0),
        Err(StoreError::InvalidQuery(_))
    ));
    assert_eq!(ts.store.field_state(4, "mean_masks").unwrap(), FieldState::Cached);

    let report = ts.store.generate().unwrap();
    let fm = report.item("features_masks").unwrap();
    assert_eq!(fm.clusters_generated, 1);
    assert_eq!(fm.clusters_skipped, 3);

    let spikes = ts.spikes(10);
    let expected_n = ts
        .recording
        .spike_clusters()
        .iter()
        .filter(|&&c| c == 0 || c == 1)
        .count();
    assert_eq!(spikes.len(), expected_n);
    assert_eq!(ts.store.features(10).unwrap(), ts.expected_features(&spikes));
    assert_eq!(snapshot(&ts, "features", &untouched), before);
}

#[test]
fn split_invalidates_the_source_cluster() {
    let mut ts = TestStore::generated();
    let source = ts.spikes(3);
    let moved: Vec<SpikeId> = source.iter().copied().step_by(2).collect();

    let mut assignment = ts.recording.spike_clusters();
    for &s in &moved {
        assignment[s] = 11;
    }
    let delta = ts.store.set_assignment(&assignment).unwrap();
    assert_eq!(delta.changed, vec![3]);
    assert_eq!(delta.added, vec![11]);

    let report = ts.store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 2);
    assert_eq!(ts.store.features(11).unwrap(), ts.expected_features(&moved));
    let kept = ts.spikes(3);
    assert_eq!(kept.len(), source.len() - moved.len());
    assert_eq!(ts.store.features(3).unwrap(), ts.expected_features(&kept));

    // Waveform excerpts follow the new partition.
    let excerpt = ts.waveform_spikes();
    assert!(excerpt[&11].iter().all(|s| moved.contains(s)));
}

#[test]
fn unchanged_assignment_keeps_everything() {
    let mut ts = TestStore::generated();
    let same = ts.recording.spike_clusters();
    let delta = ts.store.set_assignment(&same).unwrap();
    assert!(delta.is_empty());
    let report = ts.store.generate().unwrap();
    assert_eq!(report.clusters_generated(), 0);
}

#[test]
fn delete_cluster_drops_its_rows() {
    let mut ts = TestStore::generated();
    ts.store.delete_cluster(1).unwrap();
    assert!(ts.store.masks(1).unwrap_err().is_missing_field());
    for c in [0, 2, 3, 4] {
        assert_eq!(ts.store.masks(c).unwrap(), ts.expected_masks(&ts.spikes(c)));
    }
}

#[test]
fn compaction_preserves_live_regions() {
    let mut ts = TestStore::generated();
    ts.store.invalidate(0).unwrap();
    ts.store.invalidate(3).unwrap();
    let len_before = std::fs::metadata(ts.chunk_file("features")).unwrap().len();
    assert!(ts.store.disk().dead_bytes("features").unwrap() > 0);

    let reports = ts.store.compact().unwrap();
    let features = reports.iter().find(|r| r.field == "features").unwrap();
    assert!(features.reclaimed() > 0);
    assert!(std::fs::metadata(ts.chunk_file("features")).unwrap().len() < len_before);
    assert_eq!(ts.store.disk().dead_bytes("features").unwrap(), 0);

    for c in [1, 2, 4] {
        assert_eq!(ts.store.features(c).unwrap(), ts.expected_features(&ts.spikes(c)));
    }

    let report = ts.store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 2);
    for c in ts.store.clusters() {
        assert_eq!(ts.store.features(c).unwrap(), ts.expected_features(&ts.spikes(c)));
    }
}
