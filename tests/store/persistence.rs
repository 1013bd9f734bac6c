//! Persistence Tests
//!
//! A store reopened over an existing cache directory recovers every sealed
//! region, from the manifest when it is valid and from a chunk file rescan
//! otherwise.

use crate::common::*;
use std::fs::OpenOptions;
use std::io::Write;

fn assert_all_features(ts: &TestStore) {
    for c in ts.store.clusters() {
        assert_eq!(ts.store.features(c).unwrap(), ts.expected_features(&ts.spikes(c)));
        assert_eq!(ts.store.masks(c).unwrap(), ts.expected_masks(&ts.spikes(c)));
    }
}

fn reopen_from(
    dir: tempfile::TempDir,
    recording: Arc<InMemoryRecording>,
    config: StoreConfig,
) -> TestStore {
    let store = create_store(recording.clone(), dir.path(), config.clone()).unwrap();
    TestStore {
        dir,
        recording,
        config,
        store,
    }
}

/// Same recording data under a new assignment
fn relabeled(recording: &InMemoryRecording, spike_clusters: Vec<i64>) -> Arc<InMemoryRecording> {
    Arc::new(
        InMemoryRecording::new(
            spike_clusters,
            recording.features().clone(),
            recording.masks().clone(),
            recording.waveform_source().clone(),
            recording.channel_positions(),
        )
        .unwrap(),
    )
}

#[test]
fn reopen_loads_without_regenerating() {
    let mut ts = TestStore::generated();
    assert!(ts.manifest_file("features").exists());
    ts.reopen();

    assert_all_features(&ts);
    let report = ts.store.generate().unwrap();
    assert_eq!(report.clusters_generated(), 0);
    assert_eq!(report.item("waveforms").unwrap().clusters_skipped, 5);
}

#[test]
fn corrupt_manifest_falls_back_to_rescan() {
    let (dir, recording, config) = TestStore::generated().close();
    std::fs::write(dir.path().join("features.manifest"), b"not a manifest").unwrap();

    let mut ts = reopen_from(dir, recording, config);
    assert_all_features(&ts);
    let report = ts.store.generate().unwrap();
    assert_eq!(report.clusters_generated(), 0);
}

#[test]
fn missing_manifest_falls_back_to_rescan() {
    let (dir, recording, config) = TestStore::generated().close();
    std::fs::remove_file(dir.path().join("masks.manifest")).unwrap();

    let mut ts = reopen_from(dir, recording, config);
    assert_all_features(&ts);
    assert_eq!(ts.store.generate().unwrap().clusters_generated(), 0);
    ts.store.flush().unwrap();
    assert!(ts.manifest_file("masks").exists());
}

#[test]
fn torn_tail_is_truncated() {
    let (dir, recording, config) = TestStore::generated().close();
    let chunk = dir.path().join("features.chunks");
    let len = std::fs::metadata(&chunk).unwrap().len();
    {
        let mut f = OpenOptions::new().append(true).open(&chunk).unwrap();
        // Half a record header
        f.write_all(&[0x43, 0x4C, 0x53, 0x52, 1, 0, 0, 0, 9, 9]).unwrap();
    }

    let mut ts = reopen_from(dir, recording, config);
    assert_eq!(std::fs::metadata(&chunk).unwrap().len(), len);
    assert_all_features(&ts);
    assert_eq!(ts.store.generate().unwrap().clusters_generated(), 0);
}

#[test]
fn cancelled_generation_resumes_after_reopen() {
    let mut ts = TestStore::new();
    let report = ts.store.generate_with(&mut stop_after(5)).unwrap();
    assert!(report.cancelled);
    let sealed = ts
        .store
        .clusters()
        .into_iter()
        .filter(|&c| ts.store.field_state(c, "features").unwrap() == FieldState::Cached)
        .count();

    ts.reopen();
    let report = ts.store.generate().unwrap();
    let fm = report.item("features_masks").unwrap();
    assert_eq!(fm.clusters_skipped, sealed);
    assert_eq!(fm.clusters_generated, 5 - sealed);
    assert_all_features(&ts);
}

#[test]
fn resumed_regions_survive_a_later_rescan() {
    let mut ts = TestStore::new();
    assert!(ts.store.generate_with(&mut stop_after(3)).unwrap().cancelled);
    ts.reopen();
    let report = ts.store.generate().unwrap();
    assert!(!report.cancelled);

    let (dir, recording, config) = ts.close();
    std::fs::remove_file(dir.path().join("features.manifest")).unwrap();

    let mut ts = reopen_from(dir, recording, config);
    for c in ts.store.clusters() {
        assert_eq!(ts.store.field_state(c, "features").unwrap(), FieldState::Cached);
    }
    assert_all_features(&ts);
    assert_eq!(ts.store.generate().unwrap().clusters_generated(), 0);
}

#[test]
fn invalidation_survives_reopen() {
    let mut ts = TestStore::generated();
    ts.store.invalidate(4).unwrap();
    ts.reopen();

    assert!(ts.store.features(4).unwrap_err().is_missing_field());
    let report = ts.store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 1);
    assert_all_features(&ts);
}

#[test]
fn reopen_with_a_different_assignment_regenerates_changed_clusters() {
    let (dir, recording, config) = TestStore::generated().close();

    // Cluster 2 merged into 0.
    let merged: Vec<i64> = recording
        .spike_clusters()
        .into_iter()
        .map(|c| if c == 2 { 0 } else { c })
        .collect();
    let mut ts = reopen_from(dir, relabeled(&recording, merged), config);

    // The old region of cluster 0 is dropped on open, never served.
    assert!(ts.store.features(0).unwrap_err().is_missing_field());
    assert!(ts.store.mean_masks(0).unwrap_err().is_missing_field());
    assert_eq!(ts.store.field_state(0, "waveforms").unwrap(), FieldState::Ungenerated);
    assert_eq!(ts.store.features(1).unwrap(), ts.expected_features(&ts.spikes(1)));

    let report = ts.store.generate().unwrap();
    let fm = report.item("features_masks").unwrap();
    assert_eq!(fm.clusters_skipped, 3);
    assert_eq!(fm.clusters_generated, 1);
    assert_eq!(fm.clusters_stale, 0);
    assert_all_features(&ts);
    let mean = ts.store.mean_masks(0).unwrap();
    assert_eq!(mean.len(), ts.expected_masks(&ts.spikes(0)).ncols());
}

#[test]
fn reopen_with_swapped_spikes_refuses_old_rows() {
    let (dir, recording, config) = TestStore::generated().close();

    // Clusters 0 and 1 trade one spike each, so both keep their size.
    let mut assignment = recording.spike_clusters();
    let a = assignment.iter().position(|&c| c == 0).unwrap();
    let b = assignment.iter().position(|&c| c == 1).unwrap();
    assignment.swap(a, b);
    let mut ts = reopen_from(dir, relabeled(&recording, assignment), config);

    for c in [0, 1] {
        assert!(ts.store.features(c).unwrap_err().is_missing_field());
        assert!(ts.store.masks(c).unwrap_err().is_missing_field());
    }
    assert!(ts.store.load_spikes("masks", &[a]).unwrap_err().is_missing_field());
    assert_eq!(ts.store.masks(2).unwrap(), ts.expected_masks(&ts.spikes(2)));

    let report = ts.store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 2);
    let rows = ts.store.load_spikes("masks", &[a, b]).unwrap();
    assert_eq!(rows, ts.expected_masks(&[a, b]).into_dyn());
    assert_all_features(&ts);
}

#[test]
fn reopen_with_a_new_excerpt_drops_old_waveforms() {
    let ts = TestStore::generated();
    let cluster = ts.largest_cluster();
    let before = ts.waveform_spikes()[&cluster].len();
    let (dir, recording, config) = ts.close();

    let wider = StoreConfig {
        waveforms_n_spikes_max: 6,
        waveforms_excerpt_size: 3,
        ..config
    };
    let mut ts = reopen_from(dir, recording, wider);
    let excerpt = ts.waveform_spikes()[&cluster].clone();
    assert_ne!(excerpt.len(), before);
    assert!(ts.store.waveforms(cluster).unwrap_err().is_missing_field());
    assert!(ts.store.mean_waveforms(cluster).unwrap_err().is_missing_field());

    let report = ts.store.generate().unwrap();
    assert!(report.item("waveforms").unwrap().clusters_generated >= 1);
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 0);
    assert_eq!(ts.store.waveforms(cluster).unwrap(), ts.expected_waveforms(&excerpt));
}

#[test]
fn config_is_persisted_next_to_the_cache() {
    let ts = TestStore::new();
    let persisted = StoreConfig::load(ts.path()).unwrap().unwrap();
    assert_eq!(persisted, ts.config);

    let reopened = StoreBuilder::new(ts.recording.clone())
        .path(ts.path())
        .config()
        .unwrap();
    assert_eq!(reopened, StoreConfig::small());
}
