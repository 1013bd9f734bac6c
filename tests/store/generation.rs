//! Generation Tests
//!
//! Chunked bulk generation of the disk-tier fields.

use crate::common::*;
use std::sync::atomic::Ordering;

// ============================================================================
// Round-trip against the recording
// ============================================================================

#[test]
fn features_match_recording_for_every_cluster() {
    let ts = TestStore::generated();

    for cluster in ts.store.clusters() {
        let spikes = ts.spikes(cluster);
        let features = ts.store.features(cluster).unwrap();
        assert_eq!(features.shape(), &[spikes.len(), 26, 2]);
        assert_eq!(features, ts.expected_features(&spikes));

        let masks = ts.store.masks(cluster).unwrap();
        assert_eq!(masks, ts.expected_masks(&spikes));
    }
}

#[test]
fn waveforms_hold_exactly_the_excerpt() {
    let ts = TestStore::generated();
    let excerpt = ts.waveform_spikes();

    for cluster in ts.store.clusters() {
        let all = ts.spikes(cluster);
        let kept = &excerpt[&cluster];
        if all.len() <= 5 {
            assert_eq!(kept, &all);
        } else {
            assert!(kept.len() < all.len());
            assert!(kept.len() <= 5);
            assert!(kept.windows(2).all(|w| w[0] < w[1]));
            assert!(kept.iter().all(|s| all.contains(s)));
        }
        let waveforms = ts.store.waveforms(cluster).unwrap();
        assert_eq!(waveforms, ts.expected_waveforms(kept));
    }
}

#[test]
fn excerpt_of_twenty_spikes_is_evenly_spaced() {
    // One cluster of 20 spikes next to two small ones.
    let mut spike_clusters = vec![7i64; 20];
    spike_clusters.extend([1, 2]);
    let n = spike_clusters.len();
    let rec = InMemoryRecording::new(
        spike_clusters,
        ndarray::Array3::zeros((n, 3, 1)),
        ndarray::Array2::ones((n, 3)),
        clusterstore::layers::engine::WaveformSource::Precomputed(ndarray::Array3::from_shape_fn(
            (n, 4, 3),
            |(s, _, _)| s as f32,
        )),
        ndarray::Array2::zeros((3, 2)),
    )
    .unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let mut store = create_store(Arc::new(rec), dir.path(), StoreConfig::small()).unwrap();
    store.generate().unwrap();

    let kept = store.waveforms_item().unwrap().spikes(7).unwrap().to_vec();
    assert_eq!(kept, vec![0, 1, 18, 19]);
    let waveforms = store.waveforms(7).unwrap();
    assert_eq!(waveforms.shape(), &[4, 4, 3]);
    let first_samples: Vec<f32> = waveforms.outer_iter().map(|w| w[[0, 0]]).collect();
    assert_eq!(first_samples, vec![0.0, 1.0, 18.0, 19.0]);
}

#[test]
fn waveforms_from_traces() {
    let mut ts = TestStore::with(
        MockRecording::new().from_traces(true).n_samples_waveforms(12),
        StoreConfig::small(),
    );
    ts.store.generate().unwrap();
    let cluster = ts.largest_cluster();
    let kept = ts.waveform_spikes()[&cluster].clone();
    assert_eq!(ts.store.waveforms(cluster).unwrap(), ts.expected_waveforms(&kept));
    assert_eq!(ts.store.mean_waveforms(cluster).unwrap().shape(), &[12, 26]);
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn second_generate_is_a_no_op() {
    let mut ts = TestStore::generated();
    let len_before = std::fs::metadata(ts.chunk_file("features")).unwrap().len();

    let report = ts.store.generate().unwrap();
    assert_eq!(generated(&report), 0);
    assert_eq!(report.item("features_masks").unwrap().clusters_skipped, 5);
    assert_eq!(report.item("waveforms").unwrap().clusters_skipped, 5);
    assert_eq!(report.spikes_written(), 0);

    let len_after = std::fs::metadata(ts.chunk_file("features")).unwrap().len();
    assert_eq!(len_before, len_after);
}

#[test]
fn report_lists_items_in_dependency_order() {
    let mut ts = TestStore::new();
    let report = ts.store.generate().unwrap();
    let names: Vec<&str> = report.items.iter().map(|i| i.item.as_str()).collect();
    assert_eq!(names, vec!["features_masks", "waveforms", "statistics"]);
    assert_eq!(report.item("features_masks").unwrap().clusters_generated, 5);
    assert!(!report.cancelled);
    assert!(report.summary().starts_with("features_masks: 5 generated"));
}

#[test]
fn observer_sees_every_chunk() {
    let mut ts = TestStore::new();
    let mut chunks: Vec<(String, usize, usize)> = Vec::new();
    ts.store
        .generate_with(&mut |p| {
            chunks.push((p.item.to_string(), p.chunk.chunk, p.chunk.n_chunks));
            ChunkControl::Continue
        })
        .unwrap();

    // 100 spikes in chunks of 15
    let fm: Vec<_> = chunks.iter().filter(|c| c.0 == "features_masks").collect();
    assert_eq!(fm.len(), 7);
    assert!(fm.iter().all(|c| c.2 == 7));
    assert!(chunks.iter().any(|c| c.0 == "waveforms"));
}

// ============================================================================
// Interrupted generation
// ============================================================================

#[test]
fn cancelled_generation_keeps_sealed_clusters() {
    let mut ts = TestStore::new();
    let report = ts.store.generate_with(&mut stop_after(3)).unwrap();
    assert!(report.cancelled);
    assert!(report.item("waveforms").is_none());

    let cached: Vec<ClusterId> = ts
        .store
        .clusters()
        .into_iter()
        .filter(|&c| ts.store.field_state(c, "features").unwrap() == FieldState::Cached)
        .collect();
    assert!(cached.len() < 5);
    for &c in &cached {
        assert_eq!(ts.store.features(c).unwrap(), ts.expected_features(&ts.spikes(c)));
    }

    let report = ts.store.generate().unwrap();
    assert_eq!(
        report.item("features_masks").unwrap().clusters_skipped,
        cached.len()
    );
    for c in ts.store.clusters() {
        assert_eq!(ts.store.features(c).unwrap(), ts.expected_features(&ts.spikes(c)));
    }
}

#[test]
fn io_failure_mid_generation_is_recoverable() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let inner = Arc::new(MockRecording::new().build().unwrap());
    let flaky = Arc::new(FlakyRecording::new(inner.clone(), 4));
    let mut store = create_store(flaky.clone(), dir.path(), StoreConfig::small()).unwrap();

    let err = store.generate().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(flaky.fail_after.load(Ordering::SeqCst), 0);

    // Chunks read before the failure stay on disk for the clusters they
    // completed.
    let sealed = store
        .clusters()
        .into_iter()
        .filter(|&c| store.field_state(c, "features").unwrap() == FieldState::Cached)
        .count();

    flaky.heal();
    let report = store.generate().unwrap();
    assert_eq!(report.item("features_masks").unwrap().clusters_skipped, sealed);
    assert_eq!(
        report.item("features_masks").unwrap().clusters_generated,
        5 - sealed
    );

    for c in store.clusters() {
        let spikes = store.spike_index().spikes(c).unwrap().to_vec();
        assert_eq!(
            store.features(c).unwrap(),
            inner.features().select(ndarray::Axis(0), &spikes)
        );
    }
}
