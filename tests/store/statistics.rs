//! Statistics Tests
//!
//! Memory-tier statistics are computed on first access and cached.

use crate::common::*;
use clusterstore::FieldSpec;
use ndarray::{ArrayD, Axis, IxDyn};
use std::sync::atomic::{AtomicUsize, Ordering};

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

// ============================================================================
// Built-in statistics
// ============================================================================

#[test]
fn mean_masks_matches_recording() {
    let ts = TestStore::generated();
    for cluster in ts.store.clusters() {
        let expected = ts
            .expected_masks(&ts.spikes(cluster))
            .mean_axis(Axis(0))
            .unwrap();
        let actual = ts.store.mean_masks(cluster).unwrap();
        assert_eq!(actual.len(), 26);
        assert!(actual.iter().zip(expected.iter()).all(|(a, b)| close(*a, *b)));
    }
}

#[test]
fn mean_waveforms_averages_the_excerpt() {
    let ts = TestStore::generated();
    let cluster = ts.largest_cluster();
    let kept = ts.waveform_spikes()[&cluster].clone();
    let expected = ts.expected_waveforms(&kept).mean_axis(Axis(0)).unwrap();
    let actual = ts.store.mean_waveforms(cluster).unwrap();
    assert_eq!(actual.shape(), expected.shape());
    assert!(actual.iter().zip(expected.iter()).all(|(a, b)| close(*a, *b)));
}

#[test]
fn channel_statistics_follow_mean_masks() {
    let ts = TestStore::generated();
    let cluster = ts.largest_cluster();
    let mm = ts.store.mean_masks(cluster).unwrap();

    let main = ts.store.main_channels(cluster).unwrap();
    assert_eq!(main.len(), 26);
    assert!(main.windows(2).all(|w| mm[w[0]] >= mm[w[1]]));

    let unmasked = ts.store.n_unmasked_channels(cluster).unwrap();
    assert_eq!(unmasked, mm.iter().filter(|&&m| m > 0.1).count());

    // Channels sit at (0, 10 * c).
    let pos = ts.store.mean_probe_position(cluster).unwrap();
    let weighted: f32 = mm.iter().enumerate().map(|(c, m)| m * c as f32 * 10.0).sum();
    let expected_y = weighted / mm.sum().max(1.0);
    assert_eq!(pos.len(), 2);
    assert!(close(pos[0], 0.0));
    assert!(close(pos[1], expected_y));

    let features = ts.store.mean_features(cluster).unwrap();
    assert_eq!(features.shape(), &[26, 2]);
}

#[test]
fn statistics_need_their_backing_fields() {
    let ts = TestStore::new();
    let err = ts.store.mean_masks(0).unwrap_err();
    assert!(err.is_missing_field());
    assert_eq!(
        ts.store.field_state(0, "mean_masks").unwrap(),
        FieldState::Ungenerated
    );
}

// ============================================================================
// Custom statistics
// ============================================================================

#[test]
fn statistic_registered_after_generate_works_immediately() {
    let mut ts = TestStore::generated();
    ts.store
        .add_statistic(
            "n_spikes",
            |store: &ClusterStore, cluster: ClusterId| -> Result<ArrayD<f32>> {
                let n = store.spike_index().n_spikes(cluster);
                Ok(ArrayD::from_elem(IxDyn(&[]), n as f32))
            },
        )
        .unwrap();

    let report = ts.store.generate().unwrap();
    assert_eq!(report.clusters_generated(), 0);
    for cluster in ts.store.clusters() {
        let value = ts.store.statistic("n_spikes", cluster).unwrap();
        assert_eq!(value.shape(), &[] as &[usize]);
        assert_eq!(value.sum() as usize, ts.spikes(cluster).len());
    }
}

#[test]
fn duplicate_statistic_is_rejected() {
    let mut ts = TestStore::new();
    let err = ts
        .store
        .add_statistic(
            "mean_masks",
            |_: &ClusterStore, _: ClusterId| -> Result<ArrayD<f32>> {
                Ok(ArrayD::zeros(IxDyn(&[1])))
            },
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig(_)));
}

#[test]
fn declared_shape_is_enforced() {
    let mut ts = TestStore::generated();
    ts.store
        .statistics_mut()
        .unwrap()
        .add_with_spec(
            FieldSpec::memory("peak", &[3]),
            |_: &ClusterStore, _: ClusterId| -> Result<ArrayD<f32>> {
                Ok(ArrayD::zeros(IxDyn(&[4])))
            },
        )
        .unwrap();
    ts.store.register_field("peak", "statistics").unwrap();

    let err = ts.store.statistic("peak", 0).unwrap_err();
    assert!(matches!(err, StoreError::InconsistentShape { .. }));
    assert_eq!(
        ts.store.field_state(0, "peak").unwrap(),
        FieldState::Ungenerated
    );
}

#[test]
fn concurrent_gets_compute_once() {
    let mut ts = TestStore::generated();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    ts.store
        .add_statistic(
            "slow_sum",
            move |store: &ClusterStore, cluster: ClusterId| -> Result<ArrayD<f32>> {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                let total = store.features(cluster)?.sum();
                Ok(ArrayD::from_elem(IxDyn(&[1]), total))
            },
        )
        .unwrap();

    let store = &ts.store;
    let values: Vec<ArrayD<f32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| store.statistic("slow_sum", 2).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(values.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.field_state(2, "slow_sum").unwrap(), FieldState::Cached);
}
