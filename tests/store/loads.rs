//! Load Tests
//!
//! Loads by cluster and by spike follow the caller's order.

use crate::common::*;
use ndarray::{concatenate, Axis};

#[test]
fn load_by_clusters_follows_caller_order() {
    let ts = TestStore::generated();

    let forward = ts.store.load("features", &Query::clusters(vec![1, 3])).unwrap();
    let reverse = ts.store.load("features", &Query::clusters(vec![3, 1])).unwrap();

    let f1 = ts.store.features(1).unwrap().into_dyn();
    let f3 = ts.store.features(3).unwrap().into_dyn();
    assert_eq!(forward, concatenate(Axis(0), &[f1.view(), f3.view()]).unwrap());
    assert_eq!(reverse, concatenate(Axis(0), &[f3.view(), f1.view()]).unwrap());
    assert_ne!(forward, reverse);
}

#[test]
fn load_by_spikes_follows_caller_order() {
    let ts = TestStore::generated();
    let spikes = vec![57, 3, 98, 0, 41];

    let masks = ts.store.load("masks", &Query::spikes(spikes.clone())).unwrap();
    assert_eq!(masks, ts.expected_masks(&spikes).into_dyn());

    let features = ts.store.load_spikes("features", &spikes).unwrap();
    assert_eq!(features, ts.expected_features(&spikes).into_dyn());
}

#[test]
fn waveforms_by_spike_only_inside_the_excerpt() {
    let ts = TestStore::generated();
    let cluster = ts.largest_cluster();
    let kept = ts.waveform_spikes()[&cluster].clone();

    let picked = vec![kept[kept.len() - 1], kept[0]];
    let loaded = ts.store.load_spikes("waveforms", &picked).unwrap();
    assert_eq!(loaded, ts.expected_waveforms(&picked).into_dyn());

    let dropped = ts
        .spikes(cluster)
        .into_iter()
        .find(|s| !kept.contains(s))
        .expect("largest cluster exceeds the excerpt");
    assert!(matches!(
        ts.store.load_spikes("waveforms", &[dropped]),
        Err(StoreError::InvalidQuery(_))
    ));
}

#[test]
fn statistics_stack_per_cluster() {
    let ts = TestStore::generated();
    let stacked = ts.store.load_clusters("mean_masks", &[4, 0]).unwrap();
    assert_eq!(stacked.shape(), &[2, 26]);
    assert_eq!(
        stacked.index_axis(Axis(0), 0),
        ts.store.mean_masks(4).unwrap().into_dyn().view()
    );

    let counts = ts.store.load_clusters("n_unmasked_channels", &[0, 1, 2]).unwrap();
    assert_eq!(counts.shape(), &[3]);
}

#[test]
fn malformed_queries_are_rejected() {
    let ts = TestStore::generated();

    let both = Query::clusters(vec![0]).with_spikes(vec![1]);
    assert!(matches!(
        ts.store.load("features", &both),
        Err(StoreError::InvalidQuery(_))
    ));
    assert!(matches!(
        ts.store.load("features", &Query::default()),
        Err(StoreError::InvalidQuery(_))
    ));
    assert!(matches!(
        ts.store.load_spikes("features", &[100]),
        Err(StoreError::InvalidQuery(_))
    ));
    assert!(matches!(
        ts.store.load_clusters("features", &[42]),
        Err(StoreError::InvalidQuery(_))
    ));
    assert!(ts.store.load_clusters("velocity", &[0]).unwrap_err().is_missing_field());
}

#[test]
fn empty_selections() {
    let ts = TestStore::generated();
    let rows = ts.store.load_clusters("features", &[]).unwrap();
    assert_eq!(rows.shape(), &[0, 26, 2]);
    let rows = ts.store.load_spikes("masks", &[]).unwrap();
    assert_eq!(rows.shape(), &[0, 26]);
}

#[test]
fn selection_index_is_cluster_relative() {
    let ts = TestStore::generated();
    let selection = ts.store.select(&[2, 0]).unwrap();

    let n2 = ts.spikes(2).len();
    let n0 = ts.spikes(0).len();
    assert_eq!(selection.len(), n2 + n0);
    assert_eq!(&selection.spikes[..n2], ts.spikes(2).as_slice());
    assert!(selection.spike_clusters_rel[..n2].iter().all(|&r| r == 0));
    assert!(selection.spike_clusters_rel[n2..].iter().all(|&r| r == 1));
}

#[test]
fn spike_selection_maps_to_cluster_positions() {
    let ts = TestStore::generated();
    let s0 = ts.spikes(0)[0];
    let s3 = ts.spikes(3)[0];
    let rel = ts.store.relative_cluster_index(&[s3, s0, s3], &[0, 3]).unwrap();
    assert_eq!(rel, vec![1, 0, 1]);

    let outside = ts.spikes(4)[0];
    assert!(matches!(
        ts.store.relative_cluster_index(&[outside], &[0, 3]),
        Err(StoreError::InvalidQuery(_))
    ));
}
