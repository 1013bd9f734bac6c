//! Seeded mock recordings for tests and benchmarks
//!
//! The probe has `n_channels` channels of which the last two are dead: they
//! appear in the traces but carry no features, masks or waveforms.

use crate::recording::{InMemoryRecording, WaveformSource};
use clusterstore_core::{Result, StoreError};
use ndarray::{Array, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Channels excluded from features and masks
pub const DEAD_CHANNELS: usize = 2;

/// Builder for a random [`InMemoryRecording`]
#[derive(Debug, Clone)]
pub struct MockRecording {
    n_clusters: usize,
    n_spikes: usize,
    n_channels: usize,
    n_features_per_channel: usize,
    n_samples_traces: usize,
    n_samples_waveforms: usize,
    from_traces: bool,
    seed: u64,
}

impl Default for MockRecording {
    fn default() -> Self {
        Self {
            n_clusters: 5,
            n_spikes: 100,
            n_channels: 28,
            n_features_per_channel: 2,
            n_samples_traces: 10_000,
            n_samples_waveforms: 40,
            from_traces: false,
            seed: 42,
        }
    }
}

impl MockRecording {
    /// Default mock: 5 clusters, 100 spikes, 28 channels, 2 features
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clusters
    pub fn n_clusters(mut self, n: usize) -> Self {
        self.n_clusters = n;
        self
    }

    /// Number of spikes
    pub fn n_spikes(mut self, n: usize) -> Self {
        self.n_spikes = n;
        self
    }

    /// Channels on the probe, dead ones included
    pub fn n_channels(mut self, n: usize) -> Self {
        self.n_channels = n;
        self
    }

    /// Features per channel
    pub fn n_features_per_channel(mut self, n: usize) -> Self {
        self.n_features_per_channel = n;
        self
    }

    /// Samples in the raw traces
    pub fn n_samples_traces(mut self, n: usize) -> Self {
        self.n_samples_traces = n;
        self
    }

    /// Samples per waveform
    pub fn n_samples_waveforms(mut self, n: usize) -> Self {
        self.n_samples_waveforms = n;
        self
    }

    /// Cut waveforms from random traces instead of storing them
    pub fn from_traces(mut self, yes: bool) -> Self {
        self.from_traces = yes;
        self
    }

    /// RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Live channels of the generated recording
    pub fn n_live_channels(&self) -> usize {
        self.n_channels.saturating_sub(DEAD_CHANNELS)
    }

    /// Generate the recording
    ///
    /// Every cluster gets at least one spike.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if there are fewer spikes than clusters, no live
    /// channel, or no trace samples.
    pub fn build(&self) -> Result<InMemoryRecording> {
        if self.n_clusters == 0 || self.n_spikes < self.n_clusters {
            return Err(StoreError::InvalidConfig(format!(
                "mock needs at least one spike per cluster ({} spikes, {} clusters)",
                self.n_spikes, self.n_clusters
            )));
        }
        if self.n_channels <= DEAD_CHANNELS {
            return Err(StoreError::InvalidConfig(format!(
                "mock needs more than {} channels",
                DEAD_CHANNELS
            )));
        }
        if self.n_samples_traces == 0 {
            return Err(StoreError::InvalidConfig(
                "mock needs trace samples".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_spikes;
        let nc = self.n_live_channels();
        let nf = self.n_features_per_channel;
        let ns = self.n_samples_waveforms;

        let mut spike_clusters: Vec<i64> = (0..n)
            .map(|i| {
                if i < self.n_clusters {
                    i as i64
                } else {
                    rng.gen_range(0..self.n_clusters) as i64
                }
            })
            .collect();
        spike_clusters.shuffle(&mut rng);

        let features = Array::from_shape_fn((n, nc, nf), |(s, _, _)| {
            spike_clusters[s] as f32 + rng.gen_range(-0.5f32..0.5)
        });
        let masks = Array::from_shape_fn((n, nc), |_| {
            if rng.gen_bool(0.3) {
                0.0
            } else {
                rng.gen_range(0.0f32..1.0)
            }
        });
        let positions =
            Array::from_shape_fn((nc, 2), |(c, k)| if k == 0 { 0.0 } else { c as f32 * 10.0 });

        let waveforms = if self.from_traces {
            let mut spike_samples: Vec<usize> = (0..n)
                .map(|_| rng.gen_range(0..self.n_samples_traces))
                .collect();
            spike_samples.sort_unstable();
            // Dead channels are recorded but dropped before extraction.
            let raw: Array2<f32> =
                Array::from_shape_fn((self.n_samples_traces, self.n_channels), |_| {
                    rng.gen_range(-1.0f32..1.0)
                });
            let traces = raw.slice(ndarray::s![.., ..nc]).to_owned();
            WaveformSource::Traces {
                traces,
                spike_samples,
                n_samples: ns,
            }
        } else {
            WaveformSource::Precomputed(Array::from_shape_fn((n, ns, nc), |(s, _, _)| {
                spike_clusters[s] as f32 + rng.gen_range(-1.0f32..1.0)
            }))
        };

        InMemoryRecording::new(spike_clusters, features, masks, waveforms, positions)
    }
}
