//! Raw recording access
//!
//! The store never owns the recording's container format. It reads through
//! the [`Recording`] trait, which exposes the per-spike arrays as randomly
//! indexable, read-only data.
//!
//! | Array | Shape |
//! |-------|-------|
//! | `spike_clusters` | `(n_spikes,)` |
//! | `features` | `(n_spikes, n_channels, n_features_per_channel)` |
//! | `masks` | `(n_spikes, n_channels)` |
//! | `waveforms` | `(n_spikes, n_samples_waveforms, n_channels)` |
//! | `channel_positions` | `(n_channels, 2)` |
//!
//! `n_channels` counts the channels that carry features; dead channels are
//! excluded by the recording.

use clusterstore_core::{Result, SpikeId, StoreError};
use ndarray::{s, Array2, Array3, Axis};

/// Read-only access to a spike-sorted recording
pub trait Recording: Send + Sync {
    /// Initial cluster of every spike
    fn spike_clusters(&self) -> Vec<i64>;

    /// Number of spikes
    fn n_spikes(&self) -> usize;

    /// Number of live channels
    fn n_channels(&self) -> usize;

    /// Features per channel
    fn n_features_per_channel(&self) -> usize;

    /// Samples per waveform
    fn n_samples_waveforms(&self) -> usize;

    /// Features of `spikes`, in the order given
    fn read_features(&self, spikes: &[SpikeId]) -> Result<Array3<f32>>;

    /// Masks of `spikes`, in the order given
    fn read_masks(&self, spikes: &[SpikeId]) -> Result<Array2<f32>>;

    /// Waveforms of `spikes`, in the order given
    fn read_waveforms(&self, spikes: &[SpikeId]) -> Result<Array3<f32>>;

    /// Probe geometry of the live channels
    fn channel_positions(&self) -> Array2<f32>;
}

fn check_spikes(spikes: &[SpikeId], n_spikes: usize) -> Result<()> {
    match spikes.iter().find(|&&s| s >= n_spikes) {
        Some(s) => Err(StoreError::InvalidQuery(format!(
            "spike {} is out of range ({} spikes)",
            s, n_spikes
        ))),
        None => Ok(()),
    }
}

/// Extract a waveform window from raw traces
///
/// The window holds `n_samples` samples starting at `sample - n_samples / 2`;
/// samples outside the traces are zero.
pub fn extract_waveform(traces: &Array2<f32>, sample: usize, n_samples: usize) -> Array2<f32> {
    let (n_total, n_channels) = traces.dim();
    let mut out = Array2::zeros((n_samples, n_channels));
    let start = sample as i64 - (n_samples / 2) as i64;
    let end = start + n_samples as i64;
    let a = start.max(0);
    let b = end.min(n_total as i64);
    if a < b {
        let offset = (a - start) as usize;
        out.slice_mut(s![offset..offset + (b - a) as usize, ..])
            .assign(&traces.slice(s![a as usize..b as usize, ..]));
    }
    out
}

/// Where the waveforms of an [`InMemoryRecording`] come from
#[derive(Debug, Clone)]
pub enum WaveformSource {
    /// Waveforms already cut, `(n_spikes, n_samples, n_channels)`
    Precomputed(Array3<f32>),
    /// Cut on demand from `traces[sample, channel]` around each spike sample
    Traces {
        /// Raw traces
        traces: Array2<f32>,
        /// Peak sample of each spike
        spike_samples: Vec<usize>,
        /// Window length
        n_samples: usize,
    },
}

/// Recording held entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    spike_clusters: Vec<i64>,
    features: Array3<f32>,
    masks: Array2<f32>,
    waveforms: WaveformSource,
    channel_positions: Array2<f32>,
}

impl InMemoryRecording {
    /// Build a recording from its arrays
    ///
    /// # Errors
    ///
    /// `InconsistentShape` if the arrays disagree on the spike or channel
    /// count.
    pub fn new(
        spike_clusters: Vec<i64>,
        features: Array3<f32>,
        masks: Array2<f32>,
        waveforms: WaveformSource,
        channel_positions: Array2<f32>,
    ) -> Result<Self> {
        let n_spikes = spike_clusters.len();
        let (nf_spikes, n_channels, n_features) = features.dim();
        let expect = |field: &str, expected: Vec<usize>, actual: &[usize]| -> Result<()> {
            if expected.as_slice() != actual {
                return Err(StoreError::InconsistentShape {
                    field: field.to_string(),
                    expected,
                    actual: actual.to_vec(),
                });
            }
            Ok(())
        };
        expect(
            "features",
            vec![n_spikes, n_channels, n_features],
            &[nf_spikes, n_channels, n_features],
        )?;
        expect("masks", vec![n_spikes, n_channels], masks.shape())?;
        expect("channel_positions", vec![n_channels, 2], channel_positions.shape())?;
        match &waveforms {
            WaveformSource::Precomputed(w) => {
                expect(
                    "waveforms",
                    vec![n_spikes, w.dim().1, n_channels],
                    w.shape(),
                )?;
            }
            WaveformSource::Traces {
                traces,
                spike_samples,
                ..
            } => {
                expect("traces", vec![traces.nrows(), n_channels], traces.shape())?;
                expect("spike_samples", vec![n_spikes], &[spike_samples.len()])?;
            }
        }
        Ok(Self {
            spike_clusters,
            features,
            masks,
            waveforms,
            channel_positions,
        })
    }

    /// All features
    pub fn features(&self) -> &Array3<f32> {
        &self.features
    }

    /// All masks
    pub fn masks(&self) -> &Array2<f32> {
        &self.masks
    }

    /// Waveform source
    pub fn waveform_source(&self) -> &WaveformSource {
        &self.waveforms
    }
}

impl Recording for InMemoryRecording {
    fn spike_clusters(&self) -> Vec<i64> {
        self.spike_clusters.clone()
    }

    fn n_spikes(&self) -> usize {
        self.spike_clusters.len()
    }

    fn n_channels(&self) -> usize {
        self.features.dim().1
    }

    fn n_features_per_channel(&self) -> usize {
        self.features.dim().2
    }

    fn n_samples_waveforms(&self) -> usize {
        match &self.waveforms {
            WaveformSource::Precomputed(w) => w.dim().1,
            WaveformSource::Traces { n_samples, .. } => *n_samples,
        }
    }

    fn read_features(&self, spikes: &[SpikeId]) -> Result<Array3<f32>> {
        check_spikes(spikes, self.n_spikes())?;
        Ok(self.features.select(Axis(0), spikes))
    }

    fn read_masks(&self, spikes: &[SpikeId]) -> Result<Array2<f32>> {
        check_spikes(spikes, self.n_spikes())?;
        Ok(self.masks.select(Axis(0), spikes))
    }

    fn read_waveforms(&self, spikes: &[SpikeId]) -> Result<Array3<f32>> {
        check_spikes(spikes, self.n_spikes())?;
        match &self.waveforms {
            WaveformSource::Precomputed(w) => Ok(w.select(Axis(0), spikes)),
            WaveformSource::Traces {
                traces,
                spike_samples,
                n_samples,
            } => {
                let mut out = Array3::zeros((spikes.len(), *n_samples, traces.ncols()));
                for (i, &spike) in spikes.iter().enumerate() {
                    let wave = extract_waveform(traces, spike_samples[spike], *n_samples);
                    out.index_axis_mut(Axis(0), i).assign(&wave);
                }
                Ok(out)
            }
        }
    }

    fn channel_positions(&self) -> Array2<f32> {
        self.channel_positions.clone()
    }
}
