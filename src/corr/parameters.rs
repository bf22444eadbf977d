// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The fixed parameters of one correlation.
//!
//! A [`CorrelationParameters`] value describes everything the delay and
//! correlation cores need to process slices of one channel set: transform
//! sizes, the signal geometry of the channel, and the participating station
//! streams. It is built once per (job, channel set) by the params layer and
//! shared read-only by every tasklet; nothing here changes while a slice is
//! in flight.

use crate::context::{Polarisation, Sideband};
use crate::corr::window::WindowFunction;
use crate::time::Time;

/// One station stream participating in a correlation. With cross-polarise
/// enabled a station contributes two streams, one per polarisation hand; the
/// stream order fixes the baseline numbering.
#[derive(Debug, Clone)]
pub struct StreamDef {
    /// Index into the job's station list; the output station number.
    pub station: usize,
    /// Index into the observation's channel list this stream decodes.
    pub channel: usize,
    pub polarisation: Polarisation,
    /// Local-oscillator offset of the station \[Hz\].
    pub lo_offset: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelationParameters {
    pub fft_size_delaycor: usize,
    pub fft_size_correlation: usize,
    /// Spectral points written per baseline; divides `fft_size_correlation`.
    pub number_channels: usize,
    pub window: WindowFunction,

    /// \[Hz\]; common to every stream of the set.
    pub sample_rate: u64,
    /// \[Hz\].
    pub bandwidth: f64,
    pub sideband: Sideband,
    /// Sky frequency at the band edge \[Hz\].
    pub channel_freq: f64,
    /// Index of this channel in the observation, for the output records.
    pub channel_index: u8,
    pub bits_per_sample: u8,

    pub integration_time: Time,
    /// Accumulation/progress chunk; equals `integration_time` when no
    /// sub-integration was configured.
    pub sub_integration_time: Time,

    pub streams: Vec<StreamDef>,
    pub cross_polarize: bool,
    /// Resolved index into `streams`' station numbering.
    pub reference_station: Option<usize>,
}

impl CorrelationParameters {
    /// Samples per stream per slice.
    pub fn slice_samples(&self) -> usize {
        self.integration_time.samples(self.sample_rate) as usize
    }

    /// `⌊integration_time · sample_rate / fft_size_correlation⌋`.
    pub fn ffts_per_integration(&self) -> usize {
        ffts_per_integration(
            self.integration_time,
            self.sample_rate,
            self.fft_size_correlation,
        )
    }

    pub fn ffts_per_sub_integration(&self) -> usize {
        ffts_per_integration(
            self.sub_integration_time,
            self.sample_rate,
            self.fft_size_correlation,
        )
    }

    /// `sample_rate / (2 bandwidth)`; 1 for critically sampled data.
    pub fn oversampling(&self) -> usize {
        (self.sample_rate as f64 / (2.0 * self.bandwidth)).round() as usize
    }

    pub fn n_streams(&self) -> usize {
        self.streams.len()
    }
}

pub fn ffts_per_integration(
    integration_time: Time,
    sample_rate: u64,
    fft_size_correlation: usize,
) -> usize {
    (integration_time.samples(sample_rate) / fft_size_correlation as i64) as usize
}
