// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The correlation core.
//!
//! Accumulates one integration of auto- and cross-correlation spectra
//! across every participating stream of one channel. The state machine is
//! Idle → Initialised → Accumulating → Normalising → Writing → Idle, driven
//! by slice boundaries: `begin_integration` zeroes the accumulators, each
//! `do_task` folds in exactly one spectrum per stream, and when the FFT
//! count of the integration is reached the core normalises and builds its
//! output record in one atomic sequence.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};
use ndarray::Array2;
use num_complex::Complex32;

use crate::corr::parameters::CorrelationParameters;
use crate::corr::stats::BitStatistics;
use crate::corr::{CoreError, Spectrum, Tasklet};
use crate::time::Time;

/// Enumerate the baselines of `n_streams` streams in output order: autos
/// first, then the cross block shaped by the reference-station and
/// cross-polarisation settings. With cross-polarisation the streams split
/// into halves of opposite hand and every station pair contributes four
/// combinations.
pub(crate) fn create_baselines(
    n_streams: usize,
    cross_polarize: bool,
    reference: Option<usize>,
) -> Vec<(usize, usize)> {
    let mut baselines = Vec::new();
    for sn in 0..n_streams {
        baselines.push((sn, sn));
    }

    if cross_polarize {
        debug_assert!(n_streams % 2 == 0);
        let half = n_streams / 2;
        match reference {
            Some(r) => {
                for sn in 0..r {
                    baselines.push((sn, r));
                    baselines.push((sn + half, r));
                    baselines.push((sn, r + half));
                    baselines.push((sn + half, r + half));
                }
                for sn in r + 1..half {
                    baselines.push((r, sn));
                    baselines.push((r, sn + half));
                    baselines.push((r + half, sn));
                    baselines.push((r + half, sn + half));
                }
            }
            None => {
                for sn in 0..half.saturating_sub(1) {
                    for sno in sn + 1..half {
                        baselines.push((sn, sno));
                        baselines.push((sn, sno + half));
                        baselines.push((sn + half, sno));
                        baselines.push((sn + half, sno + half));
                    }
                }
            }
        }
    } else {
        match reference {
            Some(r) => {
                for sn in 0..n_streams {
                    if sn != r {
                        baselines.push((sn, r));
                    }
                }
            }
            None => {
                for sn in 0..n_streams.saturating_sub(1) {
                    for sno in sn + 1..n_streams {
                        baselines.push((sn, sno));
                    }
                }
            }
        }
    }
    baselines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
}

/// One finished integration, ready for the output node.
#[derive(Debug)]
pub struct TimesliceRecord {
    /// Global slice-task index; the output node restores this order.
    pub task: usize,
    /// Integration number within the job.
    pub integration: usize,
    pub start: Time,
    pub uvw: Vec<UvwEntry>,
    pub stats: Vec<StatsEntry>,
    pub baselines: Vec<BaselineVis>,
}

#[derive(Debug, Clone, Copy)]
pub struct UvwEntry {
    pub station: i32,
    pub u: f64,
    pub v: f64,
    pub w: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsEntry {
    pub station: u8,
    pub channel_index: u8,
    pub sideband: u8,
    pub polarisation: u8,
    pub levels: [i32; 4],
    pub n_invalid: i32,
}

#[derive(Debug, Clone)]
pub struct BaselineVis {
    pub station1: u8,
    pub station2: u8,
    pub polarisation1: u8,
    pub polarisation2: u8,
    pub sideband: u8,
    pub channel_index: u8,
    pub weight: f32,
    /// `number_channels + 1` spectrally averaged values.
    pub vis: Vec<Complex32>,
}

pub(crate) struct CorrelationCore {
    params: Arc<CorrelationParameters>,
    baselines: Vec<(usize, usize)>,

    /// One row of `fft_size + 1` bins per baseline.
    accum: Array2<Complex32>,
    inputs: Vec<VecDeque<Spectrum>>,

    stream_weights: Vec<f64>,
    stream_shift_invalid: Vec<i64>,
    stats: Vec<BitStatistics>,
    uvw: Vec<UvwEntry>,

    state: State,
    current_fft: usize,
    ffts_per_integration: usize,
    task: usize,
    integration: usize,
    start_time: Time,

    record: Option<TimesliceRecord>,
}

impl CorrelationCore {
    pub(crate) fn new(params: Arc<CorrelationParameters>) -> CorrelationCore {
        let n_streams = params.n_streams();
        let baselines = create_baselines(
            n_streams,
            params.cross_polarize,
            params.reference_station,
        );
        let bins = params.fft_size_correlation + 1;
        let ffts_per_integration = params.ffts_per_integration();
        CorrelationCore {
            accum: Array2::zeros((baselines.len(), bins)),
            inputs: (0..n_streams).map(|_| VecDeque::new()).collect(),
            stream_weights: vec![0.0; n_streams],
            stream_shift_invalid: vec![0; n_streams],
            stats: vec![BitStatistics::new(params.bits_per_sample); n_streams],
            uvw: Vec::new(),
            state: State::Idle,
            current_fft: 0,
            ffts_per_integration,
            task: 0,
            integration: 0,
            start_time: Time::ZERO,
            record: None,
            baselines,
            params,
        }
    }

    /// Zero the accumulators and begin a new integration.
    pub(crate) fn begin_integration(
        &mut self,
        task: usize,
        integration: usize,
        start: Time,
        stats: Vec<BitStatistics>,
        uvw: Vec<UvwEntry>,
    ) {
        debug_assert_eq!(self.state, State::Idle);
        debug_assert_eq!(stats.len(), self.params.n_streams());
        self.accum.fill(Complex32::default());
        self.stream_weights.iter_mut().for_each(|w| *w = 0.0);
        self.stream_shift_invalid.iter_mut().for_each(|n| *n = 0);
        self.stats = stats;
        self.uvw = uvw;
        self.task = task;
        self.integration = integration;
        self.start_time = start;
        self.current_fft = 0;
        self.record = None;
        self.state = State::Accumulating;
    }

    pub(crate) fn feed(&mut self, stream: usize, spectrum: Spectrum) {
        self.inputs[stream].push_back(spectrum);
    }

    pub(crate) fn take_record(&mut self) -> Option<TimesliceRecord> {
        self.record.take()
    }

    pub(crate) fn ffts_done(&self) -> usize {
        self.current_fft
    }

    pub(crate) fn ffts_expected(&self) -> usize {
        self.ffts_per_integration
    }

    /// One FFT step: exactly one spectrum from every stream.
    fn accumulate_step(&mut self) {
        let spectra: Vec<Spectrum> = self
            .inputs
            .iter_mut()
            .map(|q| q.pop_front().expect("has_work checked every queue"))
            .collect();

        for (stream, spectrum) in spectra.iter().enumerate() {
            self.stream_weights[stream] += spectrum.weight as f64;
            self.stream_shift_invalid[stream] += spectrum.n_invalid as i64;
        }

        let n_streams = spectra.len();
        for (bl, &(s1, s2)) in self.baselines.iter().enumerate() {
            let mut row = self.accum.row_mut(bl);
            if bl < n_streams {
                // Autos accumulate as real powers.
                debug_assert_eq!(s1, s2);
                for (out, x) in row.iter_mut().zip(spectra[s1].bins.iter()) {
                    out.re += x.norm_sqr();
                }
            } else {
                for (out, (x, y)) in row
                    .iter_mut()
                    .zip(spectra[s1].bins.iter().zip(spectra[s2].bins.iter()))
                {
                    *out += x * y.conj();
                }
            }
        }

        self.current_fft += 1;
        let ten_pct = (self.ffts_per_integration / 10).max(1);
        if self.current_fft % ten_pct == 0 {
            debug!(
                "integration {}: {} of {} FFTs",
                self.integration, self.current_fft, self.ffts_per_integration
            );
        }
        let per_sub = self.params.ffts_per_sub_integration().max(1);
        if self.current_fft % per_sub == 0 && per_sub < self.ffts_per_integration {
            trace!(
                "integration {}: sub-integration {} accumulated",
                self.integration,
                self.current_fft / per_sub
            );
        }
    }

    /// Per-station norms from the autocorrelations, then divide everything
    /// through. Running this twice is a no-op: after the first pass every
    /// norm evaluates to exactly 1.
    fn normalise(&mut self) {
        let bins = self.params.fft_size_correlation + 1;
        let scale = (self.params.fft_size_correlation / self.params.oversampling()) as f32;
        let n_streams = self.params.n_streams();

        let mut norms = vec![0.0f32; n_streams];
        for (stream, norm) in norms.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for k in 0..bins {
                sum += self.accum[[stream, k]].re;
            }
            *norm = (sum / scale).max(1.0);
        }

        for (bl, &(s1, s2)) in self.baselines.iter().enumerate() {
            let mut row = self.accum.row_mut(bl);
            if bl < n_streams {
                let norm = norms[s1];
                for x in row.iter_mut() {
                    *x = Complex32::new(x.re / norm, 0.0);
                }
            } else {
                let norm = (norms[s1] * norms[s2]).sqrt();
                for x in row.iter_mut() {
                    *x /= norm;
                }
            }
        }
    }

    /// Build the output record: spectral averaging to `number_channels`,
    /// weights, uvw and sampler statistics.
    fn build_record(&mut self) {
        let params = &self.params;
        let m = params.fft_size_correlation;
        let nc = params.number_channels;
        let navg = m / nc;
        let total_ffts = self.ffts_per_integration as f64;

        let stats = self
            .params
            .streams
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let counted = &self.stats[i];
                StatsEntry {
                    station: def.station as u8,
                    channel_index: params.channel_index,
                    sideband: params.sideband.index(),
                    polarisation: def.polarisation.index(),
                    levels: counted.levels(),
                    n_invalid: (counted.n_invalid() + self.stream_shift_invalid[i]) as i32,
                }
            })
            .collect();

        let mut baselines = Vec::with_capacity(self.baselines.len());
        for (bl, &(s1, s2)) in self.baselines.iter().enumerate() {
            let mut vis = Vec::with_capacity(nc + 1);
            for j in 0..nc {
                let mut sum = Complex32::default();
                for k in 0..navg {
                    sum += self.accum[[bl, j * navg + k]];
                }
                vis.push(sum / navg as f32);
            }
            vis.push(self.accum[[bl, m]]);

            let weight =
                (self.stream_weights[s1].min(self.stream_weights[s2]) / total_ffts) as f32;
            let def1 = &params.streams[s1];
            let def2 = &params.streams[s2];
            baselines.push(BaselineVis {
                station1: def1.station as u8,
                station2: def2.station as u8,
                polarisation1: def1.polarisation.index(),
                polarisation2: def2.polarisation.index(),
                sideband: params.sideband.index(),
                channel_index: params.channel_index,
                weight: weight.clamp(0.0, 1.0),
                vis,
            });
        }

        self.record = Some(TimesliceRecord {
            task: self.task,
            integration: self.integration,
            start: self.start_time,
            uvw: std::mem::take(&mut self.uvw),
            stats,
            baselines,
        });
    }
}

impl Tasklet for CorrelationCore {
    fn has_work(&self) -> bool {
        self.state == State::Accumulating
            && self.current_fft < self.ffts_per_integration
            && self.inputs.iter().all(|q| !q.is_empty())
    }

    fn do_task(&mut self) -> Result<(), CoreError> {
        self.accumulate_step();

        if self.current_fft == self.ffts_per_integration {
            // Normalise and emit in one atomic sequence.
            self.normalise();
            self.build_record();
            self.state = State::Idle;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::context::{Polarisation, Sideband};
    use crate::corr::parameters::StreamDef;
    use crate::corr::window::WindowFunction;
    use crate::pool::Pool;

    #[test]
    fn baselines_with_reference_station() {
        // Four stations, reference 0, no cross-polarisation.
        let bl = create_baselines(4, false, Some(0));
        assert_eq!(
            bl,
            vec![(0, 0), (1, 1), (2, 2), (3, 3), (1, 0), (2, 0), (3, 0)]
        );
    }

    #[test]
    fn baselines_all_pairs() {
        let bl = create_baselines(3, false, None);
        assert_eq!(bl, vec![(0, 0), (1, 1), (2, 2), (0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn baselines_cross_polarised() {
        // Streams [L0, L1, R0, R1]: the cross block holds the four
        // combinations of the single station pair.
        let bl = create_baselines(4, true, None);
        let crosses: Vec<_> = bl[4..].to_vec();
        assert_eq!(crosses, vec![(0, 1), (0, 3), (2, 1), (2, 3)]);
    }

    #[test]
    fn baselines_cross_polarised_with_reference() {
        let bl = create_baselines(4, true, Some(0));
        assert_eq!(bl[..4], [(0, 0), (1, 1), (2, 2), (3, 3)]);
        assert_eq!(bl[4..], [(0, 1), (0, 3), (2, 1), (2, 3)]);
    }

    fn test_params(n_streams: usize, m: usize, ffts: usize) -> Arc<CorrelationParameters> {
        let rate = 1_000_000;
        Arc::new(CorrelationParameters {
            fft_size_delaycor: m.min(64),
            fft_size_correlation: m,
            number_channels: m,
            window: WindowFunction::None,
            sample_rate: rate,
            bandwidth: rate as f64 / 2.0,
            sideband: Sideband::Upper,
            channel_freq: 0.0,
            channel_index: 3,
            bits_per_sample: 2,
            integration_time: Time::of_samples((ffts * m) as i64, rate),
            sub_integration_time: Time::of_samples((ffts * m) as i64, rate),
            streams: (0..n_streams)
                .map(|station| StreamDef {
                    station,
                    channel: 0,
                    polarisation: Polarisation::R,
                    lo_offset: 0.0,
                })
                .collect(),
            cross_polarize: false,
            reference_station: None,
        })
    }

    fn spectrum_from(pool: &Pool<Complex32>, values: &[Complex32]) -> Spectrum {
        let mut bins = pool.acquire().unwrap();
        bins.copy_from_slice(values);
        Spectrum {
            start: Time::ZERO,
            bins,
            weight: 1.0,
            n_invalid: 0,
        }
    }

    fn run_integration(
        core: &mut CorrelationCore,
        pool: &Pool<Complex32>,
        per_fft: impl Fn(usize, usize) -> Vec<Complex32>,
        ffts: usize,
        n_streams: usize,
    ) -> TimesliceRecord {
        core.begin_integration(
            0,
            0,
            Time::ZERO,
            vec![BitStatistics::new(2); n_streams],
            vec![],
        );
        for fft in 0..ffts {
            for stream in 0..n_streams {
                core.feed(stream, spectrum_from(pool, &per_fft(fft, stream)));
            }
            while core.has_work() {
                core.do_task().unwrap();
            }
        }
        core.take_record().expect("integration complete")
    }

    #[test]
    fn autos_are_real_and_crosses_conjugate() {
        let m = 8;
        let ffts = 4;
        let params = test_params(2, m, ffts);
        let mut core = CorrelationCore::new(Arc::clone(&params));
        let pool = Pool::new(m + 1, 16);

        let record = run_integration(
            &mut core,
            &pool,
            |fft, stream| {
                (0..=m)
                    .map(|k| {
                        Complex32::new(
                            (fft + k) as f32 * 0.1 + stream as f32,
                            k as f32 * 0.2 - stream as f32,
                        )
                    })
                    .collect()
            },
            ffts,
            2,
        );

        for auto in &record.baselines[..2] {
            for v in &auto.vis {
                assert_eq!(v.im, 0.0);
                assert!(v.re >= 0.0);
            }
        }
        assert_abs_diff_eq!(record.baselines[2].weight, 1.0);
    }

    #[test]
    fn swapping_streams_conjugates_the_visibility() {
        let m = 8;
        let ffts = 2;
        let pool = Pool::new(m + 1, 16);
        let gen = |fft: usize, stream: usize| -> Vec<Complex32> {
            (0..=m)
                .map(|k| {
                    Complex32::new(
                        ((fft * 31 + k * 7 + stream * 3) % 5) as f32 - 2.0,
                        ((fft * 17 + k * 11 + stream * 5) % 7) as f32 - 3.0,
                    )
                })
                .collect()
        };

        let params = test_params(2, m, ffts);
        let mut core = CorrelationCore::new(Arc::clone(&params));
        let forward = run_integration(&mut core, &pool, gen, ffts, 2);

        // The same inputs with the stream roles exchanged.
        let mut core = CorrelationCore::new(params);
        let swapped = run_integration(
            &mut core,
            &pool,
            |fft, stream| gen(fft, 1 - stream),
            ffts,
            2,
        );

        for (a, b) in forward.baselines[2]
            .vis
            .iter()
            .zip(&swapped.baselines[2].vis)
        {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-4);
            assert_abs_diff_eq!(a.im, -b.im, epsilon = 1e-4);
        }
    }

    #[test]
    fn normalise_is_idempotent() {
        let m = 8;
        let ffts = 3;
        let params = test_params(2, m, ffts);
        let mut core = CorrelationCore::new(Arc::clone(&params));
        let pool = Pool::new(m + 1, 16);
        core.begin_integration(0, 0, Time::ZERO, vec![BitStatistics::new(2); 2], vec![]);
        for _ in 0..ffts {
            for stream in 0..2 {
                let vals: Vec<Complex32> = (0..=m)
                    .map(|k| Complex32::new(1.5 + k as f32, (stream as f32) - 0.5))
                    .collect();
                core.feed(stream, spectrum_from(&pool, &vals));
            }
            while core.has_work() {
                core.do_task().unwrap();
            }
        }
        assert!(core.take_record().is_some());

        let after_first = core.accum.clone();
        core.normalise();
        for (a, b) in core.accum.iter().zip(after_first.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-5);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-5);
        }
    }

    #[test]
    fn spectral_averaging_halves_the_bins() {
        let m = 8;
        let ffts = 1;
        let mut params = test_params(1, m, ffts);
        Arc::get_mut(&mut params).unwrap().number_channels = 4;
        let mut core = CorrelationCore::new(Arc::clone(&params));
        let pool = Pool::new(m + 1, 16);

        let record = run_integration(
            &mut core,
            &pool,
            |_, _| (0..=m).map(|k| Complex32::new(k as f32, 0.0)).collect(),
            ffts,
            1,
        );

        let auto = &record.baselines[0];
        assert_eq!(auto.vis.len(), 5);
        // Powers k^2 averaged in pairs, normalised by sum/ (m / oversampling).
        let raw: Vec<f32> = (0..=m).map(|k| (k * k) as f32).collect();
        let norm = (raw.iter().sum::<f32>() / m as f32).max(1.0);
        for (j, v) in auto.vis.iter().take(4).enumerate() {
            let expected = (raw[2 * j] + raw[2 * j + 1]) / 2.0 / norm;
            assert_abs_diff_eq!(v.re, expected, epsilon = 1e-4);
        }
        assert_abs_diff_eq!(auto.vis[4].re, raw[m] / norm, epsilon = 1e-4);
    }

    #[test]
    fn weight_tracks_the_weaker_stream() {
        let m = 8;
        let ffts = 4;
        let params = test_params(2, m, ffts);
        let mut core = CorrelationCore::new(Arc::clone(&params));
        let pool = Pool::new(m + 1, 16);

        core.begin_integration(0, 0, Time::ZERO, vec![BitStatistics::new(2); 2], vec![]);
        for fft in 0..ffts {
            for stream in 0..2 {
                let mut s = spectrum_from(&pool, &vec![Complex32::new(1.0, 0.0); m + 1]);
                // Stream 1's recording ends halfway through.
                if stream == 1 && fft >= 2 {
                    s.weight = 0.0;
                }
                core.feed(stream, s);
            }
            while core.has_work() {
                core.do_task().unwrap();
            }
        }
        let record = core.take_record().unwrap();
        assert_abs_diff_eq!(record.baselines[0].weight, 1.0);
        assert_abs_diff_eq!(record.baselines[2].weight, 0.5);
    }
}
