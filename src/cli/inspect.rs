// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `inspect` subcommand: a human-readable dump of a visibility file.
//!
//! For every timeslice it prints the sampler statistics and, per cross
//! baseline, the fringe found by inverse-transforming the visibility
//! spectrum to the lag domain: amplitude, signal-to-noise against the
//! off-fringe lags, and the lag offset in samples.

use std::path::PathBuf;

use clap::Parser;
use num_complex::Complex32;
use realfft::RealFftPlanner;

use crate::cli::FxcorrError;
use crate::io::read::{FileBaseline, VisReader};

/// Fraction of lags around the fringe peak excluded from the noise
/// estimate.
const FRINGE_GUARD: f64 = 0.05;

#[derive(Parser, Debug)]
pub(super) struct InspectArgs {
    /// Path to a correlator output file.
    #[clap(name = "COR_FILE", parse(from_os_str))]
    file: PathBuf,

    /// Print only the global header and timeslice count.
    #[clap(long)]
    summary: bool,
}

impl InspectArgs {
    pub(super) fn run(self) -> Result<(), FxcorrError> {
        let (mut reader, header) = VisReader::open(&self.file)?;
        let h = header.start_sec_of_day / 3600;
        let m = (header.start_sec_of_day % 3600) / 60;
        let s = header.start_sec_of_day % 60;
        println!(
            "Experiment {}, fxcorr version = {}, date = {}y{:03}d{h}h{m}m{s}s, \
             nchan = {}, stations = {}, integration = {} us",
            header.experiment,
            header.software_tag,
            header.start_year,
            header.start_day,
            header.number_channels,
            header.n_stations,
            header.integration_time_usec,
        );

        let mut planner = RealFftPlanner::<f32>::new();
        let lag_transform = planner.plan_fft_inverse(2 * header.number_channels);

        let mut n_slices = 0usize;
        while let Some(slice) = reader.next_timeslice()? {
            n_slices += 1;
            if self.summary {
                continue;
            }
            println!("---------- time slice {} ----------", slice.integration);
            for stat in &slice.stats {
                let total: i64 = stat.levels.iter().map(|&l| l as i64).sum::<i64>()
                    + stat.n_invalid as i64;
                let total = total.max(1) as f64;
                let frac: Vec<f64> =
                    stat.levels.iter().map(|&l| l as f64 / total).collect();
                println!(
                    "station {:2} freq {} sb {} pol {}, levels: \
                     --={:.3} -+={:.3} +-={:.3} ++={:.3} invalid={:.3}",
                    stat.station,
                    stat.channel_index,
                    stat.sideband,
                    stat.polarisation,
                    frac[0],
                    frac[1],
                    frac[2],
                    frac[3],
                    stat.n_invalid as f64 / total,
                );
            }
            for baseline in &slice.baselines {
                if baseline.station1 == baseline.station2 {
                    continue;
                }
                let (amplitude, snr, offset) = fringe_stats(baseline, &*lag_transform);
                println!(
                    "baseline {}-{} freq {} sb {} pol {}{}: fringe ampl = {:.6}, \
                     SNR = {:.2}, offset = {} samples, weight = {:.4}",
                    baseline.station1,
                    baseline.station2,
                    baseline.channel_index,
                    baseline.sideband,
                    baseline.polarisation1,
                    baseline.polarisation2,
                    amplitude,
                    snr,
                    offset,
                    baseline.weight,
                );
            }
        }
        if self.summary {
            println!("{n_slices} timeslices");
        }
        Ok(())
    }
}

/// Fringe amplitude, SNR and lag offset of one visibility spectrum.
fn fringe_stats(
    baseline: &FileBaseline,
    lag_transform: &dyn realfft::ComplexToReal<f32>,
) -> (f64, f64, i64) {
    let nc = baseline.vis.len() - 1;
    let mut spectrum: Vec<Complex32> = baseline.vis.clone();
    // The lag transform treats the spectrum as that of a real series.
    spectrum[0].im = 0.0;
    spectrum[nc].im = 0.0;
    let mut lags = vec![0.0f32; 2 * nc];
    let mut scratch = lag_transform.make_scratch_vec();
    lag_transform
        .process_with_scratch(&mut spectrum, &mut lags, &mut scratch)
        .expect("lag buffer lengths match the plan");

    // Shift zero lag to the middle and take magnitudes.
    lags.rotate_right(nc);
    let lags: Vec<f64> = lags.iter().map(|&x| (x as f64 / (2 * nc) as f64).abs()).collect();

    let n = lags.len();
    let peak_pos = lags
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let peak = lags[peak_pos];

    let guard = ((n as f64 * FRINGE_GUARD).round() as usize).max(1);
    let lo = peak_pos.saturating_sub(guard);
    let hi = (peak_pos + guard).min(n);
    let off_fringe: Vec<f64> = lags[..lo].iter().chain(&lags[hi..]).copied().collect();
    let n_off = off_fringe.len().max(1) as f64;
    let mean = off_fringe.iter().sum::<f64>() / n_off;
    let noise = off_fringe.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>();
    let snr = ((peak - mean) * (peak - mean) * n_off / noise.max(1e-12)).sqrt();

    // Halved for the two-times-oversampled lag grid.
    let offset = ((peak_pos as f64 - n as f64 / 2.0) / 2.0).round() as i64;
    (peak, snr, offset)
}
