// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The correlator core: delay correction and baseline accumulation.
//!
//! One worker thread runs, per slice, a [`DelayCorrection`] tasklet for
//! every participating station stream and a single [`CorrelationCore`]
//! tasklet, driven by a cooperative loop. Tasklets expose `has_work()`
//! (non-blocking) and `do_task()` (one bounded unit: one FFT step or one
//! output record); the loop runs whichever tasklet reports work, so the
//! delay stage can only run a few spectra ahead of the accumulator and
//! buffer use stays bounded.

pub(crate) mod correlation;
pub(crate) mod delay_correction;
pub(crate) mod parameters;
pub mod stats;
pub mod window;

use num_complex::Complex32;
use thiserror::Error;

use crate::corr::stats::BitStatistics;
use crate::delay::DelayError;
use crate::pool::{PoolError, Pooled};
use crate::time::Time;

pub(crate) use correlation::CorrelationCore;
pub(crate) use delay_correction::DelayCorrection;

/// One slice of decoded samples for one (station stream, channel), as handed
/// from an input node to a correlator worker. Ownership is linear: the input
/// node builds it, exactly one delay-correction tasklet consumes it.
#[derive(Debug)]
pub struct SliceData {
    /// Index into the job's stream list.
    pub stream: usize,
    /// Global slice-task index; fixes the output order.
    pub task: usize,
    /// Wall-clock time of `samples[0]`.
    pub start: Time,
    /// Exactly `slice_samples` decoded values; gaps are zero-filled.
    pub samples: Vec<f32>,
    /// Length of the prefix actually backed by recorded data. Anything
    /// beyond it is an upstream end-of-stream, not just a bad frame.
    pub valid_samples: usize,
    /// Decoder-level statistics for this slice, including the count of
    /// samples lost to bad frames.
    pub stats: BitStatistics,
}

/// One delay-corrected spectrum: the contribution of one stream to one
/// correlation FFT step.
#[derive(Debug)]
pub(crate) struct Spectrum {
    /// Time of the first fresh sample of this step.
    pub(crate) start: Time,
    /// `fft_size_correlation + 1` one-sided bins.
    pub(crate) bins: Pooled<Complex32>,
    /// Fraction of this step's samples backed by recorded data.
    pub(crate) weight: f32,
    /// Samples zero-filled by the integer-delay shift in this step.
    pub(crate) n_invalid: u64,
}

/// The cooperative-task interface: non-blocking work test, bounded work unit.
pub(crate) trait Tasklet {
    fn has_work(&self) -> bool;
    fn do_task(&mut self) -> Result<(), CoreError>;
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Delay(#[from] DelayError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Correlator starved: delay stage stalled with {fed} of {expected} spectra fed")]
    Starved { fed: usize, expected: usize },
}

/// Drive one slice to completion: run the delay tasklets and the correlation
/// core until the integration has been normalised and handed out. Returns
/// the finished record.
pub(crate) fn run_slice(
    delay_cores: &mut [DelayCorrection],
    correlation: &mut CorrelationCore,
) -> Result<correlation::TimesliceRecord, CoreError> {
    loop {
        let mut progressed = false;

        for core in delay_cores.iter_mut() {
            if core.has_work() {
                core.do_task()?;
                progressed = true;
            }
            while let Some(spectrum) = core.pop_spectrum() {
                correlation.feed(core.stream_index(), spectrum);
            }
        }

        while correlation.has_work() {
            correlation.do_task()?;
            progressed = true;
        }

        if let Some(record) = correlation.take_record() {
            return Ok(record);
        }

        if !progressed {
            return Err(CoreError::Starved {
                fed: correlation.ffts_done(),
                expected: correlation.ffts_expected(),
            });
        }
    }
}
