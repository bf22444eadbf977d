// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The delay-correction core.
//!
//! Converts one slice of real samples from one station stream into a
//! sequence of delay-corrected complex spectra. Per FFT step of
//! `fft_size_delaycor` samples: sample the delay model at the step midpoint,
//! split the delay into whole samples (a read-pointer offset) and a
//! fractional remainder (a phase ramp across the one-sided spectrum), flip
//! the band for lower sidebands, return to the time domain and fringe-stop
//! sample by sample. Every `fft_size_correlation` fresh samples, a windowed
//! `2 · fft_size_correlation`-point transform over the previous-plus-current
//! chunk emits one output spectrum.
//!
//! The integer shift is free (a different read pointer), the fractional
//! shift is cheapest as a linear phase in frequency space, and the fringe
//! phase must be applied per sample because it evolves within one step.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;

use num_complex::{Complex, Complex32};

use crate::context::Sideband;
use crate::corr::parameters::CorrelationParameters;
use crate::corr::{CoreError, SliceData, Spectrum, Tasklet};
use crate::delay::DelayTable;
use crate::fft::FftPlans;
use crate::pool::Pool;
use crate::time::Time;

/// How many finished spectra a stream may hold before its tasklet yields to
/// the correlation core.
const MAX_PENDING_SPECTRA: usize = 4;

pub(crate) struct DelayCorrection {
    stream: usize,
    params: Arc<CorrelationParameters>,
    delays: Arc<DelayTable>,
    fft: FftPlans,
    pool: Pool<Complex32>,

    /// Sky frequency used for fringe stopping \[Hz\].
    channel_freq: f64,
    lo_offset: f64,
    window: Vec<f32>,

    slice: Option<SliceData>,
    /// Next nominal input sample of the slice.
    pos: usize,
    /// Spectra emitted for the current slice.
    emitted: usize,

    /// Rolling window of fringe-stopped samples: `[0, m)` is the previous
    /// chunk, `[m, m + fresh)` the one being filled.
    tbuf: Vec<Complex32>,
    fresh: usize,
    fresh_valid: usize,
    fresh_invalid: u64,

    step_in: Vec<f32>,
    step_freq: Vec<Complex32>,
    step_out: Vec<f32>,
    cor_buf: Vec<Complex32>,

    out: VecDeque<Spectrum>,
}

impl DelayCorrection {
    pub(crate) fn new(
        stream: usize,
        params: Arc<CorrelationParameters>,
        delays: Arc<DelayTable>,
        fft: FftPlans,
        pool: Pool<Complex32>,
    ) -> DelayCorrection {
        let n = params.fft_size_delaycor;
        let m = params.fft_size_correlation;
        debug_assert!(m % n == 0);
        let def = &params.streams[stream];
        DelayCorrection {
            channel_freq: params.channel_freq,
            lo_offset: def.lo_offset,
            window: params.window.coefficients(2 * m),
            stream,
            params,
            delays,
            fft,
            pool,
            slice: None,
            pos: 0,
            emitted: 0,
            tbuf: vec![Complex32::default(); 2 * m],
            fresh: 0,
            fresh_valid: 0,
            fresh_invalid: 0,
            step_in: vec![0.0; n],
            step_freq: vec![Complex32::default(); n / 2 + 1],
            step_out: vec![0.0; n],
            cor_buf: vec![Complex32::default(); 2 * m],
            out: VecDeque::new(),
        }
    }

    pub(crate) fn stream_index(&self) -> usize {
        self.stream
    }

    /// Start on a new slice. The previous one must have been fully consumed.
    pub(crate) fn feed(&mut self, slice: SliceData) {
        debug_assert!(self.finished());
        debug_assert_eq!(slice.samples.len(), self.params.slice_samples());
        self.pos = 0;
        self.emitted = 0;
        self.fresh = 0;
        self.fresh_valid = 0;
        self.fresh_invalid = 0;
        self.tbuf.iter_mut().for_each(|x| *x = Complex32::default());
        self.slice = Some(slice);
    }

    pub(crate) fn pop_spectrum(&mut self) -> Option<Spectrum> {
        self.out.pop_front()
    }

    /// True once the whole slice has been turned into spectra.
    pub(crate) fn finished(&self) -> bool {
        match &self.slice {
            Some(slice) => self.pos >= slice.samples.len() && self.out.is_empty(),
            None => true,
        }
    }

    /// One delay-correction FFT step.
    fn step(&mut self) -> Result<(), CoreError> {
        let n = self.params.fft_size_delaycor;
        let m = self.params.fft_size_correlation;
        let rate = self.params.sample_rate;
        let slice = self.slice.as_ref().expect("has_work checked");

        let step_start = slice.start + Time::of_samples(self.pos as i64, rate);
        let step_end = slice.start + Time::of_samples((self.pos + n) as i64, rate);
        let mid = slice.start + Time::of_samples((self.pos + n / 2) as i64, rate);

        let at_start = self.delays.sample(step_start)?;
        let at_end = self.delays.sample(step_end)?;
        let at_mid = self.delays.sample(mid)?;

        // Split the midpoint delay into whole samples and a remainder.
        let delay_samples = at_mid.delay * rate as f64;
        let int_shift = delay_samples.floor() as i64;
        let frac = delay_samples - int_shift as f64;

        // Integer shift: read through a moved pointer; out-of-slice reads
        // are zeros and count as invalid.
        let mut oob: u64 = 0;
        let total = slice.samples.len() as i64;
        for (j, dst) in self.step_in.iter_mut().enumerate() {
            let idx = self.pos as i64 + j as i64 + int_shift;
            if (0..total).contains(&idx) {
                *dst = slice.samples[idx as usize];
            } else {
                *dst = 0.0;
                oob += 1;
            }
        }

        // Fractional-bit shift: a linear phase across the one-sided
        // spectrum; the Nyquist bin keeps only the real part of the ramp.
        self.fft.real_to_freq(&mut self.step_in, &mut self.step_freq);
        for (bin, value) in self.step_freq.iter_mut().enumerate().skip(1) {
            if bin == n / 2 {
                *value *= (PI * frac).cos() as f32;
            } else {
                let ramp = Complex::<f64>::cis(2.0 * PI * bin as f64 * frac / n as f64);
                *value *= Complex32::new(ramp.re as f32, ramp.im as f32);
            }
        }

        if self.params.sideband == Sideband::Lower {
            self.step_freq.reverse();
        }

        self.fft.freq_to_real(&mut self.step_freq, &mut self.step_out);

        // Fringe stopping: the phase evolves within the step, so delay and
        // phase are interpolated per sample between the step-edge values.
        let amplitude = at_mid.amplitude as f32;
        let valid_limit = slice.valid_samples;
        for (j, &s) in self.step_out.iter().enumerate() {
            let frac_of_step = j as f64 / n as f64;
            let tau = at_start.delay + (at_end.delay - at_start.delay) * frac_of_step;
            let phi = at_start.phase + (at_end.phase - at_start.phase) * frac_of_step;
            let t_rel = (self.pos + j) as f64 / rate as f64;
            let angle = -(2.0 * PI * self.channel_freq * tau
                + phi
                + 2.0 * PI * self.lo_offset * t_rel);
            let rot = Complex::<f64>::cis(angle);
            self.tbuf[m + self.fresh + j] =
                Complex32::new(rot.re as f32, rot.im as f32) * (amplitude * s);
        }

        self.fresh_valid += valid_limit.saturating_sub(self.pos).min(n);
        self.fresh_invalid += oob;
        self.fresh += n;
        self.pos += n;

        if self.fresh == m {
            self.emit()?;
        }
        Ok(())
    }

    /// Window the previous-plus-current chunk and transform it into one
    /// output spectrum.
    fn emit(&mut self) -> Result<(), CoreError> {
        let m = self.params.fft_size_correlation;
        let rate = self.params.sample_rate;
        let slice = self.slice.as_ref().expect("emit during a slice");

        for (dst, (&x, &w)) in self
            .cor_buf
            .iter_mut()
            .zip(self.tbuf.iter().zip(&self.window))
        {
            *dst = x * w;
        }
        self.fft.correlation_fft(&mut self.cor_buf);

        let mut bins = self.pool.acquire()?;
        bins.copy_from_slice(&self.cor_buf[..=m]);

        self.out.push_back(Spectrum {
            start: slice.start + Time::of_samples((self.emitted * m) as i64, rate),
            bins,
            weight: self.fresh_valid as f32 / m as f32,
            n_invalid: self.fresh_invalid,
        });
        self.emitted += 1;

        // The fresh chunk becomes the history of the next window.
        let (history, current) = self.tbuf.split_at_mut(m);
        history.copy_from_slice(current);
        self.fresh = 0;
        self.fresh_valid = 0;
        self.fresh_invalid = 0;
        Ok(())
    }
}

impl Tasklet for DelayCorrection {
    fn has_work(&self) -> bool {
        match &self.slice {
            Some(slice) => {
                self.pos < slice.samples.len() && self.out.len() < MAX_PENDING_SPECTRA
            }
            None => false,
        }
    }

    fn do_task(&mut self) -> Result<(), CoreError> {
        self.step()
    }
}
