// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! FFT plans for one correlator worker.
//!
//! A worker needs three transforms: the real→complex / complex→real pair of
//! the delay-correction stage (size `fft_size_delaycor`) and the complex
//! forward transform of the correlation stage (size
//! `2 · fft_size_correlation`, covering the overlapped window). Plans and
//! scratch are set up once per worker and reused for every slice; transforms
//! only ever run on buffers owned by the calling tasklet.

use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

#[derive(Clone)]
pub(crate) struct FftPlans {
    /// Delay-correction transform size.
    pub(crate) size_delaycor: usize,
    /// Correlation transform size; emitted spectra have `size + 1` bins.
    pub(crate) size_correlation: usize,

    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    cor: Arc<dyn Fft<f32>>,

    scratch_r2c: Vec<Complex32>,
    scratch_c2r: Vec<Complex32>,
    scratch_cor: Vec<Complex32>,
}

impl FftPlans {
    pub(crate) fn new(size_delaycor: usize, size_correlation: usize) -> FftPlans {
        let mut real_planner = RealFftPlanner::<f32>::new();
        let r2c = real_planner.plan_fft_forward(size_delaycor);
        let c2r = real_planner.plan_fft_inverse(size_delaycor);
        let cor = FftPlanner::<f32>::new().plan_fft_forward(2 * size_correlation);

        let scratch_r2c = r2c.make_scratch_vec();
        let scratch_c2r = c2r.make_scratch_vec();
        let scratch_cor = vec![Complex32::default(); cor.get_inplace_scratch_len()];

        FftPlans {
            size_delaycor,
            size_correlation,
            r2c,
            c2r,
            cor,
            scratch_r2c,
            scratch_c2r,
            scratch_cor,
        }
    }

    /// `size_delaycor` real samples → `size_delaycor / 2 + 1` one-sided bins.
    pub(crate) fn real_to_freq(&mut self, input: &mut [f32], output: &mut [Complex32]) {
        self.r2c
            .process_with_scratch(input, output, &mut self.scratch_r2c)
            .expect("FFT buffer lengths are fixed at plan time");
    }

    /// One-sided bins → real samples, scaled so that the pair
    /// `real_to_freq` / `freq_to_real` is the identity. The imaginary parts
    /// of the DC and Nyquist bins are cleared; a real signal has none, and
    /// the fractional-delay ramp deposits a small amount into the Nyquist
    /// bin which must not leak into the time domain.
    pub(crate) fn freq_to_real(&mut self, freq: &mut [Complex32], output: &mut [f32]) {
        freq[0].im = 0.0;
        let last = freq.len() - 1;
        freq[last].im = 0.0;
        self.c2r
            .process_with_scratch(freq, output, &mut self.scratch_c2r)
            .expect("FFT buffer lengths are fixed at plan time");
        let scale = 1.0 / self.size_delaycor as f32;
        for x in output.iter_mut() {
            *x *= scale;
        }
    }

    /// In-place forward transform of one `2 · size_correlation` window.
    pub(crate) fn correlation_fft(&mut self, buffer: &mut [Complex32]) {
        debug_assert_eq!(buffer.len(), 2 * self.size_correlation);
        self.cor.process_with_scratch(buffer, &mut self.scratch_cor);
    }
}
