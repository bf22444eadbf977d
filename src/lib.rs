// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
An FX software correlator for very long baseline interferometry: aligns the
recorded voltage streams of several radio telescopes against a tabulated
delay model and accumulates auto- and cross-correlation spectra per baseline
into a framed binary visibility file.
 */

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod corr;
pub mod delay;
pub mod input;
pub mod io;
pub mod params;
pub mod pool;
pub mod time;

pub(crate) mod fft;

pub use cli::FxcorrError;

use crossbeam_utils::atomic::AtomicCell;

/// Whether the terminal gets progress bars; flipped once at startup from
/// the command line.
pub(crate) static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
