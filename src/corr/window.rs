// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Windowing of the correlation-length FFT.

use std::f32::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The taper applied to each overlapped correlation window. `none` keeps the
/// samples untouched; it is accepted alongside `rectangular` because both
/// spellings occur in historical control files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowFunction {
    Rectangular,
    Cosine,
    Hamming,
    Hann,
    None,
}

impl Default for WindowFunction {
    fn default() -> WindowFunction {
        WindowFunction::None
    }
}

impl fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WindowFunction::Rectangular => "rectangular",
            WindowFunction::Cosine => "cosine",
            WindowFunction::Hamming => "hamming",
            WindowFunction::Hann => "hann",
            WindowFunction::None => "none",
        };
        write!(f, "{name}")
    }
}

impl WindowFunction {
    /// Coefficients over one window of `len` samples.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        let n = len as f32;
        (0..len)
            .map(|i| {
                let i = i as f32;
                match self {
                    WindowFunction::Rectangular | WindowFunction::None => 1.0,
                    WindowFunction::Cosine => (PI * (i + 0.5) / n).sin(),
                    WindowFunction::Hamming => {
                        0.54 - 0.46 * (2.0 * PI * i / (n - 1.0)).cos()
                    }
                    WindowFunction::Hann => 0.5 * (1.0 - (2.0 * PI * i / (n - 1.0)).cos()),
                }
            })
            .collect()
    }
}
