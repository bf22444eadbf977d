// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The observation description: stations, scans and frequency channels.
//!
//! In the original system this came out of the schedule file; here the
//! control file carries it directly (schedule parsing is an external
//! concern). These types are plain data; cross-field validation lives with
//! the configuration code.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sideband {
    Upper,
    Lower,
}

impl Sideband {
    /// The on-disk encoding: LSB = 0, USB = 1.
    pub fn index(self) -> u8 {
        match self {
            Sideband::Lower => 0,
            Sideband::Upper => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarisation {
    R,
    L,
}

impl Polarisation {
    /// The on-disk encoding: RCP = 0, LCP = 1.
    pub fn index(self) -> u8 {
        match self {
            Polarisation::R => 0,
            Polarisation::L => 1,
        }
    }

    pub fn opposite(self) -> Polarisation {
        match self {
            Polarisation::R => Polarisation::L,
            Polarisation::L => Polarisation::R,
        }
    }
}

impl fmt::Display for Polarisation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Polarisation::R => write!(f, "R"),
            Polarisation::L => write!(f, "L"),
        }
    }
}

/// The recorder frame format a station's raw data is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Vdif,
    Mark5b,
}

impl Default for DataFormat {
    fn default() -> DataFormat {
        DataFormat::Vdif
    }
}

/// One recorded frequency channel (a "subband" in schedule parlance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDef {
    pub name: String,

    /// Sky frequency of the band edge at the local oscillator \[Hz\].
    pub sky_freq: f64,

    /// Recorded bandwidth \[Hz\].
    pub bandwidth: f64,

    pub sideband: Sideband,

    pub polarisation: Polarisation,

    /// \[Hz\]; always an integer number of MHz.
    pub sample_rate: u64,

    pub bits_per_sample: u8,
}

impl ChannelDef {
    /// `sample_rate / (2 bandwidth)`, rounded; 1 for Nyquist sampling.
    pub fn oversampling(&self) -> usize {
        (self.sample_rate as f64 / (2.0 * self.bandwidth)).round() as usize
    }
}

/// A scheduled on-source interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub name: String,
    pub start: Time,
    pub stop: Time,
}

/// One telescope: where its recordings and delay model live.
#[derive(Debug, Clone)]
pub struct Station {
    pub name: String,

    /// Ordered recording files; read back to back.
    pub sources: Vec<PathBuf>,

    pub delay_file: PathBuf,

    pub format: DataFormat,

    /// Local-oscillator offset \[Hz\].
    pub lo_offset: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarisation_encoding_matches_file_format() {
        assert_eq!(Polarisation::R.index(), 0);
        assert_eq!(Polarisation::L.index(), 1);
        assert_eq!(Polarisation::L.opposite(), Polarisation::R);
        assert_eq!(Sideband::Lower.index(), 0);
        assert_eq!(Sideband::Upper.index(), 1);
    }

    #[test]
    fn oversampling_factor() {
        let mut chan = ChannelDef {
            name: "CH01".to_string(),
            sky_freq: 8.4e9,
            bandwidth: 16e6,
            sideband: Sideband::Upper,
            polarisation: Polarisation::R,
            sample_rate: 32_000_000,
            bits_per_sample: 2,
        };
        assert_eq!(chan.oversampling(), 1);
        chan.sample_rate = 64_000_000;
        assert_eq!(chan.oversampling(), 2);
    }
}
