// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The JSON control file.
//!
//! This module only models what the file contains; turning a [`ControlFile`]
//! into a validated job is the business of [`crate::params`]. Everything here
//! is optional or defaulted so that command-line flags can override file
//! values before validation (the same merge rule the argument files use:
//! CLI wins).

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ChannelDef;
use crate::corr::window::WindowFunction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    /// `"now"` or a `2006y123d06h30m00s` date. Defaults to the first scan.
    pub start: Option<String>,

    /// `"end"` or a date. Defaults to the last scan.
    pub stop: Option<String>,

    /// Ordered station identifiers; order fixes the station numbering in the
    /// output file.
    pub stations: Vec<String>,

    /// Per station, the ordered list of `file://` recording URIs.
    #[serde(default)]
    pub data_sources: HashMap<String, Vec<String>>,

    /// Per station, the delay-model table.
    #[serde(default)]
    pub delay_files: HashMap<String, PathBuf>,

    /// The `file://` URI of the visibility file to produce.
    pub output_file: Option<String>,

    /// Restrict cross-correlations to baselines involving this station.
    pub reference_station: Option<String>,

    /// Correlate opposite polarisations of every station pair as well.
    #[serde(default)]
    pub cross_polarize: bool,

    /// Integration interval \[s\].
    pub integr_time: Option<f64>,

    /// Sub-integration interval \[s\]; must divide `integr_time`.
    pub sub_integr_time: Option<f64>,

    /// Spectral points per baseline in the output.
    pub number_channels: Option<usize>,

    /// Transform size of the delay-correction stage; a power of two.
    pub fft_size_delaycor: Option<usize>,

    /// Transform size of the correlation stage; a power of two, at least
    /// `fft_size_delaycor` and at least `number_channels`.
    pub fft_size_correlation: Option<usize>,

    pub window_function: Option<WindowFunction>,

    /// Subset of channel names to correlate; all when absent.
    pub channels: Option<Vec<String>>,

    /// Per-station local-oscillator offset \[Hz\].
    #[serde(default)]
    pub lo_offset: HashMap<String, f64>,

    /// Treat a station stream that stays empty as a fatal error.
    pub exit_on_empty_datastream: Option<bool>,

    /// Correlator worker threads; defaults to the available parallelism.
    pub n_workers: Option<usize>,

    pub observation: ObservationSection,
}

/// The schedule description the original read from a VEX file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSection {
    pub experiment: String,
    pub scans: Vec<ScanEntry>,
    pub channels: Vec<ChannelDef>,
    /// Recorder format per station; `vdif` when a station is absent.
    #[serde(default)]
    pub formats: HashMap<String, crate::context::DataFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEntry {
    pub name: String,
    pub start: String,
    pub stop: String,
}

impl ControlFile {
    pub fn from_path(path: &Path) -> Result<ControlFile, ConfigError> {
        let file = File::open(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Accept only `file://` URIs for now; the byte transport is swappable but
/// nothing else is implemented.
pub fn parse_file_uri(uri: &str) -> Result<PathBuf, ConfigError> {
    match uri.strip_prefix("file://") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(ConfigError::BadUri(uri.to_string())),
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not open control file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Control file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Ctrl-file: '{0}' is not a file:// URI")]
    BadUri(String),

    #[error("Ctrl-file: {0} not defined")]
    Missing(&'static str),

    #[error("Ctrl-file: stop time before start time")]
    StopBeforeStart,

    #[error("Ctrl-file: {0}")]
    BadTime(#[from] crate::time::ParseTimeError),

    #[error("Ctrl-file: station {0} is not in the stations list")]
    UnknownStation(String),

    #[error("Ctrl-file: no data sources for station {0}")]
    NoDataSources(String),

    #[error("Ctrl-file: no delay file for station {0}")]
    NoDelayFile(String),

    #[error("Ctrl-file: channel {0} is not in the observation")]
    UnknownChannel(String),

    #[error("Ctrl-file: integr_time must be positive")]
    BadIntegrationTime,

    #[error("Ctrl-file: sub_integr_time does not divide integr_time")]
    BadSubIntegration,

    #[error("Ctrl-file: {name} is not a power of two")]
    NotPowerOfTwo { name: &'static str },

    #[error("Ctrl-file: fft_size_correlation cannot be smaller than fft_size_delaycor")]
    FftSizesInverted,

    #[error("Ctrl-file: fft_size_correlation cannot be smaller than the number of channels")]
    FftSmallerThanChannels,

    #[error("Ctrl-file: number_channels must divide fft_size_correlation")]
    ChannelsDoNotDivide,

    #[error(
        "Ctrl-file: integr_time at the channel sample rate is not a whole number of \
         2 × fft_size_correlation sample blocks"
    )]
    SliceNotAligned,

    #[error("Ctrl-file: selected channels disagree on sample rate, bandwidth or bit depth")]
    MixedBandwidth,

    #[error(
        "Ctrl-file: channel {name}: sample rate {rate} Hz is not an integer number of MHz"
    )]
    BadSampleRate { name: String, rate: u64 },

    #[error("Ctrl-file: channel {name}: bits_per_sample must be 1 or 2")]
    BadBitsPerSample { name: String },

    #[error("Ctrl-file: channel {name}: bandwidth exceeds the Nyquist limit")]
    BadBandwidth { name: String },

    #[error(
        "Ctrl-file: cross_polarize needs every selected channel to have an \
         opposite-polarisation partner; {0} has none"
    )]
    NoPolarisationPartner(String),

    #[error("Ctrl-file: no scans fall between start and stop")]
    NoScans,

    #[error("Ctrl-file: integr_time spans no complete FFT at the channel sample rate")]
    IntegrationTooShort,

    #[error("Station {station}: delay table does not cover {time}")]
    DelaySpan { station: String, time: String },

    #[error(transparent)]
    Delay(#[from] crate::delay::DelayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_parsing() {
        assert_eq!(
            parse_file_uri("file:///data/ef/scan1.vdif").unwrap(),
            PathBuf::from("/data/ef/scan1.vdif")
        );
        assert!(parse_file_uri("http://example.com/x").is_err());
        assert!(parse_file_uri("file://").is_err());
        assert!(parse_file_uri("/data/plain/path").is_err());
    }

    #[test]
    fn minimal_control_file_parses() {
        let text = r#"{
            "stations": ["Ef", "Wb"],
            "data_sources": { "Ef": ["file:///data/ef.vdif"], "Wb": ["file:///data/wb.vdif"] },
            "delay_files": { "Ef": "/data/ef.del", "Wb": "/data/wb.del" },
            "output_file": "file:///data/out.cor",
            "integr_time": 1.0,
            "observation": {
                "experiment": "N06C2",
                "scans": [ { "name": "No0001",
                             "start": "2006y123d06h30m00s",
                             "stop": "2006y123d06h32m00s" } ],
                "channels": [ { "name": "CH01", "sky_freq": 4.974e9,
                                "bandwidth": 16e6, "sideband": "upper",
                                "polarisation": "R", "sample_rate": 32000000,
                                "bits_per_sample": 2 } ]
            }
        }"#;
        let ctrl: ControlFile = serde_json::from_str(text).unwrap();
        assert_eq!(ctrl.stations, vec!["Ef", "Wb"]);
        assert!(!ctrl.cross_polarize);
        assert_eq!(ctrl.observation.channels.len(), 1);
        assert_eq!(ctrl.integr_time, Some(1.0));
        assert!(ctrl.window_function.is_none());
    }
}
