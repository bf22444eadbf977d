// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all fxcorr-related errors. This should be the *only*
//! error enum that is publicly visible.

use thiserror::Error;

use crate::config::ConfigError;
use crate::controller::CorrelateError;
use crate::corr::CoreError;
use crate::delay::DelayError;
use crate::input::InputError;
use crate::io::read::VisReadError;
use crate::io::write::VisWriteError;

/// The *only* publicly visible error from fxcorr. The process exits
/// non-zero whenever one of these reaches `main`.
#[derive(Error, Debug)]
pub enum FxcorrError {
    /// The control file or command line asked for an impossible job.
    #[error("{0}")]
    Config(String),

    /// A delay model was missing or did not cover the observation.
    #[error("{0}")]
    Delay(String),

    /// A station recording could not be read or decoded.
    #[error("{0}")]
    Input(String),

    /// The correlation itself failed.
    #[error("{0}")]
    Correlate(String),

    /// A visibility file could not be read.
    #[error("{0}")]
    VisRead(String),

    /// The output file could not be written.
    #[error("{0}")]
    VisWrite(String),

    /// Anything that cannot be clarified further, e.g. plain I/O errors.
    #[error("{0}")]
    Generic(String),
}

impl From<ConfigError> for FxcorrError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Delay(_) | ConfigError::DelaySpan { .. } => Self::Delay(e.to_string()),
            _ => Self::Config(e.to_string()),
        }
    }
}

impl From<CorrelateError> for FxcorrError {
    fn from(e: CorrelateError) -> Self {
        let s = e.to_string();
        match e {
            CorrelateError::EmptyPlan => Self::Config(s),
            CorrelateError::Input(_) => Self::Input(s),
            CorrelateError::Core(CoreError::Delay(_)) => Self::Delay(s),
            CorrelateError::Core(_) => Self::Correlate(s),
            CorrelateError::VisWrite(_) => Self::VisWrite(s),
        }
    }
}

impl From<DelayError> for FxcorrError {
    fn from(e: DelayError) -> Self {
        Self::Delay(e.to_string())
    }
}

impl From<InputError> for FxcorrError {
    fn from(e: InputError) -> Self {
        Self::Input(e.to_string())
    }
}

impl From<VisReadError> for FxcorrError {
    fn from(e: VisReadError) -> Self {
        Self::VisRead(e.to_string())
    }
}

impl From<VisWriteError> for FxcorrError {
    fn from(e: VisWriteError) -> Self {
        Self::VisWrite(e.to_string())
    }
}

impl From<std::io::Error> for FxcorrError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
