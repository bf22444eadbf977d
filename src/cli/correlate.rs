// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `correlate` subcommand.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use crate::cli::FxcorrError;
use crate::config::ControlFile;
use crate::controller;
use crate::params::CorrelateParams;

#[derive(Parser, Debug)]
pub(super) struct CorrelateArgs {
    /// Path to the JSON control file describing the job.
    #[clap(name = "CONTROL_FILE", parse(from_os_str))]
    control_file: PathBuf,

    /// Override the output visibility file URI (file://...).
    #[clap(short = 'o', long, help_heading = "OVERRIDES")]
    output_file: Option<String>,

    /// Override the start of the correlated interval ("now" or
    /// 2006y123d06h30m00s).
    #[clap(long, help_heading = "OVERRIDES")]
    start: Option<String>,

    /// Override the end of the correlated interval ("end" or a date).
    #[clap(long, help_heading = "OVERRIDES")]
    stop: Option<String>,

    /// Correlate only these channels.
    #[clap(long, multiple_values(true), help_heading = "OVERRIDES")]
    channels: Option<Vec<String>>,

    /// Number of correlator worker threads.
    #[clap(long, help_heading = "OVERRIDES")]
    n_workers: Option<usize>,
}

impl CorrelateArgs {
    /// Control-file values overridden by whatever was given on the command
    /// line, same precedence as the argument files everywhere else: CLI
    /// wins.
    pub(super) fn merge(self) -> Result<ControlFile, FxcorrError> {
        let mut ctrl = ControlFile::from_path(&self.control_file)?;
        ctrl.output_file = self.output_file.or(ctrl.output_file);
        ctrl.start = self.start.or(ctrl.start);
        ctrl.stop = self.stop.or(ctrl.stop);
        ctrl.channels = self.channels.or(ctrl.channels);
        ctrl.n_workers = self.n_workers.or(ctrl.n_workers);
        Ok(ctrl)
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), FxcorrError> {
        let ctrl = self.merge()?;
        let params = CorrelateParams::from_control(ctrl)?;
        params.log_summary();

        if dry_run {
            info!("Dry run requested; stopping before any worker starts.");
            return Ok(());
        }
        controller::correlate(&params)?;
        Ok(())
    }
}
