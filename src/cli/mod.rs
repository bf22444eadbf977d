// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. More specific options for `fxcorr`
//! subcommands are contained in modules.
//!
//! Only 3 things should be public in this module: `Fxcorr`, `Fxcorr::run`,
//! and `FxcorrError`.

mod correlate;
mod error;
mod inspect;

pub use error::FxcorrError;

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::PROGRESS_BARS;

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "An FX software correlator for very long baseline interferometry"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Fxcorr {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only verify that the job was correctly understood and print
    /// high-level information.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Correlate an observation described by a JSON control file.")]
    Correlate(correlate::CorrelateArgs),

    #[clap(about = "Print a human-readable summary of a visibility file.")]
    Inspect(inspect::InspectArgs),
}

impl Fxcorr {
    pub fn run(self) -> Result<(), FxcorrError> {
        let GlobalArgs {
            verbosity,
            no_progress_bars,
            dry_run,
        } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");
        if !no_progress_bars {
            PROGRESS_BARS.store(true);
        }

        let sub_command = match &self.command {
            Command::Correlate(_) => "correlate",
            Command::Inspect(_) => "inspect",
        };
        info!("fxcorr {} {}", sub_command, env!("CARGO_PKG_VERSION"));

        match self.command {
            Command::Correlate(args) => args.run(dry_run)?,
            Command::Inspect(args) => args.run()?,
        }

        info!("fxcorr {sub_command} complete.");
        Ok(())
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty;
/// piped output will be formatted sensibly. Source code lines are displayed
/// in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();

    Ok(())
}
