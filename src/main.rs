// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The main fxcorr binary.

use clap::Parser;

use fxcorr::cli::Fxcorr;
use fxcorr::FxcorrError;

fn main() {
    // We don't return Result from main because it prints the debug
    // representation of the error; the code below prints the display form.
    if let Err(e) = try_main() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), FxcorrError> {
    Fxcorr::parse().run()
}
