// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The visibility file format.
//!
//! A framed binary stream in host byte order, packed without padding: one
//! global header, then per timeslice a header, per-station uvw records,
//! per-station sampler statistics, and per baseline a small header plus
//! `number_channels + 1` complex floats.

pub mod read;
pub(crate) mod write;

/// Bytes of the on-disk global header.
pub const GLOBAL_HEADER_SIZE: i32 = 64;
pub const TIMESLICE_HEADER_SIZE: usize = 16;
pub const UVW_RECORD_SIZE: usize = 32;
pub const STATS_RECORD_SIZE: usize = 24;
pub const BASELINE_HEADER_SIZE: usize = 10;
