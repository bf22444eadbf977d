// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-station delay models.
//!
//! A delay file tabulates, at discrete epochs, the geometric delay, the
//! residual phase, an amplitude calibration factor and the projected (u,v,w)
//! baseline coordinates for one station. The table is immutable after
//! loading and interpolated with an Akima spline, so the delay-correction
//! core can sample it at every FFT step and get values that are smooth in
//! both value and first derivative.

pub(crate) mod akima;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::time::Time;
use akima::AkimaSpline;

const MAGIC: &[u8; 4] = b"FXD1";

/// One tabulated epoch of a delay file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayEntry {
    pub time: Time,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// Geometric delay \[s\]; positive when the wavefront reaches this
    /// station late.
    pub delay: f64,
    /// Residual instrumental phase \[rad\].
    pub phase: f64,
    /// Amplitude calibration factor; 1 when uncalibrated.
    pub amplitude: f64,
}

/// The interpolated delay model (delay, phase, amplitude) of a station.
#[derive(Debug, Clone, Copy)]
pub struct DelaySample {
    pub delay: f64,
    pub phase: f64,
    pub amplitude: f64,
}

#[derive(Debug)]
pub struct DelayTable {
    /// Reference epoch; splines run on seconds since this to keep the
    /// abscissae small.
    t0: Time,
    span: (Time, Time),
    delay: AkimaSpline,
    phase: AkimaSpline,
    amplitude: AkimaSpline,
    u: AkimaSpline,
    v: AkimaSpline,
    w: AkimaSpline,
}

impl DelayTable {
    pub fn from_path(path: &Path) -> Result<DelayTable, DelayError> {
        let io_err = |e| DelayError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut rdr = BufReader::new(File::open(path).map_err(io_err)?);

        let mut magic = [0u8; 4];
        rdr.read_exact(&mut magic).map_err(io_err)?;
        if &magic != MAGIC {
            return Err(DelayError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let n = rdr.read_u32::<LittleEndian>().map_err(io_err)? as usize;

        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            entries.push(DelayEntry {
                time: Time::from_usec(rdr.read_i64::<LittleEndian>().map_err(io_err)?),
                u: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
                v: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
                w: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
                delay: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
                phase: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
                amplitude: rdr.read_f64::<LittleEndian>().map_err(io_err)?,
            });
        }
        DelayTable::from_entries(&entries)
    }

    pub fn from_entries(entries: &[DelayEntry]) -> Result<DelayTable, DelayError> {
        if entries.len() < 3 {
            return Err(DelayError::TooFewPoints(entries.len()));
        }
        if entries.windows(2).any(|w| w[1].time <= w[0].time) {
            return Err(DelayError::NonMonotonic);
        }

        let t0 = entries[0].time;
        let x: Vec<f64> = entries.iter().map(|e| (e.time - t0).seconds()).collect();
        let col = |f: fn(&DelayEntry) -> f64| {
            AkimaSpline::new(x.clone(), entries.iter().map(f).collect())
        };

        Ok(DelayTable {
            t0,
            span: (t0, entries.last().unwrap().time),
            delay: col(|e| e.delay),
            phase: col(|e| e.phase),
            amplitude: col(|e| e.amplitude),
            u: col(|e| e.u),
            v: col(|e| e.v),
            w: col(|e| e.w),
        })
    }

    /// Write `entries` in the on-disk form read by [`DelayTable::from_path`].
    pub fn write_entries(path: &Path, entries: &[DelayEntry]) -> Result<(), DelayError> {
        let io_err = |e| DelayError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut wtr = BufWriter::new(File::create(path).map_err(io_err)?);
        wtr.write_all(MAGIC).map_err(io_err)?;
        wtr.write_u32::<LittleEndian>(entries.len() as u32)
            .map_err(io_err)?;
        for e in entries {
            wtr.write_i64::<LittleEndian>(e.time.usec()).map_err(io_err)?;
            for val in [e.u, e.v, e.w, e.delay, e.phase, e.amplitude] {
                wtr.write_f64::<LittleEndian>(val).map_err(io_err)?;
            }
        }
        wtr.flush().map_err(io_err)
    }

    pub fn covers(&self, time: Time) -> bool {
        time >= self.span.0 && time <= self.span.1
    }

    pub fn span(&self) -> (Time, Time) {
        self.span
    }

    /// The delay model at `time`; `DelayError::Unavailable` outside the
    /// tabulated span.
    pub fn sample(&self, time: Time) -> Result<DelaySample, DelayError> {
        if !self.covers(time) {
            return Err(DelayError::Unavailable { time });
        }
        let x = (time - self.t0).seconds();
        Ok(DelaySample {
            delay: self.delay.eval(x),
            phase: self.phase.eval(x),
            amplitude: self.amplitude.eval(x),
        })
    }

    /// Delay rate \[s/s\] at `time`.
    pub fn rate(&self, time: Time) -> Result<f64, DelayError> {
        if !self.covers(time) {
            return Err(DelayError::Unavailable { time });
        }
        Ok(self.delay.derivative((time - self.t0).seconds()))
    }

    /// Projected baseline coordinates at `time`, for the output records.
    pub fn uvw(&self, time: Time) -> Result<[f64; 3], DelayError> {
        if !self.covers(time) {
            return Err(DelayError::Unavailable { time });
        }
        let x = (time - self.t0).seconds();
        Ok([self.u.eval(x), self.v.eval(x), self.w.eval(x)])
    }
}

#[derive(Error, Debug)]
pub enum DelayError {
    #[error("Could not read delay file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a delay file (bad magic)")]
    BadMagic { path: PathBuf },

    #[error("Delay table has {0} points; at least 3 are needed")]
    TooFewPoints(usize),

    #[error("Delay table epochs are not strictly increasing")]
    NonMonotonic,

    #[error("Delay model undefined at {time}")]
    Unavailable { time: Time },
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn linear_entries(n: usize, step_s: f64, rate: f64) -> Vec<DelayEntry> {
        let t0 = Time::from_date(2020, 100, 12, 0, 0);
        (0..n)
            .map(|i| {
                let dt = i as f64 * step_s;
                DelayEntry {
                    time: t0 + Time::from_seconds(dt),
                    u: 1000.0 + dt,
                    v: -500.0,
                    w: 10.0 * dt,
                    delay: 3e-6 + rate * dt,
                    phase: 0.25,
                    amplitude: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn interpolates_linear_delay_exactly() {
        let entries = linear_entries(8, 1.0, 2.5e-9);
        let table = DelayTable::from_entries(&entries).unwrap();
        let t = entries[0].time + Time::from_seconds(3.4);
        let s = table.sample(t).unwrap();
        assert_abs_diff_eq!(s.delay, 3e-6 + 2.5e-9 * 3.4, epsilon = 1e-15);
        assert_abs_diff_eq!(s.phase, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(s.amplitude, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(table.rate(t).unwrap(), 2.5e-9, epsilon = 1e-15);
    }

    #[test]
    fn unavailable_outside_span() {
        let entries = linear_entries(5, 1.0, 0.0);
        let table = DelayTable::from_entries(&entries).unwrap();
        let before = entries[0].time - Time::from_usec(1);
        let after = entries[4].time + Time::from_usec(1);
        assert!(matches!(
            table.sample(before),
            Err(DelayError::Unavailable { .. })
        ));
        assert!(matches!(
            table.sample(after),
            Err(DelayError::Unavailable { .. })
        ));
        assert!(table.sample(entries[4].time).is_ok());
    }

    #[test]
    fn rejects_degenerate_tables() {
        let mut entries = linear_entries(2, 1.0, 0.0);
        assert!(matches!(
            DelayTable::from_entries(&entries),
            Err(DelayError::TooFewPoints(2))
        ));
        entries = linear_entries(4, 1.0, 0.0);
        entries[2].time = entries[1].time;
        assert!(matches!(
            DelayTable::from_entries(&entries),
            Err(DelayError::NonMonotonic)
        ));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ef.del");
        let entries = linear_entries(6, 2.0, -1e-9);
        DelayTable::write_entries(&path, &entries).unwrap();
        let table = DelayTable::from_path(&path).unwrap();
        let t = entries[0].time + Time::from_seconds(5.0);
        assert_abs_diff_eq!(
            table.sample(t).unwrap().delay,
            3e-6 - 1e-9 * 5.0,
            epsilon = 1e-15
        );
        let uvw = table.uvw(t).unwrap();
        assert_abs_diff_eq!(uvw[0], 1005.0, epsilon = 1e-9);
        assert_abs_diff_eq!(uvw[2], 50.0, epsilon = 1e-9);
    }

    #[test]
    fn bad_magic_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.del");
        std::fs::write(&path, b"not a delay file").unwrap();
        assert!(matches!(
            DelayTable::from_path(&path),
            Err(DelayError::BadMagic { .. })
        ));
    }
}
