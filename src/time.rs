// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The correlator timebase.
//!
//! Everything that schedules or aligns data uses [`Time`]: a signed count of
//! microseconds since the MJD epoch (1858-11-17 0h UT). The same type serves
//! as both a point in time and a span; recorder timestamps and control-file
//! dates are expressed in the `2006y123d06h30m00s` form.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const USEC_PER_SEC: i64 = 1_000_000;
const USEC_PER_DAY: i64 = 86_400 * USEC_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);
    /// A time later than any attainable observation time; `"stop": "end"`
    /// resolves to this before being clamped to the scan list.
    pub const MAX: Time = Time(i64::MAX);

    pub fn from_usec(usec: i64) -> Time {
        Time(usec)
    }

    pub fn from_seconds(sec: f64) -> Time {
        Time((sec * USEC_PER_SEC as f64).round() as i64)
    }

    pub fn from_mjd_days(mjd: i64) -> Time {
        Time(mjd * USEC_PER_DAY)
    }

    /// A calendar date in the recorder's year/day-of-year form.
    pub fn from_date(year: i32, day_of_year: u32, hour: u32, min: u32, sec: u32) -> Time {
        let mjd = mjd_of_year(year) + (day_of_year as i64 - 1);
        let in_day = ((hour as i64 * 60 + min as i64) * 60 + sec as i64) * USEC_PER_SEC;
        Time(mjd * USEC_PER_DAY + in_day)
    }

    pub fn now() -> Time {
        // Unix epoch = MJD 40587.
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Time(40587 * USEC_PER_DAY + unix.as_micros() as i64)
    }

    pub fn usec(self) -> i64 {
        self.0
    }

    pub fn seconds(self) -> f64 {
        self.0 as f64 / USEC_PER_SEC as f64
    }

    pub fn mjd_day(self) -> i64 {
        self.0.div_euclid(USEC_PER_DAY)
    }

    /// Microseconds past 0h of the MJD day.
    pub fn usec_of_day(self) -> i64 {
        self.0.rem_euclid(USEC_PER_DAY)
    }

    /// The `(year, day_of_year)` of the MJD day this time falls in.
    pub fn year_day(self) -> (i32, u32) {
        let mjd = self.mjd_day();
        let mut year = (1858 + (mjd + 321) / 365) as i32;
        while mjd_of_year(year + 1) <= mjd {
            year += 1;
        }
        while mjd_of_year(year) > mjd {
            year -= 1;
        }
        (year, (mjd - mjd_of_year(year) + 1) as u32)
    }

    /// Number of whole `step`s in `self`, for slicing spans.
    pub fn div_floor(self, step: Time) -> i64 {
        self.0.div_euclid(step.0)
    }

    pub fn is_multiple_of(self, step: Time) -> bool {
        step.0 != 0 && self.0.rem_euclid(step.0) == 0
    }

    /// The exact sample index spanned by this time at `sample_rate` Hz.
    /// Sample rates are an integer number of MHz, so samples-per-microsecond
    /// is exact.
    pub fn samples(self, sample_rate: u64) -> i64 {
        debug_assert_eq!(sample_rate % USEC_PER_SEC as u64, 0);
        self.0 * (sample_rate / USEC_PER_SEC as u64) as i64
    }

    /// The time spanned by `n` samples at `sample_rate` Hz. Rounds to the
    /// nearest microsecond when samples do not divide evenly.
    pub fn of_samples(n: i64, sample_rate: u64) -> Time {
        let samples_per_usec = (sample_rate / USEC_PER_SEC as u64) as i64;
        if samples_per_usec > 0 && n % samples_per_usec == 0 {
            Time(n / samples_per_usec)
        } else {
            Time(((n as f64 * USEC_PER_SEC as f64) / sample_rate as f64).round() as i64)
        }
    }
}

impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        self.0 += rhs.0;
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        self.0 -= rhs.0;
    }
}

impl Mul<i64> for Time {
    type Output = Time;
    fn mul(self, rhs: i64) -> Time {
        Time(self.0 * rhs)
    }
}

impl Div<i64> for Time {
    type Output = Time;
    fn div(self, rhs: i64) -> Time {
        Time(self.0 / rhs)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (year, doy) = self.year_day();
        let s = self.usec_of_day() / USEC_PER_SEC;
        let us = self.usec_of_day() % USEC_PER_SEC;
        write!(
            f,
            "{year}y{doy:03}d{:02}h{:02}m{:02}s",
            s / 3600,
            (s / 60) % 60,
            s % 60
        )?;
        if us != 0 {
            write!(f, "+{us}us")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
#[error("'{0}' is not a date of the form 2006y123d06h30m00s")]
pub struct ParseTimeError(String);

/// Parse the `2006y123d06h30m00s` date form.
pub fn parse_date(s: &str) -> Result<Time, ParseTimeError> {
    let err = || ParseTimeError(s.to_string());
    let mut fields = [0u32; 5];
    let mut rest = s;
    for (field, sep) in fields.iter_mut().zip(['y', 'd', 'h', 'm', 's']) {
        let at = rest.find(sep).ok_or_else(err)?;
        *field = rest[..at].parse().map_err(|_| err())?;
        rest = &rest[at + 1..];
    }
    if !rest.is_empty() {
        return Err(err());
    }
    let [year, doy, hour, min, sec] = fields;
    if doy == 0 || doy > 366 || hour > 23 || min > 59 || sec > 60 {
        return Err(err());
    }
    Ok(Time::from_date(year as i32, doy, hour, min, sec))
}

/// MJD of January 1st of `year`.
fn mjd_of_year(year: i32) -> i64 {
    let y = year as i64 - 1;
    // Days from 0001-01-01 to 1858-11-17 under the Gregorian leap rule.
    365 * y + y / 4 - y / 100 + y / 400 - 678575
}
