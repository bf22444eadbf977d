// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Akima spline interpolation.
//!
//! Delay polynomials are tabulated at second-ish cadence and must be smooth
//! in value and first derivative when sampled per FFT step; Akima's method
//! gives that without the overshoot a global cubic spline produces near
//! scan boundaries.

/// An Akima spline over strictly increasing abscissae. Needs at least three
/// points; the boundary slopes are synthesised by the usual quadratic
/// extension.
#[derive(Debug, Clone)]
pub struct AkimaSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Spline slope at each knot.
    t: Vec<f64>,
}

impl AkimaSpline {
    /// `x` must be strictly increasing and `x.len() == y.len() >= 3`; the
    /// caller (the delay-table reader) has already checked this.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> AkimaSpline {
        assert_eq!(x.len(), y.len());
        assert!(x.len() >= 3);
        let n = x.len();

        // Interval slopes, extended two intervals past each end.
        let mut m = Vec::with_capacity(n + 3);
        m.push(0.0);
        m.push(0.0);
        for i in 0..n - 1 {
            m.push((y[i + 1] - y[i]) / (x[i + 1] - x[i]));
        }
        m[1] = 2.0 * m[2] - m[3];
        m[0] = 2.0 * m[1] - m[2];
        let mn = m[n];
        let mn1 = m[n - 1];
        m.push(2.0 * mn - mn1);
        let e = m[n + 1];
        m.push(2.0 * e - mn);

        // Knot slopes; m[i + 2] is the slope of the interval right of knot i.
        let mut t = Vec::with_capacity(n);
        for i in 0..n {
            let w1 = (m[i + 3] - m[i + 2]).abs();
            let w2 = (m[i + 1] - m[i]).abs();
            if w1 + w2 == 0.0 {
                t.push(0.5 * (m[i + 1] + m[i + 2]));
            } else {
                t.push((w1 * m[i + 1] + w2 * m[i + 2]) / (w1 + w2));
            }
        }

        AkimaSpline { x, y, t }
    }

    pub fn min_x(&self) -> f64 {
        self.x[0]
    }

    pub fn max_x(&self) -> f64 {
        *self.x.last().unwrap()
    }

    /// Evaluate at `x`, which must lie within `[min_x, max_x]`.
    pub fn eval(&self, x: f64) -> f64 {
        let i = self.interval(x);
        let h = self.x[i + 1] - self.x[i];
        let s = (x - self.x[i]) / h;
        let (y0, y1) = (self.y[i], self.y[i + 1]);
        let (t0, t1) = (self.t[i] * h, self.t[i + 1] * h);
        // Cubic Hermite basis.
        let s2 = s * s;
        let s3 = s2 * s;
        y0 * (2.0 * s3 - 3.0 * s2 + 1.0)
            + t0 * (s3 - 2.0 * s2 + s)
            + y1 * (-2.0 * s3 + 3.0 * s2)
            + t1 * (s3 - s2)
    }

    /// First derivative at `x`.
    pub fn derivative(&self, x: f64) -> f64 {
        let i = self.interval(x);
        let h = self.x[i + 1] - self.x[i];
        let s = (x - self.x[i]) / h;
        let (y0, y1) = (self.y[i], self.y[i + 1]);
        let (t0, t1) = (self.t[i], self.t[i + 1]);
        let s2 = s * s;
        (y0 * (6.0 * s2 - 6.0 * s) + y1 * (6.0 * s - 6.0 * s2)) / h
            + t0 * (3.0 * s2 - 4.0 * s + 1.0)
            + t1 * (3.0 * s2 - 2.0 * s)
    }

    fn interval(&self, x: f64) -> usize {
        // partition_point never returns 0 here because x >= x[0].
        let i = self.x.partition_point(|&k| k <= x);
        i.clamp(1, self.x.len() - 1) - 1
    }
}
