// Spline interpolation over arclength
//
// Natural cubic spline solved with the tridiagonal (Thomas) algorithm, used for
// curvature estimation, and a first degree multi-channel spline used as the
// tracker's reference.

use crate::common::{DriveError, DriveResult};

/// Natural cubic spline y(t)
#[derive(Debug, Clone)]
pub struct CubicSpline1D {
    x: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
}

impl CubicSpline1D {
    /// Fit through `(x[i], y[i])`; `x` must be strictly increasing
    pub fn new(x: &[f64], y: &[f64]) -> DriveResult<Self> {
        let n = x.len();
        if n < 2 || n != y.len() {
            return Err(DriveError::InvalidParameter(format!(
                "cubic spline needs at least 2 matching samples, got {} and {}",
                x.len(),
                y.len()
            )));
        }
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        if h.iter().any(|&hi| !(hi > 0.0)) {
            return Err(DriveError::NumericalError(
                "spline knots must be strictly increasing".to_string(),
            ));
        }

        let a = y.to_vec();
        let mut b = vec![0.0; n];
        let mut c = vec![0.0; n];
        let mut d = vec![0.0; n];

        let mut alpha = vec![0.0; n];
        for i in 1..n - 1 {
            alpha[i] = 3.0 / h[i] * (a[i + 1] - a[i]) - 3.0 / h[i - 1] * (a[i] - a[i - 1]);
        }

        let mut l = vec![1.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 1..n - 1 {
            l[i] = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / l[i];
            z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
        }

        for j in (0..n - 1).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            b[j] = (a[j + 1] - a[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            d[j] = (c[j + 1] - c[j]) / (3.0 * h[j]);
        }

        Ok(CubicSpline1D { x: x.to_vec(), a, b, c, d })
    }

    pub fn calc(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        self.a[i] + self.b[i] * dx + self.c[i] * dx.powi(2) + self.d[i] * dx.powi(3)
    }

    pub fn calc_d(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        self.b[i] + 2.0 * self.c[i] * dx + 3.0 * self.d[i] * dx.powi(2)
    }

    pub fn calc_dd(&self, t: f64) -> f64 {
        let i = self.search_index(t);
        let dx = t - self.x[i];
        2.0 * self.c[i] + 6.0 * self.d[i] * dx
    }

    fn search_index(&self, t: f64) -> usize {
        let i = self.x.partition_point(|&xi| xi <= t);
        i.saturating_sub(1).min(self.x.len() - 2)
    }
}

/// 2D cubic spline path parametrized by the given arclength knots
#[derive(Debug, Clone)]
pub struct CubicSpline2D {
    pub s: Vec<f64>,
    sx: CubicSpline1D,
    sy: CubicSpline1D,
}

impl CubicSpline2D {
    pub fn new(s: &[f64], x: &[f64], y: &[f64]) -> DriveResult<Self> {
        let sx = CubicSpline1D::new(s, x)?;
        let sy = CubicSpline1D::new(s, y)?;
        Ok(CubicSpline2D { s: s.to_vec(), sx, sy })
    }

    /// Fit with cumulative chord length as the parameter
    pub fn from_points(x: &[f64], y: &[f64]) -> DriveResult<Self> {
        let s = cumulative_length(x, y);
        Self::new(&s, x, y)
    }

    pub fn calc_position(&self, s: f64) -> (f64, f64) {
        (self.sx.calc(s), self.sy.calc(s))
    }

    pub fn calc_yaw(&self, s: f64) -> f64 {
        self.sy.calc_d(s).atan2(self.sx.calc_d(s))
    }

    /// Unsigned curvature; infinite where the parametrization degenerates
    pub fn calc_curvature(&self, s: f64) -> f64 {
        let dx = self.sx.calc_d(s);
        let ddx = self.sx.calc_dd(s);
        let dy = self.sy.calc_d(s);
        let ddy = self.sy.calc_dd(s);
        let denom = (dx.powi(2) + dy.powi(2)).powf(1.5);
        if denom <= f64::EPSILON {
            return f64::INFINITY;
        }
        (dx * ddy - dy * ddx).abs() / denom
    }
}

/// First degree interpolating spline over `N` channels
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSpline<const N: usize> {
    s: Vec<f64>,
    values: Vec<[f64; N]>,
}

impl<const N: usize> LinearSpline<N> {
    pub fn new(s: Vec<f64>, values: Vec<[f64; N]>) -> DriveResult<Self> {
        if s.is_empty() || s.len() != values.len() {
            return Err(DriveError::InvalidParameter(format!(
                "linear spline needs matching non-empty knots, got {} and {}",
                s.len(),
                values.len()
            )));
        }
        if s.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(DriveError::NumericalError(
                "spline knots must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { s, values })
    }

    pub fn knots(&self) -> &[f64] {
        &self.s
    }

    pub fn values(&self) -> &[[f64; N]] {
        &self.values
    }

    pub fn start(&self) -> f64 {
        self.s[0]
    }

    pub fn end(&self) -> f64 {
        self.s[self.s.len() - 1]
    }

    /// Value at `t`, clamped to the end values outside the knot range
    pub fn evaluate(&self, t: f64) -> [f64; N] {
        if t <= self.start() {
            return self.values[0];
        }
        if t >= self.end() {
            return self.values[self.values.len() - 1];
        }
        let i = self.s.partition_point(|&si| si <= t) - 1;
        let ratio = (t - self.s[i]) / (self.s[i + 1] - self.s[i]);
        let mut out = [0.0; N];
        for (k, value) in out.iter_mut().enumerate() {
            *value = self.values[i][k] + ratio * (self.values[i + 1][k] - self.values[i][k]);
        }
        out
    }
}

/// Cumulative chord length of a polyline
pub fn cumulative_length(x: &[f64], y: &[f64]) -> Vec<f64> {
    let mut s = Vec::with_capacity(x.len());
    let mut total = 0.0;
    for i in 0..x.len().min(y.len()) {
        if i > 0 {
            total += (x[i] - x[i - 1]).hypot(y[i] - y[i - 1]);
        }
        s.push(total);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cubic_spline_passes_through_knots() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 0.0, 1.0];
        let sp = CubicSpline1D::new(&x, &y).unwrap();
        for (xi, yi) in x.iter().zip(y.iter()) {
            assert_relative_eq!(sp.calc(*xi), *yi, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_curvature_of_circle() {
        let radius = 5.0;
        let n = 60;
        let xs: Vec<f64> = (0..n).map(|i| radius * (i as f64 * 0.05).cos()).collect();
        let ys: Vec<f64> = (0..n).map(|i| radius * (i as f64 * 0.05).sin()).collect();
        let sp = CubicSpline2D::from_points(&xs, &ys).unwrap();
        let mid = sp.s[n / 2];
        assert_relative_eq!(sp.calc_curvature(mid), 1.0 / radius, epsilon = 1e-2);
    }

    #[test]
    fn test_straight_line_has_zero_curvature() {
        let sp = CubicSpline2D::from_points(&[0.0, 1.0, 2.0, 3.0], &[0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_relative_eq!(sp.calc_curvature(1.5), 0.0, epsilon = 1e-12);
        assert_relative_eq!(sp.calc_yaw(1.5), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_repeated_knots() {
        assert!(CubicSpline1D::new(&[0.0, 0.0, 1.0], &[0.0, 1.0, 2.0]).is_err());
        assert!(LinearSpline::new(vec![0.0, 0.0], vec![[0.0], [1.0]]).is_err());
    }

    #[test]
    fn test_linear_spline_interpolates_and_clamps() {
        let sp = LinearSpline::new(vec![0.0, 2.0, 4.0], vec![[0.0, 10.0], [2.0, 10.0], [2.0, 0.0]]).unwrap();
        let v = sp.evaluate(1.0);
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[1], 10.0);
        assert_relative_eq!(sp.evaluate(3.0)[1], 5.0);
        assert_eq!(sp.evaluate(-1.0), [0.0, 10.0]);
        assert_eq!(sp.evaluate(10.0), [2.0, 0.0]);
    }
}
