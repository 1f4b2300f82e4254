// Dense convex quadratic program solver
//
//   minimize    1/2 x' H x + f' x
//   subject to  l <= G x <= u
//
// Operator splitting (ADMM) in the form used by OSQP. The linear system is
// factorized once per problem, so each iteration costs two triangular solves
// and a few matrix-vector products.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::common::{DriveError, DriveResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QpSettings {
    /// ADMM penalty on inequality rows
    pub rho: f64,
    /// Penalty multiplier applied to equality rows
    pub rho_equality_scale: f64,
    /// Proximal regularization of the primal variable
    pub sigma: f64,
    /// Over-relaxation factor in (0, 2)
    pub alpha: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// Tolerance of the primal infeasibility certificate
    pub eps_prim_inf: f64,
    pub max_iter: usize,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            rho: 0.1,
            rho_equality_scale: 1e3,
            sigma: 1e-6,
            alpha: 1.6,
            eps_abs: 1e-4,
            eps_rel: 1e-4,
            eps_prim_inf: 1e-5,
            max_iter: 4000,
        }
    }
}

impl QpSettings {
    pub fn validate(&self) -> DriveResult<()> {
        if !(self.rho > 0.0 && self.sigma > 0.0 && self.rho_equality_scale > 0.0) {
            return Err(DriveError::InvalidParameter("QP penalties must be positive".to_string()));
        }
        if !(self.alpha > 0.0 && self.alpha < 2.0) {
            return Err(DriveError::InvalidParameter(format!(
                "QP relaxation must lie in (0, 2), got {}",
                self.alpha
            )));
        }
        if !(self.eps_abs > 0.0 || self.eps_rel > 0.0) || self.max_iter == 0 {
            return Err(DriveError::InvalidParameter("QP tolerances and iteration cap must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QpProblem {
    pub h: DMatrix<f64>,
    pub f: DVector<f64>,
    pub g: DMatrix<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Solved,
    /// Iteration cap hit; the last iterate is returned
    MaxIterations,
    PrimalInfeasible,
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub status: QpStatus,
    pub iterations: usize,
}

impl QpProblem {
    fn check_dimensions(&self) -> DriveResult<()> {
        let n = self.h.nrows();
        let m = self.g.nrows();
        if self.h.ncols() != n || self.f.len() != n || self.g.ncols() != n {
            return Err(DriveError::InvalidParameter(format!(
                "QP cost is {}x{} with {} linear terms, constraints have {} columns",
                self.h.nrows(),
                self.h.ncols(),
                self.f.len(),
                self.g.ncols()
            )));
        }
        if self.lower.len() != m || self.upper.len() != m {
            return Err(DriveError::InvalidParameter(format!(
                "QP has {} constraint rows but {} lower and {} upper bounds",
                m,
                self.lower.len(),
                self.upper.len()
            )));
        }
        if self.lower.iter().zip(self.upper.iter()).any(|(l, u)| l > u) {
            return Err(DriveError::InvalidParameter("QP lower bound above upper bound".to_string()));
        }
        Ok(())
    }
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

fn project(v: &DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().zip(lower.iter().zip(upper.iter())).map(|(x, (l, u))| x.clamp(*l, *u)))
}

/// Variable bounds implied by the rows with a single nonzero entry
fn variable_bounds(problem: &QpProblem) -> (Vec<f64>, Vec<f64>) {
    let n = problem.g.ncols();
    let mut lo = vec![f64::NEG_INFINITY; n];
    let mut hi = vec![f64::INFINITY; n];
    for r in 0..problem.g.nrows() {
        let mut nonzero = (0..n).filter(|&k| problem.g[(r, k)] != 0.0);
        let k = match (nonzero.next(), nonzero.next()) {
            (Some(k), None) => k,
            _ => continue,
        };
        let a = problem.g[(r, k)];
        let (l, u) = if a > 0.0 {
            (problem.lower[r] / a, problem.upper[r] / a)
        } else {
            (problem.upper[r] / a, problem.lower[r] / a)
        };
        lo[k] = lo[k].max(l);
        hi[k] = hi[k].min(u);
    }
    (lo, hi)
}

/// Whether the variable bounds alone already rule out some constraint row
fn bounds_infeasible(problem: &QpProblem, tolerance: f64) -> bool {
    let (lo, hi) = variable_bounds(problem);
    if lo.iter().zip(hi.iter()).any(|(l, h)| *l > *h + tolerance) {
        return true;
    }
    (0..problem.g.nrows()).any(|r| {
        let (mut min, mut max) = (0.0, 0.0);
        for k in 0..problem.g.ncols() {
            let a = problem.g[(r, k)];
            if a > 0.0 {
                min += a * lo[k];
                max += a * hi[k];
            } else if a < 0.0 {
                min += a * hi[k];
                max += a * lo[k];
            }
        }
        min > problem.upper[r] + tolerance || max < problem.lower[r] - tolerance
    })
}

/// Solve `problem`, starting from `warm_start` when given
pub fn solve(problem: &QpProblem, settings: &QpSettings, warm_start: Option<&DVector<f64>>) -> DriveResult<QpSolution> {
    problem.check_dimensions()?;
    let n = problem.h.nrows();
    let (g, lower, upper) = (&problem.g, &problem.lower, &problem.upper);
    if bounds_infeasible(problem, settings.eps_abs) {
        debug!("QP rows cannot be met within the variable bounds");
        let x = match warm_start {
            Some(x0) if x0.len() == n => x0.clone(),
            _ => DVector::zeros(n),
        };
        return Ok(QpSolution { x, status: QpStatus::PrimalInfeasible, iterations: 0 });
    }

    let rho = DVector::from_iterator(
        g.nrows(),
        lower.iter().zip(upper.iter()).map(|(l, u)| {
            if (u - l).abs() <= 1e-9 {
                settings.rho * settings.rho_equality_scale
            } else {
                settings.rho
            }
        }),
    );
    let gt = g.transpose();
    let kkt = &problem.h + DMatrix::identity(n, n) * settings.sigma + &gt * DMatrix::from_diagonal(&rho) * g;
    let cholesky = kkt
        .cholesky()
        .ok_or_else(|| DriveError::NumericalError("QP system is not positive definite".to_string()))?;

    let mut x = match warm_start {
        Some(x0) if x0.len() == n => x0.clone(),
        _ => DVector::zeros(n),
    };
    let mut z = project(&(g * &x), lower, upper);
    let mut y = DVector::zeros(g.nrows());
    let alpha = settings.alpha;

    for iteration in 1..=settings.max_iter {
        let rhs = &x * settings.sigma - &problem.f + &gt * (rho.component_mul(&z) - &y);
        let x_tilde = cholesky.solve(&rhs);
        let z_tilde = g * &x_tilde;

        let x_next = &x_tilde * alpha + &x * (1.0 - alpha);
        let z_relaxed = &z_tilde * alpha + &z * (1.0 - alpha);
        let z_next = project(&(&z_relaxed + y.component_div(&rho)), lower, upper);
        let y_next = &y + rho.component_mul(&(&z_relaxed - &z_next));
        let delta_y = &y_next - &y;

        x = x_next;
        z = z_next;
        y = y_next;

        let gx = g * &x;
        let hx = &problem.h * &x;
        let gty = &gt * &y;
        let r_prim = inf_norm(&(&gx - &z));
        let r_dual = inf_norm(&(&hx + &problem.f + &gty));
        let eps_prim = settings.eps_abs + settings.eps_rel * inf_norm(&gx).max(inf_norm(&z));
        let eps_dual = settings.eps_abs
            + settings.eps_rel * inf_norm(&hx).max(inf_norm(&gty)).max(inf_norm(&problem.f));
        if r_prim <= eps_prim && r_dual <= eps_dual {
            debug!("QP solved in {} iterations", iteration);
            return Ok(QpSolution { x, status: QpStatus::Solved, iterations: iteration });
        }

        let dy_norm = inf_norm(&delta_y);
        if dy_norm > 1e-8 {
            let support: f64 = delta_y
                .iter()
                .zip(lower.iter().zip(upper.iter()))
                .map(|(dy, (l, u))| if *dy > 0.0 { u * dy } else { l * dy })
                .sum();
            if inf_norm(&(&gt * &delta_y)) <= settings.eps_prim_inf * dy_norm
                && support <= -settings.eps_prim_inf * dy_norm
            {
                debug!("QP primal infeasible after {} iterations", iteration);
                return Ok(QpSolution { x, status: QpStatus::PrimalInfeasible, iterations: iteration });
            }
        }
    }

    Ok(QpSolution { x, status: QpStatus::MaxIterations, iterations: settings.max_iter })
}
