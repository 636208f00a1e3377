//! Bound-constrained dosage fitting.
//!
//! The delta objective is a sum of squares of terms linear in the dosages,
//! so finding the best dosages is a box-constrained least-squares problem.
//! It is solved with a bounded-variable active-set method: repeatedly solve
//! the normal equations over the free members, walk toward that solution
//! until a bound blocks the step, and release a bound member whenever its
//! gradient points back into the box. The objective is convex, so the
//! resulting point is the global optimum. Combinations whose members are
//! linearly dependent make the subsystem singular; those fall back to
//! cyclic coordinate descent, which tolerates rank deficiency.

use crate::error::{Error, Result};
use crate::score::{norm, ResidualSystem};
use crate::Dosages;

/// Inclusive dosage bounds of one combination member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseRange {
    pub min: f64,
    pub max: f64,
}

impl DoseRange {
    pub fn new(min: f64, max: f64) -> Self {
        DoseRange { min, max }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Sweep budget of the coordinate-descent fallback.
const MAX_SWEEPS: usize = 500;

/// Pivot threshold below which the free subsystem counts as singular.
const SINGULAR_EPS: f64 = 1e-12;

/// Slack allowed on Karush-Kuhn-Tucker gradient checks.
const KKT_EPS: f64 = 1e-9;

/// Minimize the system's delta over the box given by `ranges`, starting
/// from `initial` (clamped into the box). Returns the dosage vector and
/// the delta it attains. `ftol` governs the coordinate-descent fallback;
/// `OptimizerNonConvergent` is returned when neither path settles.
pub(crate) fn minimize(
    system: &ResidualSystem,
    ranges: &[DoseRange],
    initial: &[f64],
    ftol: f64,
) -> Result<(Dosages, f64)> {
    let n = ranges.len();
    if n == 0 {
        return Ok((Dosages::new(), norm(&system.rhs)));
    }

    // normal equations: gram = A'A, rhs = A'b
    let gram: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| dot(&system.columns[i], &system.columns[j])).collect())
        .collect();
    let rhs: Vec<f64> = (0..n).map(|i| dot(&system.columns[i], &system.rhs)).collect();

    if let Some(x) = active_set(&gram, &rhs, ranges, initial) {
        let dosages: Dosages = x.iter().copied().collect();
        let delta = system.delta(&dosages);
        return Ok((dosages, delta));
    }
    coordinate_descent(system, ranges, initial, ftol)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn active_set(
    gram: &[Vec<f64>],
    rhs: &[f64],
    ranges: &[DoseRange],
    initial: &[f64],
) -> Option<Vec<f64>> {
    let n = rhs.len();
    let mut x: Vec<f64> = initial
        .iter()
        .zip(ranges)
        .map(|(&value, range)| range.clamp(value))
        .collect();
    let mut free = vec![true; n];

    for _ in 0..10 * n + 10 {
        // pull the free members to the optimum of their subsystem, fixing
        // each member that a bound blocks on the way
        loop {
            let free_members: Vec<usize> = (0..n).filter(|&i| free[i]).collect();
            if free_members.is_empty() {
                break;
            }
            let goal = solve_subsystem(gram, rhs, &x, &free_members, &free)?;

            // largest feasible step toward the subsystem optimum
            let mut step = 1.0;
            let mut blocking = None;
            for (k, &i) in free_members.iter().enumerate() {
                let direction = goal[k] - x[i];
                let bound = if direction < 0.0 && goal[k] < ranges[i].min {
                    ranges[i].min
                } else if direction > 0.0 && goal[k] > ranges[i].max {
                    ranges[i].max
                } else {
                    continue;
                };
                let ratio = (bound - x[i]) / direction;
                if ratio < step {
                    step = ratio;
                    blocking = Some((i, bound));
                }
            }

            match blocking {
                None => {
                    for (k, &i) in free_members.iter().enumerate() {
                        x[i] = goal[k];
                    }
                    break;
                }
                Some((blocked, bound)) => {
                    for (k, &i) in free_members.iter().enumerate() {
                        x[i] = ranges[i].clamp(x[i] + step * (goal[k] - x[i]));
                    }
                    x[blocked] = bound;
                    free[blocked] = false;
                }
            }
        }

        // descent gradient; the bound member pointing hardest back into the
        // box re-enters, and the optimum is reached once none does
        let mut released = None;
        let mut worst = KKT_EPS;
        for i in 0..n {
            if free[i] {
                continue;
            }
            let gradient = rhs[i] - dot(&gram[i], &x);
            let violation = if x[i] <= ranges[i].min {
                gradient
            } else {
                -gradient
            };
            if violation > worst {
                worst = violation;
                released = Some(i);
            }
        }
        match released {
            Some(i) => free[i] = true,
            None => return Some(x),
        }
    }
    None
}

/// Solve the normal equations restricted to the free members, with the
/// bound members fixed at their current values. `None` when singular.
fn solve_subsystem(
    gram: &[Vec<f64>],
    rhs: &[f64],
    x: &[f64],
    free_members: &[usize],
    free: &[bool],
) -> Option<Vec<f64>> {
    let m = free_members.len();
    let mut matrix: Vec<Vec<f64>> = free_members
        .iter()
        .map(|&i| free_members.iter().map(|&j| gram[i][j]).collect())
        .collect();
    let mut vector: Vec<f64> = free_members
        .iter()
        .map(|&i| {
            let fixed: f64 = (0..x.len()).filter(|&j| !free[j]).map(|j| gram[i][j] * x[j]).sum();
            rhs[i] - fixed
        })
        .collect();

    // Gaussian elimination with partial pivoting
    for column in 0..m {
        let pivot_row = (column..m)
            .max_by(|&a, &b| {
                matrix[a][column]
                    .abs()
                    .partial_cmp(&matrix[b][column].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(column);
        if matrix[pivot_row][column].abs() < SINGULAR_EPS {
            return None;
        }
        matrix.swap(column, pivot_row);
        vector.swap(column, pivot_row);
        for row in column + 1..m {
            let factor = matrix[row][column] / matrix[column][column];
            if factor == 0.0 {
                continue;
            }
            for k in column..m {
                matrix[row][k] -= factor * matrix[column][k];
            }
            vector[row] -= factor * vector[column];
        }
    }
    let mut solution = vec![0.0; m];
    for row in (0..m).rev() {
        let tail: f64 = (row + 1..m).map(|k| matrix[row][k] * solution[k]).sum();
        solution[row] = (vector[row] - tail) / matrix[row][row];
    }
    Some(solution)
}

/// Rank-deficiency fallback: exact one-dimensional minimization per member,
/// cycled until one sweep changes delta by no more than `ftol`.
fn coordinate_descent(
    system: &ResidualSystem,
    ranges: &[DoseRange],
    initial: &[f64],
    ftol: f64,
) -> Result<(Dosages, f64)> {
    let mut x: Dosages = initial
        .iter()
        .zip(ranges)
        .map(|(&value, range)| range.clamp(value))
        .collect();
    let mut residual = system.residual(&x);
    let mut delta = norm(&residual);

    for _ in 0..MAX_SWEEPS {
        for (i, range) in ranges.iter().enumerate() {
            let column = &system.columns[i];
            let denominator = dot(column, column);
            if denominator == 0.0 {
                continue;
            }
            let moved = range.clamp(x[i] + dot(column, &residual) / denominator);
            let change = moved - x[i];
            if change != 0.0 {
                for (r, coefficient) in residual.iter_mut().zip(column) {
                    *r -= coefficient * change;
                }
                x[i] = moved;
            }
        }

        let swept = norm(&residual);
        if (delta - swept).abs() <= ftol {
            return Ok((x, swept));
        }
        delta = swept;
    }

    Err(Error::OptimizerNonConvergent)
}
