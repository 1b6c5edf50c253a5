use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Outcome of a minimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub fun: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub success: bool,
}

/// Derivative-free minimizer over a box.
pub trait Optimizer {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> OptimizeResult;
}

/// Nelder-Mead simplex search. Every trial point is projected onto the bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NelderMead {
    /// Per free parameter; the budget is `max_iterations_per_dim * n`.
    pub max_iterations_per_dim: usize,
    pub max_evaluations_per_dim: usize,
    pub xatol: f64,
    pub fatol: f64,
    /// Initial simplex edge as a fraction of `x0`.
    pub initial_step: f64,
    /// Initial simplex edge for zero entries of `x0`.
    pub zero_step: f64,
    pub reflection: f64,
    pub expansion: f64,
    pub contraction: f64,
    pub shrink: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iterations_per_dim: 200,
            max_evaluations_per_dim: 400,
            xatol: 1e-4,
            fatol: 1e-10,
            initial_step: 0.05,
            zero_step: 0.00025,
            reflection: 1.0,
            expansion: 2.0,
            contraction: 0.5,
            shrink: 0.5,
        }
    }
}

fn project(x: &mut [f64], bounds: &[(f64, f64)]) {
    for (xi, &(lo, hi)) in x.iter_mut().zip(bounds) {
        *xi = xi.clamp(lo, hi);
    }
}

/// `a + t (b - a)`
fn lerp(a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(a, b)| a + t * (b - a)).collect()
}

impl Optimizer for NelderMead {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> OptimizeResult {
        let n = x0.len();
        let evaluations = Cell::new(0usize);
        let mut eval = |x: &[f64]| {
            evaluations.set(evaluations.get() + 1);
            let f = objective(x);
            if f.is_nan() {
                f64::INFINITY
            } else {
                f
            }
        };

        let mut start = x0.to_vec();
        project(&mut start, bounds);
        if n == 0 {
            let fun = eval(&start);
            return OptimizeResult {
                x: start,
                fun,
                iterations: 0,
                evaluations: 1,
                success: true,
            };
        }

        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        let f0 = eval(&start);
        simplex.push((start.clone(), f0));
        for i in 0..n {
            let mut x = start.clone();
            let step = if x[i] != 0.0 {
                self.initial_step * x[i]
            } else {
                self.zero_step
            };
            x[i] += step;
            project(&mut x, bounds);
            if x[i] == start[i] {
                x[i] -= step;
                project(&mut x, bounds);
            }
            let f = eval(&x);
            simplex.push((x, f));
        }

        let max_iter = self.max_iterations_per_dim * n;
        let max_eval = self.max_evaluations_per_dim * n;
        let mut iterations = 0;
        let mut success = false;

        loop {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            let (best, f_best) = (&simplex[0].0, simplex[0].1);
            let x_spread = simplex[1..]
                .iter()
                .flat_map(|(x, _)| x.iter().zip(best).map(|(a, b)| (a - b).abs()))
                .fold(0.0, f64::max);
            let f_spread = simplex[1..]
                .iter()
                .map(|(_, f)| (f - f_best).abs())
                .fold(0.0, f64::max);
            if x_spread <= self.xatol && f_spread <= self.fatol {
                success = true;
                break;
            }
            if iterations >= max_iter || evaluations.get() >= max_eval {
                break;
            }
            iterations += 1;

            let mut centroid = vec![0.0; n];
            for (x, _) in &simplex[..n] {
                for (c, xi) in centroid.iter_mut().zip(x) {
                    *c += xi / n as f64;
                }
            }
            let (worst, f_worst) = simplex[n].clone();
            let f_second = simplex[n - 1].1;

            let mut xr = lerp(&centroid, &worst, -self.reflection);
            project(&mut xr, bounds);
            let fr = eval(&xr);

            if fr < simplex[0].1 {
                let mut xe = lerp(&centroid, &xr, self.expansion);
                project(&mut xe, bounds);
                let fe = eval(&xe);
                simplex[n] = if fe < fr { (xe, fe) } else { (xr, fr) };
                continue;
            }
            if fr < f_second {
                simplex[n] = (xr, fr);
                continue;
            }

            let (mut xc, outside) = if fr < f_worst {
                (lerp(&centroid, &xr, self.contraction), true)
            } else {
                (lerp(&centroid, &worst, self.contraction), false)
            };
            project(&mut xc, bounds);
            let fc = eval(&xc);
            if (outside && fc <= fr) || (!outside && fc < f_worst) {
                simplex[n] = (xc, fc);
                continue;
            }

            let best = simplex[0].0.clone();
            for entry in simplex.iter_mut().skip(1) {
                let mut x = lerp(&best, &entry.0, self.shrink);
                project(&mut x, bounds);
                let f = eval(&x);
                *entry = (x, f);
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (x, fun) = simplex.swap_remove(0);
        let evaluations = evaluations.get();
        debug!(iterations, evaluations, fun, success, "Nelder-Mead finished");
        OptimizeResult {
            x,
            fun,
            iterations,
            evaluations,
            success,
        }
    }
}
