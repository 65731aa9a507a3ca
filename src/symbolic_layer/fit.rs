//! Fitting the affine parameters of a symbolic edge `c * f(a * x + b) + d` to sampled activations

use log::trace;

use super::symbolic_function::SymbolicFunction;
use crate::kan_layer::spline::linspace;

/// Search settings for [`fit_params`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    /// initial search range for the inner scale `a`
    pub a_range: (f64, f64),
    /// initial search range for the inner shift `b`
    pub b_range: (f64, f64),
    /// points per axis of the search grid
    pub grid_number: usize,
    /// number of grid searches, each narrowed around the previous best cell
    pub iterations: usize,
}

impl Default for FitOptions {
    /// * `a_range`: (-10, 10)
    /// * `b_range`: (-10, 10)
    /// * `grid_number`: 101
    /// * `iterations`: 3
    fn default() -> Self {
        FitOptions {
            a_range: (-10.0, 10.0),
            b_range: (-10.0, 10.0),
            grid_number: 101,
            iterations: 3,
        }
    }
}

/// The fitted parameters of `c * f(a * x + b) + d` and the fit's goodness score
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub struct AffineFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    /// squared correlation between `f(a * x + b)` and `y`, in `[0, 1]`
    pub r2: f64,
}

fn nan_to_num(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else if value == f64::INFINITY {
        f64::MAX
    } else if value == f64::NEG_INFINITY {
        f64::MIN
    } else {
        value
    }
}

/// non-finite evaluations count as zero
fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// squared correlation of `p` and `y`, damped for near-constant inputs
fn squared_correlation(p: &[f64], y: &[f64], y_mean: f64, y_spread: f64) -> f64 {
    let p_mean = mean(p);
    let mut covariance = 0.0;
    let mut p_spread = 0.0;
    for (pv, yv) in p.iter().zip(y.iter()) {
        covariance += (pv - p_mean) * (yv - y_mean);
        p_spread += (pv - p_mean) * (pv - p_mean);
    }
    nan_to_num(covariance * covariance / (p_spread * y_spread + 1e-4))
}

/// Fit `y ~= c * f(a * x + b) + d`.
///
/// `a` and `b` are found by a grid search maximizing the squared correlation between `f(a * x + b)` and `y`, repeated
/// `options.iterations` times on a grid narrowed around the previous best cell (or, when the best value sits on the boundary
/// of the grid, around the boundary cell). `c` and `d` then come from a simple linear regression of `y` on `f(a * x + b)`.
/// Non-finite values count as zero throughout, so degenerate inputs produce a score of zero rather than an error.
pub fn fit_params(
    x: &[f64],
    y: &[f64],
    function: SymbolicFunction,
    options: &FitOptions,
) -> AffineFit {
    if x.is_empty() || x.len() != y.len() || options.grid_number < 2 {
        return AffineFit {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            r2: 0.0,
        };
    }
    let y_mean = mean(y);
    let y_spread: f64 = y.iter().map(|v| (v - y_mean) * (v - y_mean)).sum();
    let grid_number = options.grid_number;
    let mut a_range = options.a_range;
    let mut b_range = options.b_range;
    let mut post = vec![0.0; x.len()];
    let mut best = (0.0, 0.0, f64::NEG_INFINITY);

    for iteration in 0..options.iterations.max(1) {
        let a_values = linspace(a_range.0, a_range.1, grid_number);
        let b_values = linspace(b_range.0, b_range.1, grid_number);
        let mut best_r2 = f64::NEG_INFINITY;
        let (mut a_id, mut b_id) = (0, 0);
        for (ai, a) in a_values.iter().enumerate() {
            for (bi, b) in b_values.iter().enumerate() {
                for (p, xv) in post.iter_mut().zip(x.iter()) {
                    *p = finite_or_zero(function.evaluate(a * xv + b));
                }
                let r2 = squared_correlation(&post, y, y_mean, y_spread);
                if r2 > best_r2 {
                    best_r2 = r2;
                    a_id = ai;
                    b_id = bi;
                }
            }
        }
        trace!(
            "{} iteration {}: a = {}, b = {}, r2 = {}",
            function,
            iteration,
            a_values[a_id],
            b_values[b_id],
            best_r2
        );
        best = (a_values[a_id], b_values[b_id], best_r2);

        let last = grid_number - 1;
        let on_boundary = a_id == 0 || a_id == last || b_id == 0 || b_id == last;
        if on_boundary {
            if a_id == 0 {
                a_range = (a_values[0], a_values[1]);
            }
            if a_id == last {
                a_range = (a_values[last - 1], a_values[last]);
            }
            if b_id == 0 {
                b_range = (b_values[0], b_values[1]);
            }
            if b_id == last {
                b_range = (b_values[last - 1], b_values[last]);
            }
        } else {
            a_range = (a_values[a_id - 1], a_values[a_id + 1]);
            b_range = (b_values[b_id - 1], b_values[b_id + 1]);
        }
    }

    let (a, b, r2) = best;
    let post: Vec<f64> = x
        .iter()
        .map(|xv| finite_or_zero(function.evaluate(a * xv + b)))
        .collect();
    let p_mean = mean(&post);
    let mut covariance = 0.0;
    let mut p_spread = 0.0;
    for (pv, yv) in post.iter().zip(y.iter()) {
        covariance += (pv - p_mean) * (yv - y_mean);
        p_spread += (pv - p_mean) * (pv - p_mean);
    }
    let c = if p_spread > 0.0 && p_spread.is_finite() {
        covariance / p_spread
    } else {
        0.0
    };
    let d = y_mean - c * p_mean;
    AffineFit { a, b, c, d, r2 }
}
