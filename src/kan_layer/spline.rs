//! B-spline helpers shared by every edge of a [`KanLayer`](crate::kan_layer::KanLayer)

use nalgebra::{DMatrix, DVector, SVD};

/// generate `num` values evenly spaced between `min` and `max` inclusive
pub(crate) fn linspace(min: f64, max: f64, num: usize) -> Vec<f64> {
    if num <= 1 {
        return vec![min; num];
    }
    let mut values = Vec::with_capacity(num);
    let num_intervals = num - 1;
    let step_size = (max - min) / (num_intervals) as f64;
    for i in 0..num_intervals {
        values.push(min + i as f64 * step_size);
    }
    values.push(max);
    values
}

/// pad an interior grid with `k` evenly spaced knots on either side, using the interior grid's average spacing
pub(crate) fn extend_grid(interior: &[f64], k: usize) -> Vec<f64> {
    let first = interior[0];
    let last = interior[interior.len() - 1];
    let step_size = (last - first) / (interior.len() - 1).max(1) as f64;
    let mut knots = Vec::with_capacity(interior.len() + 2 * k);
    for pad in (1..=k).rev() {
        knots.push(first - pad as f64 * step_size);
    }
    knots.extend_from_slice(interior);
    for pad in 1..=k {
        knots.push(last + pad as f64 * step_size);
    }
    knots
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Cox-de Boor table of every basis function of degree `0..=k` at `t`. Row `d` holds `knots.len() - d - 1` values.
fn basis_table(t: f64, k: usize, knots: &[f64]) -> Vec<Vec<f64>> {
    let mut table = Vec::with_capacity(k + 1);
    let degree_zero: Vec<f64> = knots
        .windows(2)
        .map(|w| if w[0] <= t && t < w[1] { 1.0 } else { 0.0 })
        .collect();
    table.push(degree_zero);
    for d in 1..=k {
        let prev = &table[d - 1];
        let row: Vec<f64> = (0..knots.len() - d - 1)
            .map(|i| {
                let left = ratio(t - knots[i], knots[i + d] - knots[i]);
                let right = ratio(knots[i + d + 1] - t, knots[i + d + 1] - knots[i + 1]);
                left * prev[i] + right * prev[i + 1]
            })
            .collect();
        table.push(row);
    }
    table
}

/// values at `t` of the `knots.len() - k - 1` degree-`k` basis functions defined over `knots`
pub(crate) fn basis(t: f64, k: usize, knots: &[f64]) -> Vec<f64> {
    let mut table = basis_table(t, k, knots);
    table.swap_remove(k)
}

/// values and first derivatives at `t` of the degree-`k` basis functions defined over `knots`
pub(crate) fn basis_with_derivative(t: f64, k: usize, knots: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut table = basis_table(t, k, knots);
    let values = table.swap_remove(k);
    if k == 0 {
        let zeros = vec![0.0; values.len()];
        return (values, zeros);
    }
    let lower = &table[k - 1];
    let degree = k as f64;
    let derivatives = (0..values.len())
        .map(|i| {
            degree
                * (ratio(lower[i], knots[i + k] - knots[i])
                    - ratio(lower[i + 1], knots[i + k + 1] - knots[i + 1]))
        })
        .collect();
    (values, derivatives)
}

/// Least-squares spline coefficients such that `sum_c coef[c] * B_c(x[s]) ~= y[s]` for every sample `s`
///
/// # Errors
/// returns the SVD's error message if the normal equations cannot be solved
pub(crate) fn curve_to_coef(
    x: &[f64],
    y: &[f64],
    knots: &[f64],
    k: usize,
) -> Result<Vec<f64>, &'static str> {
    let num_basis = knots.len() - k - 1;
    let rows: Vec<Vec<f64>> = x.iter().map(|&t| basis(t, k, knots)).collect();
    let regressor_matrix = DMatrix::from_fn(x.len(), num_basis, |s, c| rows[s][c]);
    let target_matrix = DVector::from_column_slice(y);
    let xtx = regressor_matrix.tr_mul(&regressor_matrix);
    let xty = regressor_matrix.tr_mul(&target_matrix);
    let svd = SVD::new(xtx, true, true);
    let solution = svd.solve(&xty, 1e-6)?;
    Ok(solution.iter().copied().collect())
}
