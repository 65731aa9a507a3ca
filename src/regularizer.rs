//! The sparsity regularization added to the prediction loss during training, together with its analytic gradients.
//!
//! Per layer, the penalty is
//! `lamb_l1 * Σ shrink(s) + lamb_entropy * H(s) + lamb_coef * Σ|coef| / out_dim + lamb_coefdiff * Σ|Δcoef| / out_dim`
//! where `s` is the layer's [`acts_scale_spline`](crate::kan::activation_cache::LayerActivations::acts_scale_spline),
//! `shrink` is a two-regime L1 that treats values below `small_mag_threshold` separately, `H` is the entropy (base 2) of `s`
//! normalized to a distribution, and `Δcoef` is the difference between neighboring spline coefficients of an edge.

use nalgebra::DMatrix;

use crate::kan::{kan_error::KanError, Kan};

/// Weights and constants of the regularization penalty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizationOptions {
    /// overall weight of the penalty relative to the prediction loss
    pub lamb: f64,
    #[allow(missing_docs)]
    pub lamb_l1: f64,
    #[allow(missing_docs)]
    pub lamb_entropy: f64,
    /// weight of the L1 norm of the spline coefficients
    pub lamb_coef: f64,
    /// weight of the L1 norm of the differences between neighboring spline coefficients
    pub lamb_coefdiff: f64,
    /// scales below this value are shrunk by `small_reg_factor`
    pub small_mag_threshold: f64,
    #[allow(missing_docs)]
    pub small_reg_factor: f64,
}

impl Default for RegularizationOptions {
    /// * `lamb`: 0.0 (no regularization)
    /// * `lamb_l1`: 1.0
    /// * `lamb_entropy`: 2.0
    /// * `lamb_coef`: 0.0
    /// * `lamb_coefdiff`: 0.0
    /// * `small_mag_threshold`: 1e-16
    /// * `small_reg_factor`: 1.0
    fn default() -> Self {
        RegularizationOptions {
            lamb: 0.0,
            lamb_l1: 1.0,
            lamb_entropy: 2.0,
            lamb_coef: 0.0,
            lamb_coefdiff: 0.0,
            small_mag_threshold: 1e-16,
            small_reg_factor: 1.0,
        }
    }
}

/// The value of the penalty (before `lamb` is applied) and its gradients
#[derive(Debug, Clone, PartialEq)]
pub struct Regularization {
    #[allow(missing_docs)]
    pub value: f64,
    /// gradient w.r.t. every layer's `acts_scale_spline`, `[out_dim, in_dim]` per layer
    pub scale_gradients: Vec<DMatrix<f64>>,
    /// gradient w.r.t. every layer's spline coefficients, `[edges, num_basis]` per layer
    pub coef_gradients: Vec<DMatrix<f64>>,
}

const ENTROPY_FLOOR: f64 = 1e-4;

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// the two-regime L1 term and its derivative. Exactly at the threshold both are zero.
fn shrink(x: f64, threshold: f64, factor: f64) -> (f64, f64) {
    if x < threshold {
        (x * factor, factor)
    } else if x > threshold {
        (x + (factor - 1.0) * threshold, 1.0)
    } else {
        (0.0, 0.0)
    }
}

/// `-Σ p log2(p + floor)` with `p = s / (Σs + floor)`, and its gradient w.r.t. `s`
fn entropy(scales: &DMatrix<f64>) -> (f64, DMatrix<f64>) {
    let total = scales.sum() + ENTROPY_FLOOR;
    let p = scales / total;
    let value = -p.iter().map(|p| p * (p + ENTROPY_FLOOR).log2()).sum::<f64>();
    let d_p = p.map(|p| -((p + ENTROPY_FLOOR).log2() + p / ((p + ENTROPY_FLOOR) * std::f64::consts::LN_2)));
    let weighted: f64 = d_p.iter().zip(scales.iter()).map(|(g, s)| g * s).sum();
    let gradient = d_p.map(|g| g / total - weighted / (total * total));
    (value, gradient)
}

/// Compute the penalty from the activations cached by the last forward pass and the current spline coefficients.
///
/// # Errors
/// returns a [`KanError`] if no forward pass has been run
pub fn regularize(model: &Kan, options: &RegularizationOptions) -> Result<Regularization, KanError> {
    let cache = model.cache().ok_or_else(KanError::missing_cache)?;
    let mut value = 0.0;
    let mut scale_gradients = Vec::with_capacity(model.depth());
    for activations in cache.layers.iter() {
        let scales = &activations.acts_scale_spline;
        let mut gradient = DMatrix::<f64>::zeros(scales.nrows(), scales.ncols());
        if options.lamb_l1 != 0.0 {
            for (s, g) in scales.iter().zip(gradient.iter_mut()) {
                let (l1, d_l1) = shrink(*s, options.small_mag_threshold, options.small_reg_factor);
                value += options.lamb_l1 * l1;
                *g += options.lamb_l1 * d_l1;
            }
        }
        if options.lamb_entropy != 0.0 {
            let (h, d_h) = entropy(scales);
            value += options.lamb_entropy * h;
            gradient += d_h * options.lamb_entropy;
        }
        scale_gradients.push(gradient);
    }

    let mut coef_gradients = Vec::with_capacity(model.depth());
    for layer in model.layers() {
        let coef = layer.coef();
        let out_dim = layer.out_dim().max(1) as f64;
        let mut gradient = DMatrix::<f64>::zeros(coef.nrows(), coef.ncols());
        if options.lamb_coef != 0.0 {
            value += options.lamb_coef * coef.iter().map(|c| c.abs()).sum::<f64>() / out_dim;
            gradient += coef.map(|c| options.lamb_coef * sign(c) / out_dim);
        }
        if options.lamb_coefdiff != 0.0 {
            for e in 0..coef.nrows() {
                for c in 0..coef.ncols().saturating_sub(1) {
                    let diff = coef[(e, c + 1)] - coef[(e, c)];
                    value += options.lamb_coefdiff * diff.abs() / out_dim;
                    let d = options.lamb_coefdiff * sign(diff) / out_dim;
                    gradient[(e, c + 1)] += d;
                    gradient[(e, c)] -= d;
                }
            }
        }
        coef_gradients.push(gradient);
    }
    Ok(Regularization {
        value,
        scale_gradients,
        coef_gradients,
    })
}
