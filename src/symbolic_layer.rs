pub mod fit;
pub mod symbolic_function;

use fit::{fit_params, FitOptions};
use log::debug;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use symbolic_function::SymbolicFunction;

use crate::kan_layer::kan_layer_errors::KanLayerError;

/// The symbolic half of a network layer.
///
/// Every edge `(i, j)` from input `i` to output `j` computes `mask * (c * f(a * x + b) + d)`, where `f` is a primitive from the
/// [`SymbolicFunction`] library and `[a, b, c, d]` are the edge's affine parameters. The mask is stored as an `[out_dim, in_dim]`
/// matrix; the affine parameters and primitives are stored flat at index `j * in_dim + i`.
///
/// A new layer has every primitive set to [`SymbolicFunction::Zero`] and every mask entry off, so it contributes nothing until
/// edges are fixed and switched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicLayer {
    in_dim: usize,
    out_dim: usize,
    mask: DMatrix<f64>,
    affine: Vec<[f64; 4]>,
    functions: Vec<Option<SymbolicFunction>>,
    #[serde(skip)]
    last_input: Option<DMatrix<f64>>,
}

impl SymbolicLayer {
    /// create a layer with every edge off and set to the zero function
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        let edges = in_dim * out_dim;
        SymbolicLayer {
            in_dim,
            out_dim,
            mask: DMatrix::zeros(out_dim, in_dim),
            affine: vec![[0.0; 4]; edges],
            functions: vec![Some(SymbolicFunction::Zero); edges],
            last_input: None,
        }
    }

    /// the number of inputs to the layer
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// the number of outputs of the layer
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// symbolic mask, `[out_dim, in_dim]`
    pub fn mask(&self) -> &DMatrix<f64> {
        &self.mask
    }

    pub(crate) fn set_mask_value(&mut self, i: usize, j: usize, value: f64) {
        self.mask[(j, i)] = value;
    }

    /// `[a, b, c, d]` of edge `(i, j)`
    pub fn affine(&self, i: usize, j: usize) -> [f64; 4] {
        self.affine[j * self.in_dim + i]
    }

    /// overwrite the affine parameters of edge `(i, j)`
    pub fn set_affine(&mut self, i: usize, j: usize, affine: [f64; 4]) {
        self.affine[j * self.in_dim + i] = affine;
    }

    /// the primitive edge `(i, j)` is fixed to, or `None` if it has been cleared
    pub fn function(&self, i: usize, j: usize) -> Option<SymbolicFunction> {
        self.functions[j * self.in_dim + i]
    }

    /// Fix edge `(i, j)` to `function`.
    ///
    /// With `data = Some((x, y, options))` the affine parameters are fit so that `c * f(a * x + b) + d ~= y` and the fit's
    /// goodness score is returned. Without data the affine parameters become `[1, 0, 1, 0]` and `None` is returned.
    /// The mask is left untouched.
    pub fn fix_symbolic(
        &mut self,
        i: usize,
        j: usize,
        function: SymbolicFunction,
        data: Option<(&[f64], &[f64], &FitOptions)>,
    ) -> Option<f64> {
        let e = j * self.in_dim + i;
        self.functions[e] = Some(function);
        match data {
            Some((x, y, options)) => {
                let fit = fit_params(x, y, function, options);
                debug!(
                    "fixed edge ({}, {}) to {} with a={:.4} b={:.4} c={:.4} d={:.4}, r2={:.4}",
                    i, j, function, fit.a, fit.b, fit.c, fit.d, fit.r2
                );
                self.affine[e] = [fit.a, fit.b, fit.c, fit.d];
                Some(fit.r2)
            }
            None => {
                self.affine[e] = [1.0, 0.0, 1.0, 0.0];
                None
            }
        }
    }

    /// forget the primitive of edge `(i, j)`
    pub fn clear_function(&mut self, i: usize, j: usize) {
        self.functions[j * self.in_dim + i] = None;
    }

    fn edge_value(&self, e: usize, x: f64) -> f64 {
        let [a, b, c, d] = self.affine[e];
        match self.functions[e] {
            Some(function) => c * function.evaluate(a * x + b) + d,
            None => 0.0,
        }
    }

    /// the (unmasked) value of edge `(i, j)` at `x`
    pub fn evaluate_edge(&self, i: usize, j: usize, x: f64) -> f64 {
        self.edge_value(j * self.in_dim + i, x)
    }

    /// Evaluate the layer without remembering the input.
    ///
    /// Returns the per-output sums (`[batch, out_dim]`) and the masked edge outputs (`[batch, out_dim * in_dim]`).
    ///
    /// # Errors
    /// returns a [`KanLayerError`] if `x` does not have `in_dim` columns
    pub fn infer(&self, x: &DMatrix<f64>) -> Result<(DMatrix<f64>, DMatrix<f64>), KanLayerError> {
        if x.ncols() != self.in_dim {
            return Err(KanLayerError::missized_input(x.ncols(), self.in_dim));
        }
        let batch = x.nrows();
        let mut output = DMatrix::zeros(batch, self.out_dim);
        let mut postacts = DMatrix::zeros(batch, self.in_dim * self.out_dim);
        for j in 0..self.out_dim {
            for i in 0..self.in_dim {
                let mask = self.mask[(j, i)];
                if mask == 0.0 {
                    continue;
                }
                let e = j * self.in_dim + i;
                for b in 0..batch {
                    let value = mask * self.edge_value(e, x[(b, i)]);
                    postacts[(b, e)] = value;
                    output[(b, j)] += value;
                }
            }
        }
        Ok((output, postacts))
    }

    /// as [`SymbolicLayer::infer`], remembering the input for [`SymbolicLayer::backward`]
    pub fn forward(
        &mut self,
        x: &DMatrix<f64>,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>), KanLayerError> {
        let result = self.infer(x)?;
        self.last_input = Some(x.clone());
        Ok(result)
    }

    /// Gradient of the loss w.r.t. the layer input, given the gradient w.r.t. every edge output.
    /// The affine parameters are not trained, so nothing is accumulated.
    ///
    /// # Errors
    /// * [`KanLayerError`] if called before [`SymbolicLayer::forward`]
    /// * [`KanLayerError`] if `d_postacts` does not match the last forward pass
    pub fn backward(&self, d_postacts: &DMatrix<f64>) -> Result<DMatrix<f64>, KanLayerError> {
        let input = self
            .last_input
            .as_ref()
            .ok_or_else(KanLayerError::backward_before_forward)?;
        let edges = self.in_dim * self.out_dim;
        if d_postacts.ncols() != edges {
            return Err(KanLayerError::missized_gradient(d_postacts.ncols(), edges));
        }
        if d_postacts.nrows() != input.nrows() {
            return Err(KanLayerError::missized_gradient(
                d_postacts.nrows(),
                input.nrows(),
            ));
        }
        let mut d_input = DMatrix::zeros(input.nrows(), self.in_dim);
        for j in 0..self.out_dim {
            for i in 0..self.in_dim {
                let mask = self.mask[(j, i)];
                let e = j * self.in_dim + i;
                let Some(function) = self.functions[e] else {
                    continue;
                };
                if mask == 0.0 {
                    continue;
                }
                let [a, b, c, _] = self.affine[e];
                for row in 0..input.nrows() {
                    let slope = mask * c * a * function.derivative(a * input[(row, i)] + b);
                    d_input[(row, i)] += d_postacts[(row, e)] * slope;
                }
            }
        }
        Ok(d_input)
    }

    /// A copy of this layer restricted to the inputs `in_ids` and outputs `out_ids`, in the given order
    pub fn subset(&self, in_ids: &[usize], out_ids: &[usize]) -> SymbolicLayer {
        let in_dim = in_ids.len();
        let out_dim = out_ids.len();
        let source_edge = |e: usize| out_ids[e / in_dim] * self.in_dim + in_ids[e % in_dim];
        SymbolicLayer {
            in_dim,
            out_dim,
            mask: DMatrix::from_fn(out_dim, in_dim, |j, i| self.mask[(out_ids[j], in_ids[i])]),
            affine: (0..in_dim * out_dim)
                .map(|e| self.affine[source_edge(e)])
                .collect(),
            functions: (0..in_dim * out_dim)
                .map(|e| self.functions[source_edge(e)])
                .collect(),
            last_input: None,
        }
    }
}
