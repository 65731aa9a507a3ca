pub mod kan_layer_errors;
pub(crate) mod spline;

use kan_layer_errors::KanLayerError;
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use spline::{basis, basis_with_derivative, curve_to_coef, extend_grid, linspace};
use statrs::distribution::Normal;

/// The numeric half of a network layer.
///
/// Every edge `(i, j)` from input `i` to output `j` computes
/// `mask * (scale_base * silu(x) + scale_sp * spline(x))`, where `spline` is a degree-`k` B-spline over a grid shared by every edge
/// reading from input `i`. Edges are stored flat, at index `j * in_dim + i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KanLayer {
    in_dim: usize,
    out_dim: usize,
    /// number of grid intervals
    grid_size: usize,
    /// spline degree
    k: usize,
    /// extended knot vector for each input. dim0 = in_dim, dim1 = grid_size + 2k + 1
    grid: DMatrix<f64>,
    /// spline coefficients. dim0 = number of edges, dim1 = grid_size + k
    coef: DMatrix<f64>,
    scale_base: DVector<f64>,
    scale_sp: DVector<f64>,
    mask: DVector<f64>,
    /// weight of the uniform grid when refreshing the grid from samples; 1.0 ignores the sample quantiles entirely
    grid_eps: f64,
    sb_trainable: bool,
    sp_trainable: bool,
    #[serde(skip)]
    gradients: Option<LayerGradients>,
    #[serde(skip)] // part of the layer's operating state, not part of the model
    forward_state: Option<ForwardState>,
}

#[derive(Debug, Clone, PartialEq)]
struct LayerGradients {
    coef: DMatrix<f64>,
    scale_base: DVector<f64>,
    scale_sp: DVector<f64>,
}

impl LayerGradients {
    fn zeros(edges: usize, num_basis: usize) -> Self {
        LayerGradients {
            coef: DMatrix::zeros(edges, num_basis),
            scale_base: DVector::zeros(edges),
            scale_sp: DVector::zeros(edges),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ForwardState {
    input: DMatrix<f64>,
    /// dim0 = batch, dim1 = in_dim * num_basis
    basis: DMatrix<f64>,
    basis_derivative: DMatrix<f64>,
}

/// Hyperparameters for a [`KanLayer`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub struct KanLayerOptions {
    pub in_dim: usize,
    pub out_dim: usize,
    pub grid: usize,
    pub k: usize,
    pub noise_scale: f64,
    pub scale_base_mu: f64,
    pub scale_base_sigma: f64,
    pub grid_eps: f64,
    pub grid_range: (f64, f64),
    pub sp_trainable: bool,
    pub sb_trainable: bool,
}

/// Everything a forward pass through a [`KanLayer`] produces.
///
/// Per-edge matrices have one row per sample and one column per edge, at column `j * in_dim + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerForward {
    /// per-output sums of the edge activations. dim0 = batch, dim1 = out_dim
    pub output: DMatrix<f64>,
    /// the input value seen by each edge
    pub preacts: DMatrix<f64>,
    /// the masked, scaled output of each edge
    pub postacts: DMatrix<f64>,
    /// the raw spline output of each edge, before masking and scaling
    pub postspline: DMatrix<f64>,
}

fn silu(x: f64) -> f64 {
    x / (1.0 + (-x).exp())
}

fn silu_derivative(x: f64) -> f64 {
    let sigmoid = 1.0 / (1.0 + (-x).exp());
    sigmoid + x * sigmoid * (1.0 - sigmoid)
}

/// Grid for `sorted` samples, blending `num_intervals + 1` sample quantiles with a uniform grid over the same span
fn sample_grid(sorted: &[f64], num_intervals: usize, grid_eps: f64) -> Vec<f64> {
    let n = sorted.len();
    let mut adaptive: Vec<f64> = (0..num_intervals)
        .map(|p| sorted[n * p / num_intervals])
        .collect();
    adaptive.push(sorted[n - 1]);
    let first = adaptive[0];
    let step_size = (adaptive[num_intervals] - first) / num_intervals as f64;
    adaptive
        .iter()
        .enumerate()
        .map(|(p, a)| grid_eps * (first + p as f64 * step_size) + (1.0 - grid_eps) * a)
        .collect()
}

impl KanLayer {
    /// Create a new layer with a uniform grid over `options.grid_range`.
    ///
    /// Spline coefficients are drawn from `Normal(0, noise_scale / grid)`, `scale_base` is drawn uniformly from
    /// `(mu - sigma, mu + sigma) / sqrt(in_dim)` and `scale_sp` starts at `1 / sqrt(in_dim)`. Every edge starts unmasked.
    pub fn new<R: Rng>(options: &KanLayerOptions, rng: &mut R) -> Self {
        let edges = options.in_dim * options.out_dim;
        let interior = linspace(options.grid_range.0, options.grid_range.1, options.grid + 1);
        let knots = extend_grid(&interior, options.k);
        let grid = DMatrix::from_fn(options.in_dim, knots.len(), |_, c| knots[c]);
        let num_basis = options.grid + options.k;
        let coef = match Normal::new(0.0, options.noise_scale / options.grid as f64) {
            Ok(distribution) => DMatrix::from_fn(edges, num_basis, |_, _| {
                rand::distributions::Distribution::sample(&distribution, rng)
            }),
            // a zero noise scale gives an invalid distribution; start from flat splines instead
            Err(_) => DMatrix::zeros(edges, num_basis),
        };
        let fan_in = (options.in_dim as f64).sqrt();
        let scale_base = DVector::from_fn(edges, |_, _| {
            options.scale_base_mu / fan_in
                + options.scale_base_sigma * (rng.gen::<f64>() * 2.0 - 1.0) / fan_in
        });
        KanLayer {
            in_dim: options.in_dim,
            out_dim: options.out_dim,
            grid_size: options.grid,
            k: options.k,
            grid,
            coef,
            scale_base,
            scale_sp: DVector::from_element(edges, 1.0 / fan_in),
            mask: DVector::from_element(edges, 1.0),
            grid_eps: options.grid_eps,
            sb_trainable: options.sb_trainable,
            sp_trainable: options.sp_trainable,
            gradients: None,
            forward_state: None,
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

    /// the number of grid intervals
    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// spline degree
    pub fn k(&self) -> usize {
        self.k
    }

    /// the number of basis functions (and coefficients) per edge
    pub fn num_basis(&self) -> usize {
        self.grid_size + self.k
    }

    /// the extended knot vector of every input, one row per input
    pub fn grid(&self) -> &DMatrix<f64> {
        &self.grid
    }

    /// the spline coefficients, one row per edge
    pub fn coef(&self) -> &DMatrix<f64> {
        &self.coef
    }

    /// dense numeric mask, one entry per edge
    pub fn mask(&self) -> &DVector<f64> {
        &self.mask
    }

    #[allow(missing_docs)]
    pub fn scale_base(&self) -> &DVector<f64> {
        &self.scale_base
    }

    #[allow(missing_docs)]
    pub fn scale_sp(&self) -> &DVector<f64> {
        &self.scale_sp
    }

    pub(crate) fn set_mask_value(&mut self, edge: usize, value: f64) {
        self.mask[edge] = value;
    }

    /// the extended knot vector of input `i`
    pub fn knots(&self, i: usize) -> Vec<f64> {
        self.grid.row(i).iter().copied().collect()
    }

    fn spline_value(&self, edge: usize, t: f64, knots: &[f64]) -> f64 {
        basis(t, self.k, knots)
            .iter()
            .enumerate()
            .map(|(c, b)| self.coef[(edge, c)] * b)
            .sum()
    }

    fn evaluate(
        &self,
        x: &DMatrix<f64>,
        keep_state: bool,
    ) -> Result<(LayerForward, Option<ForwardState>), KanLayerError> {
        if x.ncols() != self.in_dim {
            return Err(KanLayerError::missized_input(x.ncols(), self.in_dim));
        }
        let batch = x.nrows();
        let num_basis = self.num_basis();
        let edges = self.in_dim * self.out_dim;
        let knot_rows: Vec<Vec<f64>> = (0..self.in_dim).map(|i| self.knots(i)).collect();

        let mut basis_values = DMatrix::zeros(batch, self.in_dim * num_basis);
        let mut basis_derivatives = if keep_state {
            DMatrix::zeros(batch, self.in_dim * num_basis)
        } else {
            DMatrix::zeros(0, 0)
        };
        for b in 0..batch {
            for i in 0..self.in_dim {
                let t = x[(b, i)];
                if keep_state {
                    let (values, derivatives) = basis_with_derivative(t, self.k, &knot_rows[i]);
                    for c in 0..num_basis {
                        basis_values[(b, i * num_basis + c)] = values[c];
                        basis_derivatives[(b, i * num_basis + c)] = derivatives[c];
                    }
                } else {
                    let values = basis(t, self.k, &knot_rows[i]);
                    for c in 0..num_basis {
                        basis_values[(b, i * num_basis + c)] = values[c];
                    }
                }
            }
        }

        let mut output = DMatrix::zeros(batch, self.out_dim);
        let mut preacts = DMatrix::zeros(batch, edges);
        let mut postacts = DMatrix::zeros(batch, edges);
        let mut postspline = DMatrix::zeros(batch, edges);
        for b in 0..batch {
            for j in 0..self.out_dim {
                for i in 0..self.in_dim {
                    let e = j * self.in_dim + i;
                    let t = x[(b, i)];
                    let spline: f64 = (0..num_basis)
                        .map(|c| self.coef[(e, c)] * basis_values[(b, i * num_basis + c)])
                        .sum();
                    let value =
                        self.mask[e] * (self.scale_base[e] * silu(t) + self.scale_sp[e] * spline);
                    if value.is_nan() && !t.is_nan() {
                        return Err(KanLayerError::nans_in_activations(e));
                    }
                    preacts[(b, e)] = t;
                    postspline[(b, e)] = spline;
                    postacts[(b, e)] = value;
                    output[(b, j)] += value;
                }
            }
        }
        let state = keep_state.then(|| ForwardState {
            input: x.clone(),
            basis: basis_values,
            basis_derivative: basis_derivatives,
        });
        Ok((
            LayerForward {
                output,
                preacts,
                postacts,
                postspline,
            },
            state,
        ))
    }

    /// Run a batch through the layer, remembering what the backward pass needs.
    ///
    /// # Errors
    /// * [`KanLayerError`] if `x` does not have `in_dim` columns
    /// * [`KanLayerError`] if a finite input produces a NaN activation
    pub fn forward(&mut self, x: &DMatrix<f64>) -> Result<LayerForward, KanLayerError> {
        let (result, state) = self.evaluate(x, true)?;
        self.forward_state = state;
        Ok(result)
    }

    /// as [`KanLayer::forward`], without touching any internal state
    pub fn infer(&self, x: &DMatrix<f64>) -> Result<LayerForward, KanLayerError> {
        self.evaluate(x, false).map(|(result, _)| result)
    }

    /// Accumulate parameter gradients given the gradient of the loss w.r.t. every edge's output (`[batch, out_dim * in_dim]`),
    /// and return the gradient w.r.t. the layer input (`[batch, in_dim]`).
    ///
    /// # Errors
    /// * [`KanLayerError`] if called before [`KanLayer::forward`]
    /// * [`KanLayerError`] if `d_postacts` does not match the shape of the last forward pass
    pub fn backward(&mut self, d_postacts: &DMatrix<f64>) -> Result<DMatrix<f64>, KanLayerError> {
        let edges = self.in_dim * self.out_dim;
        let num_basis = self.num_basis();
        let state = self
            .forward_state
            .as_ref()
            .ok_or_else(KanLayerError::backward_before_forward)?;
        if d_postacts.ncols() != edges {
            return Err(KanLayerError::missized_gradient(d_postacts.ncols(), edges));
        }
        if d_postacts.nrows() != state.input.nrows() {
            return Err(KanLayerError::missized_gradient(
                d_postacts.nrows(),
                state.input.nrows(),
            ));
        }
        let gradients = self
            .gradients
            .get_or_insert_with(|| LayerGradients::zeros(edges, num_basis));
        let mut d_input = DMatrix::zeros(state.input.nrows(), self.in_dim);
        for b in 0..state.input.nrows() {
            for j in 0..self.out_dim {
                for i in 0..self.in_dim {
                    let e = j * self.in_dim + i;
                    let upstream = d_postacts[(b, e)] * self.mask[e];
                    if upstream == 0.0 {
                        continue;
                    }
                    let t = state.input[(b, i)];
                    let mut spline = 0.0;
                    let mut spline_slope = 0.0;
                    for c in 0..num_basis {
                        let value = state.basis[(b, i * num_basis + c)];
                        spline += self.coef[(e, c)] * value;
                        spline_slope +=
                            self.coef[(e, c)] * state.basis_derivative[(b, i * num_basis + c)];
                        gradients.coef[(e, c)] += upstream * self.scale_sp[e] * value;
                    }
                    if self.sb_trainable {
                        gradients.scale_base[e] += upstream * silu(t);
                    }
                    if self.sp_trainable {
                        gradients.scale_sp[e] += upstream * spline;
                    }
                    d_input[(b, i)] += upstream
                        * (self.scale_base[e] * silu_derivative(t)
                            + self.scale_sp[e] * spline_slope);
                }
            }
        }
        Ok(d_input)
    }

    /// add an externally computed gradient (e.g. from a coefficient penalty) to the coefficient gradients
    pub(crate) fn accumulate_coef_gradient(&mut self, d_coef: &DMatrix<f64>) {
        let edges = self.in_dim * self.out_dim;
        let num_basis = self.num_basis();
        let gradients = self
            .gradients
            .get_or_insert_with(|| LayerGradients::zeros(edges, num_basis));
        gradients.coef += d_coef;
    }

    /// reset all accumulated gradients to zero
    pub fn zero_gradients(&mut self) {
        self.gradients = None;
    }

    /// the number of trainable values exposed by [`KanLayer::parameters`]
    pub fn parameter_count(&self) -> usize {
        let edges = self.in_dim * self.out_dim;
        let mut count = edges * self.num_basis();
        if self.sb_trainable {
            count += edges;
        }
        if self.sp_trainable {
            count += edges;
        }
        count
    }

    /// trainable values in a stable order: coefficients (row-major by edge), then `scale_base`, then `scale_sp`
    pub fn parameters(&self) -> Vec<f64> {
        let mut parameters = Vec::with_capacity(self.parameter_count());
        for e in 0..self.coef.nrows() {
            parameters.extend(self.coef.row(e).iter());
        }
        if self.sb_trainable {
            parameters.extend(self.scale_base.iter());
        }
        if self.sp_trainable {
            parameters.extend(self.scale_sp.iter());
        }
        parameters
    }

    /// gradients matching [`KanLayer::parameters`]; zero if nothing has been accumulated
    pub fn gradients(&self) -> Vec<f64> {
        let edges = self.in_dim * self.out_dim;
        let zeros;
        let gradients = match &self.gradients {
            Some(gradients) => gradients,
            None => {
                zeros = LayerGradients::zeros(edges, self.num_basis());
                &zeros
            }
        };
        let mut flat = Vec::with_capacity(self.parameter_count());
        for e in 0..edges {
            flat.extend(gradients.coef.row(e).iter());
        }
        if self.sb_trainable {
            flat.extend(gradients.scale_base.iter());
        }
        if self.sp_trainable {
            flat.extend(gradients.scale_sp.iter());
        }
        flat
    }

    /// overwrite the trainable values, in the order of [`KanLayer::parameters`]
    ///
    /// # Errors
    /// returns a [`KanLayerError`] if `parameters` has the wrong length
    pub fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), KanLayerError> {
        if parameters.len() != self.parameter_count() {
            return Err(KanLayerError::missized_parameters(
                parameters.len(),
                self.parameter_count(),
            ));
        }
        let edges = self.in_dim * self.out_dim;
        let num_basis = self.num_basis();
        let mut values = parameters.iter().copied();
        for e in 0..edges {
            for c in 0..num_basis {
                self.coef[(e, c)] = values.next().unwrap_or_default();
            }
        }
        if self.sb_trainable {
            for e in 0..edges {
                self.scale_base[e] = values.next().unwrap_or_default();
            }
        }
        if self.sp_trainable {
            for e in 0..edges {
                self.scale_sp[e] = values.next().unwrap_or_default();
            }
        }
        Ok(())
    }

    /// overwrite the residual and spline scales of one edge
    pub fn set_edge_scales(&mut self, edge: usize, scale_base: f64, scale_sp: f64) {
        self.scale_base[edge] = scale_base;
        self.scale_sp[edge] = scale_sp;
    }

    /// Refresh every input's grid from a batch of inputs, keeping each edge's spline shape.
    ///
    /// For each input, the new interior grid blends the sample quantiles with a uniform grid over the sample span, weighted by
    /// `grid_eps`, and is then padded by `k` knots on each side. Every edge's coefficients are then refit by least squares to
    /// the old spline evaluated at the samples. Inputs whose samples span no range, or whose blended grid would contain
    /// duplicate knots, keep their current grid.
    ///
    /// # Errors
    /// * [`KanLayerError`] if `x` is empty or has the wrong width
    /// * [`KanLayerError`] if the refit fails for any edge
    pub fn update_grid_from_samples(&mut self, x: &DMatrix<f64>) -> Result<(), KanLayerError> {
        if x.ncols() != self.in_dim {
            return Err(KanLayerError::missized_input(x.ncols(), self.in_dim));
        }
        if x.nrows() == 0 {
            return Err(KanLayerError::empty_batch());
        }
        let mut updates = Vec::with_capacity(self.in_dim);
        for i in 0..self.in_dim {
            let Some(samples) = sorted_finite_column(x, i) else {
                debug!("input {} has a degenerate sample range, keeping its grid", i);
                continue;
            };
            let interior = sample_grid(&samples, self.grid_size, self.grid_eps);
            if interior.windows(2).any(|w| w[0] >= w[1]) {
                trace!("too many duplicate knots for input {}, not updating", i);
                continue;
            }
            let old_knots = self.knots(i);
            let new_knots = extend_grid(&interior, self.k);
            let mut new_rows = Vec::with_capacity(self.out_dim);
            for j in 0..self.out_dim {
                let e = j * self.in_dim + i;
                let targets: Vec<f64> = samples
                    .iter()
                    .map(|&t| self.spline_value(e, t, &old_knots))
                    .collect();
                new_rows.push((e, self.fit_coefficients(e, &samples, &targets, &new_knots)?));
            }
            updates.push((i, new_knots, new_rows));
        }
        for (i, knots, rows) in updates {
            self.commit_grid(i, &knots, rows);
        }
        self.forward_state = None;
        Ok(())
    }

    /// Re-grid this layer from `parent`, a layer with the same shape but (typically) a coarser grid.
    ///
    /// The new grid is derived from the samples `x` as in [`KanLayer::update_grid_from_samples`], every edge's coefficients are fit to
    /// the parent's spline evaluated at the samples, and the parent's scales and mask are copied.
    /// Inputs whose samples span no range get a uniform grid over the parent's interior knots instead.
    ///
    /// # Errors
    /// * [`KanLayerError`] if the shapes of the layers or of `x` don't match
    /// * [`KanLayerError`] if the fit fails for any edge
    pub fn initialize_grid_from_parent(
        &mut self,
        parent: &KanLayer,
        x: &DMatrix<f64>,
    ) -> Result<(), KanLayerError> {
        if parent.in_dim != self.in_dim || parent.out_dim != self.out_dim {
            return Err(KanLayerError::missized_input(
                parent.in_dim * parent.out_dim,
                self.in_dim * self.out_dim,
            ));
        }
        if x.ncols() != self.in_dim {
            return Err(KanLayerError::missized_input(x.ncols(), self.in_dim));
        }
        let mut updates = Vec::with_capacity(self.in_dim);
        for i in 0..self.in_dim {
            let parent_knots = parent.knots(i);
            let (samples, interior) = match sorted_finite_column(x, i) {
                Some(samples) => {
                    let interior = sample_grid(&samples, self.grid_size, self.grid_eps);
                    (samples, interior)
                }
                None => {
                    let low = parent_knots[parent.k];
                    let high = parent_knots[parent_knots.len() - 1 - parent.k];
                    let samples = linspace(low, high, 4 * self.num_basis());
                    (samples, linspace(low, high, self.grid_size + 1))
                }
            };
            let new_knots = extend_grid(&interior, self.k);
            let mut new_rows = Vec::with_capacity(self.out_dim);
            for j in 0..self.out_dim {
                let e = j * self.in_dim + i;
                let targets: Vec<f64> = samples
                    .iter()
                    .map(|&t| parent.spline_value(e, t, &parent_knots))
                    .collect();
                new_rows.push((e, self.fit_coefficients(e, &samples, &targets, &new_knots)?));
            }
            updates.push((i, new_knots, new_rows));
        }
        for (i, knots, rows) in updates {
            self.commit_grid(i, &knots, rows);
        }
        self.scale_base = parent.scale_base.clone();
        self.scale_sp = parent.scale_sp.clone();
        self.mask = parent.mask.clone();
        self.forward_state = None;
        self.gradients = None;
        Ok(())
    }

    fn fit_coefficients(
        &self,
        edge: usize,
        samples: &[f64],
        targets: &[f64],
        knots: &[f64],
    ) -> Result<Vec<f64>, KanLayerError> {
        let coefficients = curve_to_coef(samples, targets, knots, self.k)
            .map_err(|reason| KanLayerError::least_squares(edge, reason))?;
        if coefficients.iter().any(|c| c.is_nan()) {
            return Err(KanLayerError::nans_in_activations(edge));
        }
        Ok(coefficients)
    }

    fn commit_grid(&mut self, i: usize, knots: &[f64], rows: Vec<(usize, Vec<f64>)>) {
        for (c, knot) in knots.iter().enumerate() {
            self.grid[(i, c)] = *knot;
        }
        for (e, coefficients) in rows {
            for (c, value) in coefficients.into_iter().enumerate() {
                self.coef[(e, c)] = value;
            }
        }
    }

    /// A copy of this layer restricted to the inputs `in_ids` and outputs `out_ids`, in the given order.
    ///
    /// Edge `(i', j')` of the new layer is edge `(in_ids[i'], out_ids[j'])` of this one. Indices must be in range.
    pub fn subset(&self, in_ids: &[usize], out_ids: &[usize]) -> KanLayer {
        let in_dim = in_ids.len();
        let out_dim = out_ids.len();
        let edges = in_dim * out_dim;
        let source_edge = |e: usize| out_ids[e / in_dim] * self.in_dim + in_ids[e % in_dim];
        KanLayer {
            in_dim,
            out_dim,
            grid_size: self.grid_size,
            k: self.k,
            grid: DMatrix::from_fn(in_dim, self.grid.ncols(), |i, c| self.grid[(in_ids[i], c)]),
            coef: DMatrix::from_fn(edges, self.num_basis(), |e, c| self.coef[(source_edge(e), c)]),
            scale_base: DVector::from_fn(edges, |e, _| self.scale_base[source_edge(e)]),
            scale_sp: DVector::from_fn(edges, |e, _| self.scale_sp[source_edge(e)]),
            mask: DVector::from_fn(edges, |e, _| self.mask[source_edge(e)]),
            grid_eps: self.grid_eps,
            sb_trainable: self.sb_trainable,
            sp_trainable: self.sp_trainable,
            gradients: None,
            forward_state: None,
        }
    }

    /// A layer with the same shape, options, scales and mask as this one but a grid of `grid_size` intervals.
    /// Coefficients are zero until [`KanLayer::initialize_grid_from_parent`] fits them.
    pub(crate) fn with_grid_size(&self, grid_size: usize) -> KanLayer {
        let low = self.grid[(0, self.k)];
        let high = self.grid[(0, self.grid.ncols() - 1 - self.k)];
        let knots = extend_grid(&linspace(low, high, grid_size + 1), self.k);
        KanLayer {
            in_dim: self.in_dim,
            out_dim: self.out_dim,
            grid_size,
            k: self.k,
            grid: DMatrix::from_fn(self.in_dim, knots.len(), |_, c| knots[c]),
            coef: DMatrix::zeros(self.in_dim * self.out_dim, grid_size + self.k),
            scale_base: self.scale_base.clone(),
            scale_sp: self.scale_sp.clone(),
            mask: self.mask.clone(),
            grid_eps: self.grid_eps,
            sb_trainable: self.sb_trainable,
            sp_trainable: self.sp_trainable,
            gradients: None,
            forward_state: None,
        }
    }
}

/// the finite values of column `i`, sorted, or `None` if they span no range
fn sorted_finite_column(x: &DMatrix<f64>, i: usize) -> Option<Vec<f64>> {
    let mut samples: Vec<f64> = x.column(i).iter().copied().filter(|v| v.is_finite()).collect();
    samples.sort_by(|a, b| a.total_cmp(b));
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if first < last => Some(samples),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use statrs::assert_almost_eq;
    use test_log::test;

    fn options(in_dim: usize, out_dim: usize) -> KanLayerOptions {
        KanLayerOptions {
            in_dim,
            out_dim,
            grid: 5,
            k: 3,
            noise_scale: 0.5,
            scale_base_mu: 0.0,
            scale_base_sigma: 1.0,
            grid_eps: 1.0,
            grid_range: (-1.0, 1.0),
            sp_trainable: true,
            sb_trainable: true,
        }
    }

    fn layer(in_dim: usize, out_dim: usize) -> KanLayer {
        KanLayer::new(&options(in_dim, out_dim), &mut StdRng::seed_from_u64(7))
    }

    fn batch(rows: usize, cols: usize) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |b, i| {
            -0.9 + 1.8 * ((b * 7 + i * 3) % rows) as f64 / rows as f64
        })
    }

    #[test]
    fn test_new_layer_shapes() {
        let layer = layer(3, 2);
        assert_eq!(layer.grid().shape(), (3, 5 + 2 * 3 + 1));
        assert_eq!(layer.coef().shape(), (6, 8));
        assert_eq!(layer.mask().len(), 6);
        assert_eq!(layer.parameter_count(), 6 * 8 + 6 + 6);
        assert!(layer.mask().iter().all(|m| *m == 1.0));
        assert_almost_eq!(layer.scale_sp()[0], 1.0 / 3f64.sqrt(), 1e-12);
    }

    #[test]
    fn test_forward_shapes_and_sums() {
        let mut layer = layer(2, 3);
        let x = batch(4, 2);
        let result = layer.forward(&x).unwrap();
        assert_eq!(result.output.shape(), (4, 3));
        assert_eq!(result.preacts.shape(), (4, 6));
        for b in 0..4 {
            for j in 0..3 {
                let total = result.postacts[(b, j * 2)] + result.postacts[(b, j * 2 + 1)];
                assert_almost_eq!(result.output[(b, j)], total, 1e-12);
                assert_eq!(result.preacts[(b, j * 2 + 1)], x[(b, 1)]);
            }
        }
    }

    #[test]
    fn test_forward_and_infer_agree() {
        let mut layer = layer(2, 2);
        let x = batch(5, 2);
        assert_eq!(layer.forward(&x).unwrap(), layer.infer(&x).unwrap());
    }

    #[test]
    fn test_missized_input() {
        let mut layer = layer(2, 2);
        assert!(layer.forward(&batch(3, 3)).is_err());
    }

    #[test]
    fn test_masked_edge_is_silent() {
        let mut layer = layer(2, 1);
        layer.set_mask_value(1, 0.0);
        let result = layer.forward(&batch(4, 2)).unwrap();
        assert!(result.postacts.column(1).iter().all(|v| *v == 0.0));
        assert_ne!(result.postspline.column(1).iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn test_backward_before_forward() {
        let mut layer = layer(2, 2);
        assert!(layer.backward(&DMatrix::zeros(1, 4)).is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut layer = layer(2, 2);
        let x = batch(3, 2);
        // loss = sum of all outputs, so d_postacts is all ones
        let loss = |layer: &KanLayer, x: &DMatrix<f64>| layer.infer(x).unwrap().output.sum();
        layer.forward(&x).unwrap();
        let d_input = layer.backward(&DMatrix::from_element(3, 4, 1.0)).unwrap();
        let analytic = layer.gradients();
        let parameters = layer.parameters();
        let h = 1e-6;
        for p in [0, 9, 17, parameters.len() - 5, parameters.len() - 1] {
            let mut above = layer.clone();
            let mut shifted = parameters.clone();
            shifted[p] += h;
            above.set_parameters(&shifted).unwrap();
            let mut below = layer.clone();
            shifted[p] -= 2.0 * h;
            below.set_parameters(&shifted).unwrap();
            let numeric = (loss(&above, &x) - loss(&below, &x)) / (2.0 * h);
            assert_almost_eq!(analytic[p], numeric, 1e-5);
        }
        for b in 0..3 {
            for i in 0..2 {
                let mut x_above = x.clone();
                x_above[(b, i)] += h;
                let mut x_below = x.clone();
                x_below[(b, i)] -= h;
                let numeric = (loss(&layer, &x_above) - loss(&layer, &x_below)) / (2.0 * h);
                assert_almost_eq!(d_input[(b, i)], numeric, 1e-4);
            }
        }
    }

    #[test]
    fn test_zero_gradients() {
        let mut layer = layer(1, 1);
        layer.forward(&batch(2, 1)).unwrap();
        layer.backward(&DMatrix::from_element(2, 1, 1.0)).unwrap();
        assert!(layer.gradients().iter().any(|g| *g != 0.0));
        layer.zero_gradients();
        assert!(layer.gradients().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_set_parameters_rejects_wrong_length() {
        let mut layer = layer(2, 1);
        assert!(layer.set_parameters(&[1.0, 2.0]).is_err());
        let parameters = layer.parameters();
        layer.set_parameters(&parameters).unwrap();
        assert_eq!(layer.parameters(), parameters);
    }

    #[test]
    fn test_update_grid_keeps_function() {
        let mut layer = layer(1, 2);
        let x = DMatrix::from_fn(50, 1, |b, _| -1.0 + 2.0 * b as f64 / 49.0);
        let before = layer.infer(&x).unwrap();
        layer.update_grid_from_samples(&x).unwrap();
        let knots = layer.knots(0);
        assert_almost_eq!(knots[3], -1.0, 1e-12);
        assert_almost_eq!(knots[knots.len() - 4], 1.0, 1e-12);
        let after = layer.infer(&x).unwrap();
        for (a, b) in after.output.iter().zip(before.output.iter()) {
            assert_almost_eq!(*a, *b, 1e-6);
        }
    }

    #[test]
    fn test_update_grid_ignores_constant_input() {
        let mut layer = layer(1, 1);
        let knots = layer.knots(0);
        layer
            .update_grid_from_samples(&DMatrix::from_element(10, 1, 0.3))
            .unwrap();
        assert_eq!(layer.knots(0), knots);
    }

    #[test]
    fn test_initialize_grid_from_parent_keeps_function() {
        let parent = layer(2, 1);
        let mut child = parent.with_grid_size(10);
        // the samples span [-1, 1], so every parent knot is also a child knot
        let x = DMatrix::from_fn(81, 2, |b, i| -1.0 + 2.0 * ((b + 13 * i) % 81) as f64 / 80.0);
        child.initialize_grid_from_parent(&parent, &x).unwrap();
        assert_eq!(child.grid_size(), 10);
        let expected = parent.infer(&x).unwrap();
        let actual = child.infer(&x).unwrap();
        for (a, e) in actual.output.iter().zip(expected.output.iter()) {
            assert_almost_eq!(*a, *e, 1e-4);
        }
    }

    #[test]
    fn test_subset_picks_edges() {
        let layer = layer(3, 2);
        let sub = layer.subset(&[2, 0], &[1]);
        assert_eq!((sub.in_dim(), sub.out_dim()), (2, 1));
        // new edge (i'=0, j'=0) is old edge (i=2, j=1) = index 1*3+2
        assert_eq!(sub.coef().row(0), layer.coef().row(5));
        assert_eq!(sub.coef().row(1), layer.coef().row(3));
        assert_eq!(sub.scale_base()[0], layer.scale_base()[5]);
        assert_eq!(sub.knots(0), layer.knots(2));
        let x = batch(4, 3);
        let full = layer.infer(&x).unwrap();
        let x_sub = DMatrix::from_fn(4, 2, |b, i| x[(b, [2, 0][i])]);
        let part = sub.infer(&x_sub).unwrap();
        for b in 0..4 {
            assert_almost_eq!(part.postacts[(b, 0)], full.postacts[(b, 5)], 1e-12);
        }
    }
}
