pub mod activation_cache;
pub mod edge_mode;
pub mod kan_error;
pub mod prune;
pub mod symbolic;

use activation_cache::{ActivationCache, LayerActivations};
use kan_error::KanError;
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::kan_layer::{KanLayer, KanLayerOptions, LayerForward};
use crate::symbolic_layer::SymbolicLayer;
use crate::topology::{
    expand_product_gradient, reduce_product_columns, LayerWidth, Topology,
};

/// A Kolmogorov-Arnold network with multiplication neurons.
///
/// Every layer pairs a numeric [`KanLayer`] with a [`SymbolicLayer`] of the same shape; each edge's output is the sum of its numeric
/// and symbolic branches, gated by the two masks (see [`EdgeMode`](edge_mode::EdgeMode)). The per-output sums of layer `l` are reduced
/// by the multiplication neurons of level `l + 1` (see [`Topology`]) and a per-neuron bias is added.
///
/// Every call to [`Kan::forward`] records the activations of every layer in an [`ActivationCache`], which pruning, symbolic search
/// and regularization read. The cache, the last input and any accumulated gradients are not serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kan {
    topology: Topology,
    layers: Vec<KanLayer>,
    symbolic_layers: Vec<SymbolicLayer>,
    /// one entry per layer, `width_in` of the following level
    biases: Vec<DVector<f64>>,
    options: KanOptions,
    #[serde(skip)]
    cache: Option<ActivationCache>,
    #[serde(skip)]
    cache_input: Option<DMatrix<f64>>,
    #[serde(skip)]
    bias_gradients: Option<Vec<DVector<f64>>>,
}

/// Hyperparameters for a [`Kan`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KanOptions {
    /// width of every depth level, input first
    pub widths: Vec<LayerWidth>,
    /// number of grid intervals of every spline
    pub grid: usize,
    /// spline degree
    pub k: usize,
    /// scale of the initial spline coefficients
    pub noise_scale: f64,
    #[allow(missing_docs)]
    pub scale_base_mu: f64,
    #[allow(missing_docs)]
    pub scale_base_sigma: f64,
    /// evaluate the symbolic branch during forward passes
    pub symbolic_enabled: bool,
    /// train the per-neuron biases
    pub bias_trainable: bool,
    /// weight of the uniform grid when refreshing grids from samples
    pub grid_eps: f64,
    /// span of the initial grids
    pub grid_range: (f64, f64),
    /// train the spline scales
    pub sp_trainable: bool,
    /// train the residual scales
    pub sb_trainable: bool,
    /// seed for parameter initialization
    pub seed: u64,
}

impl KanOptions {
    /// Options for a network with the given level widths and these defaults:
    /// * `grid`: 3
    /// * `k`: 3
    /// * `noise_scale`: 0.1
    /// * `scale_base_mu`: 0.0
    /// * `scale_base_sigma`: 1.0
    /// * `symbolic_enabled`: true
    /// * `bias_trainable`: false
    /// * `grid_eps`: 1.0
    /// * `grid_range`: (-1.0, 1.0)
    /// * `sp_trainable`: true
    /// * `sb_trainable`: true
    /// * `seed`: 0
    pub fn new(widths: Vec<LayerWidth>) -> Self {
        KanOptions {
            widths,
            grid: 3,
            k: 3,
            noise_scale: 0.1,
            scale_base_mu: 0.0,
            scale_base_sigma: 1.0,
            symbolic_enabled: true,
            bias_trainable: false,
            grid_eps: 1.0,
            grid_range: (-1.0, 1.0),
            sp_trainable: true,
            sb_trainable: true,
            seed: 0,
        }
    }

    fn layer_options(&self, in_dim: usize, out_dim: usize) -> KanLayerOptions {
        KanLayerOptions {
            in_dim,
            out_dim,
            grid: self.grid,
            k: self.k,
            noise_scale: self.noise_scale,
            scale_base_mu: self.scale_base_mu,
            scale_base_sigma: self.scale_base_sigma,
            grid_eps: self.grid_eps,
            grid_range: self.grid_range,
            sp_trainable: self.sp_trainable,
            sb_trainable: self.sb_trainable,
        }
    }
}

impl Kan {
    /// Build a freshly initialized network.
    ///
    /// # Errors
    /// Returns a [`KanError`] if the widths do not describe a valid [`Topology`] or if `grid` is zero.
    pub fn new(options: &KanOptions) -> Result<Self, KanError> {
        let topology = Topology::new(options.widths.clone())?;
        if options.grid == 0 {
            return Err(KanError::invalid_topology(
                "splines need at least one grid interval".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(options.seed);
        let depth = topology.depth();
        let mut layers = Vec::with_capacity(depth);
        let mut symbolic_layers = Vec::with_capacity(depth);
        let mut biases = Vec::with_capacity(depth);
        for l in 0..depth {
            let in_dim = topology.width_in(l);
            let out_dim = topology.width_out(l + 1);
            layers.push(KanLayer::new(&options.layer_options(in_dim, out_dim), &mut rng));
            symbolic_layers.push(SymbolicLayer::new(in_dim, out_dim));
            biases.push(DVector::zeros(topology.width_in(l + 1)));
        }
        debug!("built network {} with grid {} and k {}", topology, options.grid, options.k);
        Ok(Kan {
            topology,
            layers,
            symbolic_layers,
            biases,
            options: options.clone(),
            cache: None,
            cache_input: None,
            bias_gradients: None,
        })
    }

    /// Assemble a network from already built parts. Shapes must agree with `topology`.
    pub(crate) fn from_parts(
        topology: Topology,
        layers: Vec<KanLayer>,
        symbolic_layers: Vec<SymbolicLayer>,
        biases: Vec<DVector<f64>>,
        mut options: KanOptions,
    ) -> Self {
        options.widths = topology.widths().to_vec();
        Kan {
            topology,
            layers,
            symbolic_layers,
            biases,
            options,
            cache: None,
            cache_input: None,
            bias_gradients: None,
        }
    }

    #[allow(missing_docs)]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// the number of layers
    pub fn depth(&self) -> usize {
        self.topology.depth()
    }

    #[allow(missing_docs)]
    pub fn options(&self) -> &KanOptions {
        &self.options
    }

    /// the numeric half of every layer
    pub fn layers(&self) -> &[KanLayer] {
        &self.layers
    }

    /// the symbolic half of every layer
    pub fn symbolic_layers(&self) -> &[SymbolicLayer] {
        &self.symbolic_layers
    }

    /// the numeric half of layer `l`, for direct edits
    pub fn layer_mut(&mut self, l: usize) -> &mut KanLayer {
        &mut self.layers[l]
    }

    /// the symbolic half of layer `l`, for direct edits
    pub fn symbolic_layer_mut(&mut self, l: usize) -> &mut SymbolicLayer {
        &mut self.symbolic_layers[l]
    }

    /// the bias of every layer's output neurons
    pub fn biases(&self) -> &[DVector<f64>] {
        &self.biases
    }

    /// overwrite the bias of output neuron `n` of layer `l`
    pub fn set_bias(&mut self, l: usize, n: usize, value: f64) {
        self.biases[l][n] = value;
    }

    /// the activations recorded by the last forward pass, if any
    pub fn cache(&self) -> Option<&ActivationCache> {
        self.cache.as_ref()
    }

    /// the input of the last forward pass, if any
    pub fn cached_input(&self) -> Option<&DMatrix<f64>> {
        self.cache_input.as_ref()
    }

    /// whether the symbolic branch is evaluated
    pub fn symbolic_enabled(&self) -> bool {
        self.options.symbolic_enabled
    }

    /// turn evaluation of the symbolic branch on or off. Turning it off makes the network purely numeric (and faster).
    pub fn set_symbolic_enabled(&mut self, enabled: bool) {
        self.options.symbolic_enabled = enabled;
    }

    pub(crate) fn check_edge(&self, l: usize, i: usize, j: usize) -> Result<(), KanError> {
        if l >= self.depth()
            || i >= self.topology.width_in(l)
            || j >= self.topology.width_out(l + 1)
        {
            return Err(KanError::edge_out_of_range(l, i, j));
        }
        Ok(())
    }

    pub(crate) fn require_cache(&self) -> Result<&ActivationCache, KanError> {
        self.cache.as_ref().ok_or_else(KanError::missing_cache)
    }

    /// combine the two branches of layer `l`, reduce the products and add the bias
    fn finish_layer(
        &self,
        l: usize,
        numeric: LayerForward,
        symbolic: Option<(DMatrix<f64>, DMatrix<f64>)>,
    ) -> (DMatrix<f64>, LayerActivations) {
        let LayerForward {
            output,
            preacts,
            postacts: postacts_numeric,
            postspline,
        } = numeric;
        let (premult, postacts) = match symbolic {
            Some((symbolic_output, symbolic_postacts)) => {
                (output + symbolic_output, &postacts_numeric + symbolic_postacts)
            }
            None => (output, postacts_numeric.clone()),
        };
        let width = self.topology.width(l + 1);
        let mut reduced = reduce_product_columns(&premult, width);
        for (n, bias) in self.biases[l].iter().enumerate() {
            reduced.column_mut(n).add_scalar_mut(*bias);
        }
        let activations = LayerActivations::new(
            preacts,
            postacts,
            postacts_numeric,
            postspline,
            premult,
            self.topology.width_in(l),
        );
        (reduced, activations)
    }

    /// Run a batch (`[batch, input_dim]`) through the network, recording every layer's activations and remembering the input.
    ///
    /// # Errors
    /// * [`KanError`] if `x` has the wrong number of columns
    /// * [`KanError`] if any layer fails (see [`KanLayer::forward`])
    pub fn forward(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, KanError> {
        if x.ncols() != self.topology.input_dim() {
            return Err(KanError::missized_input(x.ncols(), self.topology.input_dim()));
        }
        self.cache_input = Some(x.clone());
        let depth = self.depth();
        let mut acts = Vec::with_capacity(depth + 1);
        let mut layers = Vec::with_capacity(depth);
        let mut current = x.clone();
        acts.push(current.clone());
        for l in 0..depth {
            let numeric = self.layers[l]
                .forward(&current)
                .map_err(|e| KanError::forward(e, l))?;
            let symbolic = if self.options.symbolic_enabled {
                Some(
                    self.symbolic_layers[l]
                        .forward(&current)
                        .map_err(|e| KanError::forward(e, l))?,
                )
            } else {
                None
            };
            let (output, activations) = self.finish_layer(l, numeric, symbolic);
            layers.push(activations);
            acts.push(output.clone());
            current = output;
        }
        self.cache = Some(ActivationCache { acts, layers });
        Ok(current)
    }

    /// the input of every layer, plus the network output, without touching any state
    pub(crate) fn layer_inputs(&self, x: &DMatrix<f64>) -> Result<Vec<DMatrix<f64>>, KanError> {
        if x.ncols() != self.topology.input_dim() {
            return Err(KanError::missized_input(x.ncols(), self.topology.input_dim()));
        }
        let mut acts = Vec::with_capacity(self.depth() + 1);
        acts.push(x.clone());
        for l in 0..self.depth() {
            let current = &acts[l];
            let numeric = self.layers[l]
                .infer(current)
                .map_err(|e| KanError::forward(e, l))?;
            let symbolic = if self.options.symbolic_enabled {
                Some(
                    self.symbolic_layers[l]
                        .infer(current)
                        .map_err(|e| KanError::forward(e, l))?,
                )
            } else {
                None
            };
            let (output, _) = self.finish_layer(l, numeric, symbolic);
            acts.push(output);
        }
        Ok(acts)
    }

    /// As [`Kan::forward`], without recording anything
    pub fn infer(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, KanError> {
        let mut acts = self.layer_inputs(x)?;
        Ok(acts.swap_remove(self.depth()))
    }

    /// Repeat the last forward pass on its input, refreshing the cache after parameter or mask changes.
    ///
    /// # Errors
    /// * [`KanError`] if no forward pass has been run
    /// * any error from [`Kan::forward`]
    pub fn reforward(&mut self) -> Result<DMatrix<f64>, KanError> {
        let x = self
            .cache_input
            .clone()
            .ok_or_else(KanError::missing_cached_input)?;
        self.forward(&x)
    }

    /// Backpropagate the gradient of the loss w.r.t. the network output (`[batch, output_dim]`) through the last forward pass,
    /// accumulating parameter gradients, and return the gradient w.r.t. the network input.
    ///
    /// `d_scale_spline`, if given, holds one `[out_dim, in_dim]` matrix per layer with the gradient of an additional loss term w.r.t.
    /// that layer's `acts_scale_spline` (see [`crate::regularizer`]). The input range in the denominator of the scale is treated as
    /// a constant.
    ///
    /// # Errors
    /// * [`KanError`] if no forward pass has been run or the gradient shape does not match it
    /// * [`KanError`] if any layer fails (see [`KanLayer::backward`])
    pub fn backward(
        &mut self,
        d_output: &DMatrix<f64>,
        d_scale_spline: Option<&[DMatrix<f64>]>,
    ) -> Result<DMatrix<f64>, KanError> {
        let cache = self.cache.as_ref().ok_or_else(KanError::missing_cache)?;
        let batch = cache.acts[0].nrows();
        if d_output.ncols() != self.topology.output_dim() || d_output.nrows() != batch {
            return Err(KanError::missized_input(
                d_output.ncols(),
                self.topology.output_dim(),
            ));
        }
        if let Some(d_scale) = d_scale_spline {
            if d_scale.len() != self.layers.len() {
                return Err(KanError::mismatched_length(
                    "scale gradient matrices",
                    d_scale.len(),
                    self.layers.len(),
                ));
            }
            for (l, d) in d_scale.iter().enumerate() {
                let expected = (self.topology.width_out(l + 1), self.topology.width_in(l));
                if d.shape() != expected {
                    return Err(KanError::missized_scale_gradient(l, d.shape(), expected));
                }
            }
        }
        let bias_gradients = self.bias_gradients.get_or_insert_with(|| {
            self.biases
                .iter()
                .map(|b| DVector::zeros(b.len()))
                .collect()
        });
        let mut d_current = d_output.clone();
        for l in (0..self.layers.len()).rev() {
            let activations = &cache.layers[l];
            let in_dim = self.topology.width_in(l);
            let out_dim = self.topology.width_out(l + 1);
            if self.options.bias_trainable {
                for (n, column) in d_current.column_iter().enumerate() {
                    bias_gradients[l][n] += column.sum();
                }
            }
            let d_premult =
                expand_product_gradient(&activations.premult, &d_current, self.topology.width(l + 1));
            let d_postacts =
                DMatrix::from_fn(batch, out_dim * in_dim, |b, e| d_premult[(b, e / in_dim)]);
            let mut d_numeric = d_postacts.clone();
            if let (Some(d_scale), true) = (d_scale_spline, batch > 1) {
                let numeric = &activations.postacts_numeric;
                for e in 0..out_dim * in_dim {
                    let (j, i) = (e / in_dim, e % in_dim);
                    let upstream = d_scale[l][(j, i)];
                    let scale = activations.acts_scale_spline[(j, i)];
                    if upstream == 0.0 || scale == 0.0 {
                        continue;
                    }
                    let range = activations.input_range[(j, i)];
                    let std = scale * range;
                    let mean = numeric.column(e).mean();
                    for b in 0..batch {
                        d_numeric[(b, e)] += upstream / range * (numeric[(b, e)] - mean)
                            / ((batch - 1) as f64 * std);
                    }
                }
            }
            let mut d_input = self.layers[l]
                .backward(&d_numeric)
                .map_err(|e| KanError::backward(e, l))?;
            if self.options.symbolic_enabled {
                d_input += self.symbolic_layers[l]
                    .backward(&d_postacts)
                    .map_err(|e| KanError::backward(e, l))?;
            }
            d_current = d_input;
        }
        Ok(d_current)
    }

    /// add externally computed gradients w.r.t. every layer's spline coefficients (`[edges, num_basis]` per layer)
    pub(crate) fn accumulate_coef_gradients(&mut self, d_coef: &[DMatrix<f64>]) {
        for (layer, d) in self.layers.iter_mut().zip(d_coef.iter()) {
            layer.accumulate_coef_gradient(d);
        }
    }

    /// reset all accumulated gradients to zero
    pub fn zero_gradients(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.zero_gradients();
        }
        self.bias_gradients = None;
    }

    /// the number of trainable values exposed by [`Kan::parameters`]
    pub fn parameter_count(&self) -> usize {
        let layer_count: usize = self.layers.iter().map(|l| l.parameter_count()).sum();
        let bias_count: usize = if self.options.bias_trainable {
            self.biases.iter().map(|b| b.len()).sum()
        } else {
            0
        };
        layer_count + bias_count
    }

    /// every trainable value, layer by layer (see [`KanLayer::parameters`]), followed by the biases if they are trainable
    pub fn parameters(&self) -> Vec<f64> {
        let mut parameters = Vec::with_capacity(self.parameter_count());
        for layer in self.layers.iter() {
            parameters.extend(layer.parameters());
        }
        if self.options.bias_trainable {
            for bias in self.biases.iter() {
                parameters.extend(bias.iter());
            }
        }
        parameters
    }

    /// the accumulated gradients, in the order of [`Kan::parameters`]
    pub fn gradients(&self) -> Vec<f64> {
        let mut gradients = Vec::with_capacity(self.parameter_count());
        for layer in self.layers.iter() {
            gradients.extend(layer.gradients());
        }
        if self.options.bias_trainable {
            for (l, bias) in self.biases.iter().enumerate() {
                match &self.bias_gradients {
                    Some(bias_gradients) => gradients.extend(bias_gradients[l].iter()),
                    None => gradients.extend(std::iter::repeat(0.0).take(bias.len())),
                }
            }
        }
        gradients
    }

    /// overwrite every trainable value, in the order of [`Kan::parameters`]
    ///
    /// # Errors
    /// returns a [`KanError`] if `parameters` has the wrong length
    pub fn set_parameters(&mut self, parameters: &[f64]) -> Result<(), KanError> {
        if parameters.len() != self.parameter_count() {
            return Err(KanError::missized_parameters(
                parameters.len(),
                self.parameter_count(),
            ));
        }
        let mut offset = 0;
        for (l, layer) in self.layers.iter_mut().enumerate() {
            let count = layer.parameter_count();
            layer
                .set_parameters(&parameters[offset..offset + count])
                .map_err(|e| KanError::backward(e, l))?;
            offset += count;
        }
        if self.options.bias_trainable {
            for bias in self.biases.iter_mut() {
                for value in bias.iter_mut() {
                    *value = parameters[offset];
                    offset += 1;
                }
            }
        }
        Ok(())
    }

    /// Refresh every layer's grid from the distribution of its inputs on `x`.
    ///
    /// Layers are updated in order, each after a fresh forward pass, since a layer's inputs depend on the layers before it.
    /// The cache reflects the pass before the last layer's update afterwards.
    ///
    /// # Errors
    /// * any error from [`Kan::forward`]
    /// * [`KanError`] if a layer's refit fails (see [`KanLayer::update_grid_from_samples`])
    pub fn update_grid_from_samples(&mut self, x: &DMatrix<f64>) -> Result<(), KanError> {
        for l in 0..self.depth() {
            self.forward(x)?;
            let inputs = self.require_cache()?.acts[l].clone();
            self.layers[l]
                .update_grid_from_samples(&inputs)
                .map_err(|e| KanError::update_grid(e, l))?;
        }
        debug!("updated grids from {} samples", x.nrows());
        Ok(())
    }

    /// Grid extension: a copy of this network whose splines have `new_grid` intervals, each fit to this network's splines on the
    /// input of the last forward pass. Symbolic layers, biases and masks are copied.
    ///
    /// # Errors
    /// * [`KanError`] if no forward pass has been run or `new_grid` is zero
    /// * [`KanError`] if a fit fails (see [`KanLayer::initialize_grid_from_parent`])
    pub fn refine(&self, new_grid: usize) -> Result<Kan, KanError> {
        if new_grid == 0 {
            return Err(KanError::invalid_topology(
                "splines need at least one grid interval".to_string(),
            ));
        }
        let x = self
            .cache_input
            .as_ref()
            .ok_or_else(KanError::missing_cached_input)?;
        let acts = self.layer_inputs(x)?;
        let mut layers = Vec::with_capacity(self.depth());
        for (l, parent) in self.layers.iter().enumerate() {
            let mut child = parent.with_grid_size(new_grid);
            child
                .initialize_grid_from_parent(parent, &acts[l])
                .map_err(|e| KanError::refine(e, l))?;
            layers.push(child);
        }
        let mut options = self.options.clone();
        options.grid = new_grid;
        let mut refined = Kan::from_parts(
            self.topology.clone(),
            layers,
            self.symbolic_layers.clone(),
            self.biases.clone(),
            options,
        );
        refined.cache_input = Some(x.clone());
        info!("refined grid from {} to {}", self.options.grid, new_grid);
        Ok(refined)
    }

    /// `(x_min, x_max, y_min, y_max)` of edge `(i, j)` of layer `l` over the last forward pass, where `y` is the masked sum of
    /// both branches
    ///
    /// # Errors
    /// returns a [`KanError`] if the edge does not exist or no forward pass has been run
    pub fn get_range(&self, l: usize, i: usize, j: usize) -> Result<(f64, f64, f64, f64), KanError> {
        self.check_edge(l, i, j)?;
        let activations = &self.require_cache()?.layers[l];
        let e = j * self.topology.width_in(l) + i;
        let x = activations.preacts.column(e);
        let y = activations.postacts.column(e);
        Ok((x.min(), x.max(), y.min(), y.max()))
    }

    /// `tanh(beta * acts_scale)` for every edge of every layer, an opacity in `[0, 1)` for drawing the network
    ///
    /// # Errors
    /// returns a [`KanError`] if no forward pass has been run
    pub fn edge_opacities(&self, beta: f64) -> Result<Vec<DMatrix<f64>>, KanError> {
        Ok(self
            .require_cache()?
            .layers
            .iter()
            .map(|layer| layer.acts_scale.map(|s| (beta * s).tanh()))
            .collect())
    }
}
