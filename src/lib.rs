#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! A library to build, train, prune and symbolically simplify Kolmogorov-Arnold networks with multiplication neurons.
//!
//! The [kan_layer] module contains the numeric B-spline layer, [`kan_layer::KanLayer`], and the [symbolic_layer] module its closed-form
//! counterpart, [`symbolic_layer::SymbolicLayer`]. The [`kan::Kan`] model pairs the two in every layer, lets each level of the network
//! mix sum neurons with multiplication neurons (see [topology]), and records the activations of every forward pass so the network can be
//! regularized, pruned and converted into a formula.
//!
//! ## What is a Kolmogorov-Arnold Network?
//! Rather than perform a weighted sum of the activations of the previous layer and passing the sum through a fixed non-linear function,
//! each node in a KAN passes each activation from the previous layer through a different, trainable non-linear function, then sums and outputs the result.
//! A multiplication neuron multiplies two such sums instead, which lets small networks express products of their inputs exactly.
//!
//! Once trained, the learned one-dimensional functions can be replaced by closed-form primitives ([`kan::Kan::auto_symbolic`])
//! and the whole network written out as an expression ([`kan::Kan::symbolic_formula`]).
//!
//! For more information on the theory behind this library, see the arXiv papers [KAN: Kolmogorov-Arnold Networks](https://arxiv.org/abs/2404.19756)
//! and [KAN 2.0: Kolmogorov-Arnold Networks Meet Science](https://arxiv.org/abs/2408.10205)
//!
//! # Examples
//! Build and train a network with 2 inputs, a hidden level with one sum neuron and one multiplication neuron, and 1 output, then save it:
//! ```
//! use multkan::kan::{Kan, KanOptions};
//! use multkan::optimizer::Adam;
//! use multkan::topology::LayerWidth;
//! use multkan::{train_model, training_options::TrainingOptions, Dataset, EmptyObserver, Sample};
//! use tempfile::tempfile;
//!
//! // initialize the model
//! let model_options = KanOptions::new(vec![
//!     LayerWidth::new(2, 0),
//!     LayerWidth::new(1, 1),
//!     LayerWidth::new(1, 0),
//! ]);
//! let untrained_model = Kan::new(&model_options)?;
//!
//! // train the model
//! let mut dataset = Dataset::default();
//! /* Load training data */
//! # for n in 0..20 {
//! #     let x = -1.0 + n as f64 / 10.0;
//! #     dataset.train.push(Sample::new(vec![x, 0.5], vec![x * 0.5]));
//! #     dataset.test.push(Sample::new(vec![0.5, x], vec![x * 0.5]));
//! # }
//! let options = TrainingOptions {
//!     steps: 5,
//!     ..TrainingOptions::default()
//! };
//! let (trained_model, history) = train_model(
//!     untrained_model,
//!     &dataset,
//!     &mut Adam::new(0.01),
//!     &EmptyObserver::new(),
//!     &options,
//! )?;
//! assert_eq!(history.train_loss.len(), 5);
//!
//! // save the model
//! // Kan implements the serde Serialize trait, so it can be saved to a file using any serde-compatible format
//! // here we use the ciborium crate to save the model in the CBOR format
//! let mut file = tempfile()?;
//! ciborium::into_writer(&trained_model, &mut file)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// A small expression tree for the formulas extracted from symbolic networks.
pub mod expr;
/// Contains the main struct of the library, the [`Kan`] struct, which represents a full Kolmogorov-Arnold Network.
pub mod kan;
/// Contains the struct [`KanLayer`](crate::kan_layer::KanLayer), the numeric half of a network layer.
pub mod kan_layer;
/// First-order optimizers used by [`crate::train_model`].
pub mod optimizer;
pub mod regularizer;
/// Contains the struct [`SymbolicLayer`](crate::symbolic_layer::SymbolicLayer), the closed-form half of a network layer, and the primitive library.
pub mod symbolic_layer;
/// Level widths and the multiplication-pair reduction between layers.
pub mod topology;
/// Provides a trait for observing the training process during [`crate::train_model`].
pub mod training_observer;
/// Options for training a model with [`crate::train_model`].
pub mod training_options;

/// Errors reported by [`crate::train_model`].
pub mod training_error;

use kan::{kan_error::KanError, Kan};
use log::{debug, warn};
use nalgebra::DMatrix;
use optimizer::Optimizer;
use rand::{rngs::StdRng, SeedableRng};
use regularizer::regularize;
use serde::{Deserialize, Serialize};
use shuffle::{fy, shuffler::Shuffler};
pub use training_error::TrainingError;
use training_observer::TrainingObserver;
use training_options::TrainingOptions;

/// A sample of data to be used in training a model.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Sample {
    /// The input data for the model
    features: Vec<f64>,
    /// The expected output of the model, one value per output neuron
    labels: Vec<f64>,
}

impl Sample {
    /// Create a new Sample
    pub fn new(features: Vec<f64>, labels: Vec<f64>) -> Self {
        Sample { features, labels }
    }

    /// Get the features of the sample
    pub fn features(&self) -> &[f64] {
        &self.features
    }
    /// Get the labels of the sample
    pub fn labels(&self) -> &[f64] {
        &self.labels
    }
}

/// Training and test samples
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[allow(missing_docs)]
    pub train: Vec<Sample>,
    /// samples used only to report the test loss
    pub test: Vec<Sample>,
}

/// The losses recorded by [`train_model`], one entry per step
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// root-mean-square error on the training batch
    pub train_loss: Vec<f64>,
    /// root-mean-square error on the test batch, NaN without test data
    pub test_loss: Vec<f64>,
    /// the regularization penalty, before its weight is applied
    pub reg: Vec<f64>,
}

/// The losses of one [`training_step`]
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct StepLosses {
    /// mean squared error of the batch
    pub train_loss: f64,
    /// the regularization penalty, before its weight is applied
    pub reg: f64,
}

/// Stack the features and labels of `samples` into `[batch, width]` matrices
pub fn to_matrices(samples: &[&Sample]) -> (DMatrix<f64>, DMatrix<f64>) {
    let input_dim = samples.first().map_or(0, |s| s.features.len());
    let output_dim = samples.first().map_or(0, |s| s.labels.len());
    let x = DMatrix::from_fn(samples.len(), input_dim, |b, i| samples[b].features[i]);
    let y = DMatrix::from_fn(samples.len(), output_dim, |b, o| samples[b].labels[o]);
    (x, y)
}

/// Mean squared error over every entry of `prediction`, and its gradient w.r.t. `prediction`
pub fn mse_loss(prediction: &DMatrix<f64>, labels: &DMatrix<f64>) -> (f64, DMatrix<f64>) {
    let count = prediction.len().max(1) as f64;
    let diff = prediction - labels;
    let loss = diff.iter().map(|d| d * d).sum::<f64>() / count;
    (loss, diff * (2.0 / count))
}

fn check_samples(samples: &[Sample], model: &Kan) -> Result<(), KanError> {
    let input_dim = model.topology().input_dim();
    let output_dim = model.topology().output_dim();
    for sample in samples {
        if sample.features.len() != input_dim {
            return Err(KanError::missized_input(sample.features.len(), input_dim));
        }
        if sample.labels.len() != output_dim {
            return Err(KanError::mismatched_length(
                "labels per sample",
                sample.labels.len(),
                output_dim,
            ));
        }
    }
    Ok(())
}

/// draw `size` samples without replacement, or all of them if `size` is `None` or too large
fn sample_batch<'a>(
    samples: &'a [Sample],
    size: Option<usize>,
    shuffler: &mut fy::FisherYates,
    rng: &mut StdRng,
) -> Vec<&'a Sample> {
    let mut pointers: Vec<&Sample> = samples.iter().collect();
    match size {
        Some(size) if size < samples.len() => {
            shuffler
                .shuffle(&mut pointers, rng)
                .expect("Shuffling can't fail");
            pointers.truncate(size);
            pointers
        }
        _ => pointers,
    }
}

/// One optimizer step on a batch.
///
/// Runs the forward pass, the mean squared error loss, the regularization penalty (see [`regularizer`]) and the backward pass, then
/// lets `optimizer` update the parameters. Rows whose prediction contains a NaN are dropped from the loss when
/// `options.skip_nan_predictions` is set; if every row is dropped, the parameters are left untouched and NaN losses are returned.
///
/// # Errors
/// returns a [`KanError`] if the model reports an error at any point
pub fn training_step<O: Optimizer>(
    model: &mut Kan,
    optimizer: &mut O,
    x: &DMatrix<f64>,
    y: &DMatrix<f64>,
    options: &TrainingOptions,
) -> Result<StepLosses, KanError> {
    model.zero_gradients();
    let mut prediction = model.forward(x)?;
    let mut labels = y.clone();
    if options.skip_nan_predictions {
        let clean: Vec<usize> = (0..prediction.nrows())
            .filter(|&b| prediction.row(b).iter().all(|v| !v.is_nan()))
            .collect();
        if clean.is_empty() {
            warn!("every prediction in the batch is NaN, skipping the update");
            return Ok(StepLosses {
                train_loss: f64::NAN,
                reg: f64::NAN,
            });
        }
        if clean.len() < prediction.nrows() {
            debug!("dropping {} NaN predictions", prediction.nrows() - clean.len());
            let clean_x = x.select_rows(clean.iter());
            labels = y.select_rows(clean.iter());
            prediction = model.forward(&clean_x)?;
        }
    }
    let (train_loss, d_output) = mse_loss(&prediction, &labels);
    let regularization = regularize(model, &options.regularization)?;
    let lamb = options.regularization.lamb;
    if lamb != 0.0 {
        let d_scale: Vec<DMatrix<f64>> = regularization
            .scale_gradients
            .iter()
            .map(|g| g * lamb)
            .collect();
        model.backward(&d_output, Some(d_scale.as_slice()))?;
        let d_coef: Vec<DMatrix<f64>> = regularization
            .coef_gradients
            .iter()
            .map(|g| g * lamb)
            .collect();
        model.accumulate_coef_gradients(&d_coef);
    } else {
        model.backward(&d_output, None)?;
    }
    let mut parameters = model.parameters();
    optimizer.step(&mut parameters, &model.gradients());
    model.set_parameters(&parameters)?;
    Ok(StepLosses {
        train_loss,
        reg: regularization.value,
    })
}

/// Train the provided model with the provided data.
///
/// Every step draws a training batch and a test batch (see [`TrainingOptions::batch_size`]), refreshes the grids from the training batch
/// every `stop_grid_update_step / grid_update_num` steps until `stop_grid_update_step` if `update_grid` is set, runs one [`training_step`]
/// and evaluates the test batch without touching the activation cache.
///
/// This function will report status to the provided [`training_observer`](TrainingObserver).
///
/// Returns the trained model and the losses of every step if no errors are thrown.
///
/// # Errors
/// returns a [TrainingError] if the training data is empty, if a sample does not fit the model, or if the model reports an error at any
/// point during training.
///
/// # Example
/// train a model, using the provided [EmptyObserver] to ignore all training events:
/// ```
/// use multkan::{train_model, Dataset, Sample, training_options::TrainingOptions, EmptyObserver};
/// use multkan::kan::{Kan, KanOptions};
/// use multkan::optimizer::Sgd;
/// # use multkan::TrainingError;
///
/// # let some_model_options = KanOptions::new(vec![2.into(), 3.into(), 1.into()]);
/// let untrained_model = Kan::new(&some_model_options).unwrap();
/// let mut dataset = Dataset::default();
///
/// /* Load training data */
/// # dataset.train.push(Sample::new(vec![1.0, 2.0], vec![3.0]));
/// # dataset.train.push(Sample::new(vec![-1.0, 0.5], vec![-0.5]));
///
/// let options = TrainingOptions { steps: 3, update_grid: false, ..TrainingOptions::default() };
/// let (trained_model, history) = train_model(
///     untrained_model,
///     &dataset,
///     &mut Sgd::new(0.01),
///     &EmptyObserver::new(),
///     &options)?;
/// # Ok::<(), TrainingError>(())
/// ```
pub fn train_model<T: TrainingObserver, O: Optimizer>(
    mut model: Kan,
    dataset: &Dataset,
    optimizer: &mut O,
    training_observer: &T,
    options: &TrainingOptions,
) -> Result<(Kan, TrainingHistory), TrainingError> {
    let at_start = |source: KanError| TrainingError { source, step: 0 };
    if dataset.train.is_empty() {
        return Err(at_start(KanError::empty_dataset()));
    }
    check_samples(&dataset.train, &model).map_err(at_start)?;
    check_samples(&dataset.test, &model).map_err(at_start)?;

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut fys = fy::FisherYates::default();
    let grid_update_freq = options.grid_update_freq();
    let mut history = TrainingHistory::default();

    for step in 0..options.steps {
        let at_step = |source: KanError| TrainingError { source, step };
        let train_batch = sample_batch(&dataset.train, options.batch_size, &mut fys, &mut rng);
        let test_batch = sample_batch(&dataset.test, options.batch_size, &mut fys, &mut rng);
        let (train_x, train_y) = to_matrices(&train_batch);

        if options.update_grid && step % grid_update_freq == 0 && step < options.stop_grid_update_step {
            model.update_grid_from_samples(&train_x).map_err(at_step)?;
            debug!("refreshed grids at step {}", step);
            training_observer.on_grid_update(step);
        }

        let losses = training_step(&mut model, optimizer, &train_x, &train_y, options)
            .map_err(at_step)?;

        let test_loss = if test_batch.is_empty() {
            f64::NAN
        } else {
            let (test_x, test_y) = to_matrices(&test_batch);
            let prediction = model.infer(&test_x).map_err(at_step)?;
            mse_loss(&prediction, &test_y).0
        };

        let train_rmse = losses.train_loss.sqrt();
        let test_rmse = test_loss.sqrt();
        history.train_loss.push(train_rmse);
        history.test_loss.push(test_rmse);
        history.reg.push(losses.reg);
        training_observer.on_step_end(step, train_rmse, test_rmse, losses.reg);
    }

    Ok((model, history))
}

// EmptyObserver is basically a singleton, so there's no point in implementing any other common traits
/// An observer that does nothing when called.
/// Used for ignoring training events in the [train_model] function.
#[derive(Default)]
pub struct EmptyObserver {}
impl EmptyObserver {
    /// Create a new instance of the EmptyObserver
    pub fn new() -> Self {
        EmptyObserver {}
    }
}
impl TrainingObserver for EmptyObserver {
    fn on_step_end(&self, _step: usize, _train_loss: f64, _test_loss: f64, _reg: f64) {
        // do nothing
    }

    fn on_grid_update(&self, _step: usize) {
        // do nothing
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kan::KanOptions;
    use optimizer::{Adam, Sgd};
    use regularizer::RegularizationOptions;
    use statrs::assert_almost_eq;
    use std::cell::RefCell;
    use test_log::test;
    use topology::LayerWidth;

    fn product_dataset(n: usize) -> Dataset {
        let mut dataset = Dataset::default();
        for b in 0..n {
            let x0 = -1.0 + 2.0 * b as f64 / (n - 1) as f64;
            let x1 = 1.0 - 2.0 * ((b * 7) % n) as f64 / (n - 1) as f64;
            let sample = Sample::new(vec![x0, x1], vec![x0 * x1]);
            if b % 4 == 0 {
                dataset.test.push(sample);
            } else {
                dataset.train.push(sample);
            }
        }
        dataset
    }

    fn mult_model() -> Kan {
        Kan::new(&KanOptions::new(vec![
            LayerWidth::new(2, 0),
            LayerWidth::new(0, 1),
            LayerWidth::new(1, 0),
        ]))
        .unwrap()
    }

    #[derive(Default)]
    struct RecordingObserver {
        steps: RefCell<Vec<usize>>,
        grid_updates: RefCell<Vec<usize>>,
    }

    impl TrainingObserver for RecordingObserver {
        fn on_step_end(&self, step: usize, _train_loss: f64, _test_loss: f64, _reg: f64) {
            self.steps.borrow_mut().push(step);
        }

        fn on_grid_update(&self, step: usize) {
            self.grid_updates.borrow_mut().push(step);
        }
    }

    #[test]
    fn test_mse_loss_and_gradient() {
        let prediction = DMatrix::from_row_slice(2, 1, &[1.0, 3.0]);
        let labels = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
        let (loss, gradient) = mse_loss(&prediction, &labels);
        assert_almost_eq!(loss, 2.5, 1e-12);
        assert_eq!(gradient.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn test_training_reduces_loss() {
        let dataset = product_dataset(60);
        let options = TrainingOptions {
            steps: 60,
            update_grid: false,
            seed: Some(7),
            ..TrainingOptions::default()
        };
        let (_, history) = train_model(
            mult_model(),
            &dataset,
            &mut Adam::new(0.02),
            &EmptyObserver::new(),
            &options,
        )
        .unwrap();
        assert_eq!(history.train_loss.len(), 60);
        assert_eq!(history.test_loss.len(), 60);
        assert!(history.train_loss[59] < history.train_loss[0]);
        assert!(history.test_loss.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_grid_update_schedule() {
        let observer = RecordingObserver::default();
        let options = TrainingOptions {
            steps: 12,
            grid_update_num: 3,
            stop_grid_update_step: 9,
            batch_size: Some(10),
            seed: Some(1),
            ..TrainingOptions::default()
        };
        train_model(
            mult_model(),
            &product_dataset(40),
            &mut Sgd::new(0.01),
            &observer,
            &options,
        )
        .unwrap();
        assert_eq!(*observer.grid_updates.borrow(), vec![0, 3, 6]);
        assert_eq!(observer.steps.borrow().len(), 12);
    }

    #[test]
    fn test_regularized_step_reports_penalty() {
        let mut model = mult_model();
        let dataset = product_dataset(20);
        let train: Vec<&Sample> = dataset.train.iter().collect();
        let (x, y) = to_matrices(&train);
        let options = TrainingOptions {
            regularization: RegularizationOptions {
                lamb: 0.01,
                lamb_coef: 1.0,
                ..RegularizationOptions::default()
            },
            ..TrainingOptions::default()
        };
        let before = model.parameters();
        let losses = training_step(&mut model, &mut Sgd::new(0.1), &x, &y, &options).unwrap();
        assert!(losses.reg > 0.0);
        assert!(losses.train_loss.is_finite());
        assert_ne!(model.parameters(), before);
    }

    #[test]
    fn test_rejects_bad_data() {
        let mut dataset = product_dataset(8);
        dataset.train.push(Sample::new(vec![1.0], vec![1.0]));
        let error = train_model(
            mult_model(),
            &dataset,
            &mut Sgd::new(0.1),
            &EmptyObserver::new(),
            &TrainingOptions::default(),
        )
        .unwrap_err();
        assert_eq!(error.step, 0);
        let empty = train_model(
            mult_model(),
            &Dataset::default(),
            &mut Sgd::new(0.1),
            &EmptyObserver::new(),
            &TrainingOptions::default(),
        );
        assert!(empty.is_err());
    }

    #[test]
    fn test_batches_are_sampled_without_replacement() {
        let samples: Vec<Sample> = (0..10).map(|n| Sample::new(vec![n as f64], vec![0.0])).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let mut fys = fy::FisherYates::default();
        let batch = sample_batch(&samples, Some(4), &mut fys, &mut rng);
        assert_eq!(batch.len(), 4);
        let mut seen: Vec<f64> = batch.iter().map(|s| s.features()[0]).collect();
        seen.sort_by(|a, b| a.total_cmp(b));
        seen.dedup();
        assert_eq!(seen.len(), 4);
        assert_eq!(sample_batch(&samples, Some(20), &mut fys, &mut rng).len(), 10);
        assert_eq!(sample_batch(&samples, None, &mut fys, &mut rng).len(), 10);
    }

    #[test]
    fn test_error_send() {
        fn assert_send<T: Send>() {}
        assert_send::<TrainingError>();
        assert_send::<KanError>();
    }

    #[test]
    fn test_error_sync() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<TrainingError>();
        assert_sync::<KanError>();
    }
}
