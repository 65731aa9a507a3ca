use std::fmt;

use crate::regularizer::RegularizationOptions;

/// Used by the [`train_model`](crate::train_model) function to determine how the model should be trained.
#[derive(Clone, PartialEq, Debug)]
pub struct TrainingOptions {
    /// number of optimizer steps
    pub steps: usize,
    /// number of samples drawn (without replacement) for each step. `None`, or a size larger than the data set, trains on the full set every step.
    /// The same size is used to draw the test batch.
    pub batch_size: Option<usize>,
    /// whether to refresh the grids from the training batch during the first `stop_grid_update_step` steps.
    /// See [`Kan::update_grid_from_samples`](crate::kan::Kan::update_grid_from_samples)
    pub update_grid: bool,
    /// how many grid refreshes to spread over the first `stop_grid_update_step` steps
    pub grid_update_num: usize,
    /// the step after which grids are no longer refreshed
    pub stop_grid_update_step: usize,
    /// the sparsity penalty added to the prediction loss. See [`crate::regularizer`]
    pub regularization: RegularizationOptions,
    /// drop samples whose prediction contains a NaN from the training loss instead of letting the NaN poison every parameter
    pub skip_nan_predictions: bool,
    /// seed for batch sampling; `None` seeds from the operating system
    pub seed: Option<u64>,
}

impl TrainingOptions {
    /// Create a new TrainingOptions struct with the given parameters.
    /// # Errors
    /// Returns [`TrainingOptionsError`] error if...
    /// * `batch_size` is `Some(0)`,
    /// * `update_grid` is set and `grid_update_num` is zero,
    /// * `update_grid` is set and `stop_grid_update_step` is smaller than `grid_update_num`, which would refresh the grid more than once per step.
    pub fn new(
        steps: usize,
        batch_size: Option<usize>,
        update_grid: bool,
        grid_update_num: usize,
        stop_grid_update_step: usize,
        regularization: RegularizationOptions,
        skip_nan_predictions: bool,
        seed: Option<u64>,
    ) -> Result<TrainingOptions, TrainingOptionsError> {
        let options = TrainingOptions {
            steps,
            batch_size,
            update_grid,
            grid_update_num,
            stop_grid_update_step,
            regularization,
            skip_nan_predictions,
            seed,
        };
        options.validate()?;
        Ok(options)
    }

    /// Check the invariants enforced by [`TrainingOptions::new`], for options built with struct syntax
    ///
    /// # Errors
    /// see [`TrainingOptions::new`]
    pub fn validate(&self) -> Result<(), TrainingOptionsError> {
        if self.batch_size == Some(0) {
            return Err(TrainingOptionsError::ZeroBatchSize);
        }
        if self.update_grid {
            if self.grid_update_num == 0 {
                return Err(TrainingOptionsError::ZeroGridUpdates);
            }
            if self.stop_grid_update_step < self.grid_update_num {
                return Err(TrainingOptionsError::GridUpdatesExceedSteps {
                    grid_update_num: self.grid_update_num,
                    stop_grid_update_step: self.stop_grid_update_step,
                });
            }
        }
        Ok(())
    }

    /// the number of steps between grid refreshes
    pub(crate) fn grid_update_freq(&self) -> usize {
        (self.stop_grid_update_step / self.grid_update_num.max(1)).max(1)
    }
}

impl Default for TrainingOptions {
    /// Returns a TrainingOptions struct with the following default values:
    /// * `steps`: 100
    /// * `batch_size`: None
    /// * `update_grid`: true
    /// * `grid_update_num`: 10
    /// * `stop_grid_update_step`: 50
    /// * `regularization`: [`RegularizationOptions::default`] (which does not regularize)
    /// * `skip_nan_predictions`: false
    /// * `seed`: None
    fn default() -> Self {
        TrainingOptions {
            steps: 100,
            batch_size: None,
            update_grid: true,
            grid_update_num: 10,
            stop_grid_update_step: 50,
            regularization: RegularizationOptions::default(),
            skip_nan_predictions: false,
            seed: None,
        }
    }
}

/// Errors that can occur when creating a new TrainingOptions struct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOptionsError {
    /// A batch size of zero was requested
    ZeroBatchSize,
    /// Grid updates were requested, but no number of updates was given
    ZeroGridUpdates,
    /// More grid updates were requested than there are steps in which to perform them
    GridUpdatesExceedSteps {
        /// The number of grid updates requested
        grid_update_num: usize,
        /// The step after which grid updates stop
        stop_grid_update_step: usize,
    },
}

impl fmt::Display for TrainingOptionsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrainingOptionsError::ZeroBatchSize => write!(f, "Batch size must be positive"),
            TrainingOptionsError::ZeroGridUpdates => {
                write!(f, "Grid updates are enabled but grid_update_num is zero")
            }
            TrainingOptionsError::GridUpdatesExceedSteps {
                grid_update_num,
                stop_grid_update_step,
            } => write!(
                f,
                "Cannot perform {} grid updates in the first {} steps",
                grid_update_num, stop_grid_update_step
            ),
        }
    }
}

impl std::error::Error for TrainingOptionsError {}
