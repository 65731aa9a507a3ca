/// Structs implementing this trait can be used to observe the training process.
pub trait TrainingObserver {
    /// called by [`crate::train_model`] at the end of each step with the root-mean-square training and test losses and the value of the
    /// regularization penalty. The test loss is NaN if there is no test data.
    fn on_step_end(&self, step: usize, train_loss: f64, test_loss: f64, reg: f64);

    /// called by [`crate::train_model`] after the grids are refreshed from the training batch. useful for understanding jumps in the loss.
    fn on_grid_update(&self, step: usize);
}
