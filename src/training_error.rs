use crate::kan::kan_error::KanError;

/// Indicates that an error was encountered during training
///
/// If displayed, this error will show the step at which the error was encountered, as well as the [KanError] that caused the error.
#[derive(Clone, PartialEq, Debug)]
pub struct TrainingError {
    /// The error that caused the training error
    pub source: KanError,
    /// The step (zero-indexed) at which the error was encountered
    pub step: usize,
}

impl std::fmt::Display for TrainingError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "step {} encountered error {}", self.step, self.source)
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
