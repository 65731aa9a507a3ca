//! Error types relating to the creation and manipulation of [`KanLayer`](crate::kan_layer::KanLayer)s and [`SymbolicLayer`](crate::symbolic_layer::SymbolicLayer)s

use std::fmt::{self, Formatter};

/// Represents any error returned from a numeric or symbolic sub-layer
#[derive(Debug, Clone, PartialEq)]
pub struct KanLayerError {
    error_kind: KanLayerErrorType,
    /// the flat index `j * in_dim + i` of the edge that caused the error, if the error is specific to one edge
    edge_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum KanLayerErrorType {
    MissizedInput { actual: usize, expected: usize },
    MissizedGradient { actual: usize, expected: usize },
    MissizedParameters { actual: usize, expected: usize },
    BackwardBeforeForward,
    NaNsInActivations,
    LeastSquares { reason: String },
    EmptyBatch,
}

impl KanLayerError {
    pub(crate) fn missized_input(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanLayerErrorType::MissizedInput { actual, expected },
            edge_index: None,
        }
    }

    pub(crate) fn missized_gradient(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanLayerErrorType::MissizedGradient { actual, expected },
            edge_index: None,
        }
    }

    pub(crate) fn missized_parameters(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanLayerErrorType::MissizedParameters { actual, expected },
            edge_index: None,
        }
    }

    pub(crate) fn backward_before_forward() -> Self {
        Self {
            error_kind: KanLayerErrorType::BackwardBeforeForward,
            edge_index: None,
        }
    }

    pub(crate) fn nans_in_activations(edge_index: usize) -> Self {
        Self {
            error_kind: KanLayerErrorType::NaNsInActivations,
            edge_index: Some(edge_index),
        }
    }

    pub(crate) fn least_squares(edge_index: usize, reason: &str) -> Self {
        Self {
            error_kind: KanLayerErrorType::LeastSquares {
                reason: reason.to_string(),
            },
            edge_index: Some(edge_index),
        }
    }

    pub(crate) fn empty_batch() -> Self {
        Self {
            error_kind: KanLayerErrorType::EmptyBatch,
            edge_index: None,
        }
    }

    /// the flat index of the edge that caused the error, if any
    pub fn edge_index(&self) -> Option<usize> {
        self.edge_index
    }
}

impl fmt::Display for KanLayerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.error_kind {
            KanLayerErrorType::MissizedInput { actual, expected } => write!(
                f,
                "Bad input width. Expected {}, got {}",
                expected, actual
            ),
            KanLayerErrorType::MissizedGradient { actual, expected } => write!(
                f,
                "received gradient of width {} but required width {}",
                actual, expected
            ),
            KanLayerErrorType::MissizedParameters { actual, expected } => write!(
                f,
                "received {} parameters but the layer has {}",
                actual, expected
            ),
            KanLayerErrorType::BackwardBeforeForward => {
                write!(f, "backward called before forward")
            }
            KanLayerErrorType::NaNsInActivations => write!(
                f,
                "NaNs in activations of edge {}",
                self.edge_index.unwrap_or_default()
            ),
            KanLayerErrorType::LeastSquares { reason } => write!(
                f,
                "unable to fit coefficients of edge {}: {}",
                self.edge_index.unwrap_or_default(),
                reason
            ),
            KanLayerErrorType::EmptyBatch => write!(f, "received an empty batch"),
        }
    }
}

impl std::error::Error for KanLayerError {}
