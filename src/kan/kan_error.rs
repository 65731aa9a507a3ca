use crate::kan_layer::kan_layer_errors::KanLayerError;

/// An error ocurring during the operation of a Kan model
///
/// Displaying the error will show the index of the layer that encountered the error, if any, and the error itself
#[derive(Debug, Clone, PartialEq)]
pub struct KanError {
    error_kind: KanErrorType,
    /// the error that occurred
    source: Option<KanLayerError>,
    /// the index of the layer that encountered the error
    layer_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum KanErrorType {
    Forward,
    Backward,
    UpdateGrid,
    Refine,
    MissizedInput {
        actual: usize,
        expected: usize,
    },
    MissizedParameters {
        actual: usize,
        expected: usize,
    },
    MissizedScaleGradient {
        actual: (usize, usize),
        expected: (usize, usize),
    },
    MissingCache,
    MissingCachedInput,
    EdgeOutOfRange {
        i: usize,
        j: usize,
    },
    NodeOutOfRange {
        node: usize,
        width: usize,
    },
    IncompleteSymbolic {
        i: usize,
        j: usize,
        numeric_active: bool,
    },
    MismatchedLength {
        what: &'static str,
        actual: usize,
        expected: usize,
    },
    InvalidTopology(String),
    ManualPruneIndex {
        index: usize,
        width: usize,
    },
    ManualPruneDepth {
        actual: usize,
        expected: usize,
    },
    EmptyDataset,
}

impl KanError {
    pub(crate) fn forward(source: KanLayerError, layer_index: usize) -> Self {
        Self {
            error_kind: KanErrorType::Forward,
            source: Some(source),
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn backward(source: KanLayerError, layer_index: usize) -> Self {
        Self {
            error_kind: KanErrorType::Backward,
            source: Some(source),
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn update_grid(source: KanLayerError, layer_index: usize) -> Self {
        Self {
            error_kind: KanErrorType::UpdateGrid,
            source: Some(source),
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn refine(source: KanLayerError, layer_index: usize) -> Self {
        Self {
            error_kind: KanErrorType::Refine,
            source: Some(source),
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn missized_input(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanErrorType::MissizedInput { actual, expected },
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn missized_parameters(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanErrorType::MissizedParameters { actual, expected },
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn missized_scale_gradient(
        layer_index: usize,
        actual: (usize, usize),
        expected: (usize, usize),
    ) -> Self {
        Self {
            error_kind: KanErrorType::MissizedScaleGradient { actual, expected },
            source: None,
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn missing_cache() -> Self {
        Self {
            error_kind: KanErrorType::MissingCache,
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn missing_cached_input() -> Self {
        Self {
            error_kind: KanErrorType::MissingCachedInput,
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn edge_out_of_range(layer_index: usize, i: usize, j: usize) -> Self {
        Self {
            error_kind: KanErrorType::EdgeOutOfRange { i, j },
            source: None,
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn node_out_of_range(layer_index: usize, node: usize, width: usize) -> Self {
        Self {
            error_kind: KanErrorType::NodeOutOfRange { node, width },
            source: None,
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn incomplete_symbolic(
        layer_index: usize,
        i: usize,
        j: usize,
        numeric_active: bool,
    ) -> Self {
        Self {
            error_kind: KanErrorType::IncompleteSymbolic {
                i,
                j,
                numeric_active,
            },
            source: None,
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn mismatched_length(what: &'static str, actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanErrorType::MismatchedLength {
                what,
                actual,
                expected,
            },
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn invalid_topology(reason: String) -> Self {
        Self {
            error_kind: KanErrorType::InvalidTopology(reason),
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn manual_prune_index(layer_index: usize, index: usize, width: usize) -> Self {
        Self {
            error_kind: KanErrorType::ManualPruneIndex { index, width },
            source: None,
            layer_index: Some(layer_index),
        }
    }

    pub(crate) fn manual_prune_depth(actual: usize, expected: usize) -> Self {
        Self {
            error_kind: KanErrorType::ManualPruneDepth { actual, expected },
            source: None,
            layer_index: None,
        }
    }

    pub(crate) fn empty_dataset() -> Self {
        Self {
            error_kind: KanErrorType::EmptyDataset,
            source: None,
            layer_index: None,
        }
    }

    /// the index of the layer (or level, for node errors) that encountered the error, if any
    pub fn layer_index(&self) -> Option<usize> {
        self.layer_index
    }

    /// true if the error was raised because a formula was requested from a network that is not fully symbolic
    pub fn is_incomplete_symbolic(&self) -> bool {
        matches!(self.error_kind, KanErrorType::IncompleteSymbolic { .. })
    }
}

impl std::fmt::Display for KanError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let layer = self.layer_index.unwrap_or_default();
        let source = || {
            self.source
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default()
        };
        match &self.error_kind {
            KanErrorType::Forward => {
                write!(f, "Error in forward pass at layer {}: {}", layer, source())
            }
            KanErrorType::Backward => {
                write!(f, "Error in backward pass at layer {}: {}", layer, source())
            }
            KanErrorType::UpdateGrid => write!(
                f,
                "Error updating grid from samples in layer {}: {}",
                layer,
                source()
            ),
            KanErrorType::Refine => write!(
                f,
                "Error initializing refined grid of layer {}: {}",
                layer,
                source()
            ),
            KanErrorType::MissizedInput { actual, expected } => write!(
                f,
                "Bad input width. Expected {}, got {}",
                expected, actual
            ),
            KanErrorType::MissizedParameters { actual, expected } => write!(
                f,
                "received {} parameters but the model has {}",
                actual, expected
            ),
            KanErrorType::MissizedScaleGradient { actual, expected } => write!(
                f,
                "scale gradient of layer {} has shape {:?}, expected {:?}",
                layer, actual, expected
            ),
            KanErrorType::MissingCache => write!(
                f,
                "no activations cached; run a forward pass first"
            ),
            KanErrorType::MissingCachedInput => write!(
                f,
                "no input cached; run a forward pass first"
            ),
            KanErrorType::EdgeOutOfRange { i, j } => {
                write!(f, "edge ({}, {}) does not exist in layer {}", i, j, layer)
            }
            KanErrorType::NodeOutOfRange { node, width } => write!(
                f,
                "node {} does not exist at level {}, which has width {}",
                node, layer, width
            ),
            KanErrorType::IncompleteSymbolic {
                i,
                j,
                numeric_active: true,
            } => write!(
                f,
                "incomplete symbolic conversion: edge ({}, {}) of layer {} is still numeric",
                i, j, layer
            ),
            KanErrorType::IncompleteSymbolic {
                i,
                j,
                numeric_active: false,
            } => write!(
                f,
                "incomplete symbolic conversion: edge ({}, {}) of layer {} is symbolic but has no function",
                i, j, layer
            ),
            KanErrorType::MismatchedLength {
                what,
                actual,
                expected,
            } => write!(f, "expected {} {}, got {}", expected, what, actual),
            KanErrorType::InvalidTopology(reason) => write!(f, "invalid topology: {}", reason),
            KanErrorType::ManualPruneIndex { index, width } => write!(
                f,
                "cannot keep node {} of hidden level {}, which has width {}",
                index, layer, width
            ),
            KanErrorType::ManualPruneDepth { actual, expected } => write!(
                f,
                "expected active node lists for {} hidden levels, got {}",
                expected, actual
            ),
            KanErrorType::EmptyDataset => write!(f, "no training samples"),
        }
    }
}

impl std::error::Error for KanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(source) => Some(source),
            None => None,
        }
    }
}
