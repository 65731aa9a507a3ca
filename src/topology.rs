//! Layer widths for networks that mix sum neurons and multiplication neurons.
//!
//! Each depth level of a network is described by a [`LayerWidth`]: a number of sum neurons, which pass their aggregated
//! value through unchanged, and a number of multiplication neurons, each of which consumes two consecutive aggregated values
//! and emits their product. A layer feeding level `l` therefore has to produce [`LayerWidth::width_out`] values, which are reduced
//! to [`LayerWidth::width_in`] values before being handed to the next layer.

use std::{fmt, ops::Mul, str::FromStr};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::kan::kan_error::KanError;

/// The number of sum neurons and multiplication neurons at one depth level of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerWidth {
    /// neurons that pass their aggregated input through unchanged
    pub sum: usize,
    /// neurons that multiply two consecutive aggregated inputs
    pub mult: usize,
}

impl LayerWidth {
    /// create a new width record
    pub fn new(sum: usize, mult: usize) -> Self {
        LayerWidth { sum, mult }
    }

    /// a level with only sum neurons
    pub fn sum_only(sum: usize) -> Self {
        LayerWidth { sum, mult: 0 }
    }

    /// the number of values seen by the next layer, after the multiplication neurons have paired their inputs
    pub fn width_in(&self) -> usize {
        self.sum + self.mult
    }

    /// the number of values the previous layer must produce, before the multiplication neurons pair them
    pub fn width_out(&self) -> usize {
        self.sum + 2 * self.mult
    }
}

impl From<usize> for LayerWidth {
    fn from(sum: usize) -> Self {
        LayerWidth::sum_only(sum)
    }
}

impl fmt::Display for LayerWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mult == 0 {
            write!(f, "{}", self.sum)
        } else {
            write!(f, "{}+{}", self.sum, self.mult)
        }
    }
}

/// Parse a width of the form `"3"` (three sum neurons) or `"3+2"` (three sum neurons and two multiplication neurons)
impl FromStr for LayerWidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid layer width '{}': {}", s, e))
        };
        match s.split_once('+') {
            Some((sum, mult)) => Ok(LayerWidth::new(parse(sum)?, parse(mult)?)),
            None => Ok(LayerWidth::sum_only(parse(s)?)),
        }
    }
}

/// The ordered width records of a network, one per depth level, from the input level to the output level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    widths: Vec<LayerWidth>,
}

impl Topology {
    /// Build a topology from the width records of every depth level.
    ///
    /// # Errors
    /// Returns a [`KanError`] if fewer than two levels are given or if any level would present zero values to the next layer.
    pub fn new(widths: Vec<LayerWidth>) -> Result<Self, KanError> {
        if widths.len() < 2 {
            return Err(KanError::invalid_topology(format!(
                "a network needs at least an input and an output level, got {} levels",
                widths.len()
            )));
        }
        if let Some(level) = widths.iter().position(|w| w.width_in() == 0) {
            return Err(KanError::invalid_topology(format!(
                "level {} has no neurons",
                level
            )));
        }
        Ok(Topology { widths })
    }

    /// the number of layers (edge layers between consecutive levels)
    pub fn depth(&self) -> usize {
        self.widths.len() - 1
    }

    /// the width record of every level
    pub fn widths(&self) -> &[LayerWidth] {
        &self.widths
    }

    /// the width record of level `level`
    pub fn width(&self, level: usize) -> LayerWidth {
        self.widths[level]
    }

    /// the number of values presented to layer `level` (equivalently, the number of neurons at `level` after reduction)
    pub fn width_in(&self, level: usize) -> usize {
        self.widths[level].width_in()
    }

    /// the number of values layer `level - 1` must produce for `level`
    pub fn width_out(&self, level: usize) -> usize {
        self.widths[level].width_out()
    }

    /// the number of features the network accepts
    pub fn input_dim(&self) -> usize {
        self.width_in(0)
    }

    /// the number of values the network emits
    pub fn output_dim(&self) -> usize {
        self.width_in(self.depth())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.widths.iter().map(|w| w.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Apply the multiplication reduction for `width` to a vector of `width.width_out()` values.
///
/// The first `width.sum` values pass through unchanged; every following pair `(sum + 2k, sum + 2k + 1)` is replaced by its product.
/// Pairs are always consecutive and taken in their original order.
pub fn reduce_products<T>(values: Vec<T>, width: LayerWidth) -> Vec<T>
where
    T: Mul<Output = T>,
{
    debug_assert_eq!(values.len(), width.width_out());
    let mut reduced = Vec::with_capacity(width.width_in());
    let mut values = values.into_iter();
    reduced.extend(values.by_ref().take(width.sum));
    while let (Some(left), Some(right)) = (values.next(), values.next()) {
        reduced.push(left * right);
    }
    reduced
}

/// Column-wise [`reduce_products`] over a batch, where each row is one sample of `width.width_out()` values.
pub(crate) fn reduce_product_columns(x: &DMatrix<f64>, width: LayerWidth) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), width.width_in(), |b, n| {
        if n < width.sum {
            x[(b, n)]
        } else {
            let left = width.sum + 2 * (n - width.sum);
            x[(b, left)] * x[(b, left + 1)]
        }
    })
}

/// Gradient of the loss w.r.t. the pre-reduction values, given the gradient w.r.t. the reduced values and the pre-reduction values themselves.
pub(crate) fn expand_product_gradient(
    premult: &DMatrix<f64>,
    d_reduced: &DMatrix<f64>,
    width: LayerWidth,
) -> DMatrix<f64> {
    DMatrix::from_fn(premult.nrows(), width.width_out(), |b, m| {
        if m < width.sum {
            d_reduced[(b, m)]
        } else {
            let offset = m - width.sum;
            let pair = offset / 2;
            let partner = if offset % 2 == 0 { m + 1 } else { m - 1 };
            d_reduced[(b, width.sum + pair)] * premult[(b, partner)]
        }
    })
}
