//! The per-edge mode state machine: which of an edge's numeric and symbolic branches contribute to the forward pass

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{kan_error::KanError, Kan};
use crate::symbolic_layer::{fit::FitOptions, symbolic_function::SymbolicFunction};

/// Score reported by [`Kan::fix_symbolic`] for an edge whose numeric mask is zero, where the cached activations carry no signal
/// to fit against. It sorts below every genuine goodness-of-fit score.
pub const DEGENERATE_FIT_SCORE: f64 = -1e8;

/// The mode of one edge, derived from its numeric and symbolic masks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EdgeMode {
    /// masks `(0, 0)`: the edge contributes nothing
    Off,
    /// masks `(1, 0)`
    Numeric,
    /// masks `(0, 1)`
    Symbolic,
    /// masks `(numeric_weight, 1)`: the edge outputs the sum of its numeric branch, scaled by `numeric_weight`, and its symbolic branch
    Both {
        /// the numeric mask value, in `(0, 1]`
        numeric_weight: f64,
    },
}

impl EdgeMode {
    /// both branches at full weight
    pub fn both() -> Self {
        EdgeMode::Both {
            numeric_weight: 1.0,
        }
    }

    /// Classify a pair of mask values. Any non-zero numeric mask counts as numeric.
    pub fn from_masks(numeric: f64, symbolic: f64) -> Self {
        match (numeric != 0.0, symbolic != 0.0) {
            (false, false) => EdgeMode::Off,
            (true, false) => EdgeMode::Numeric,
            (false, true) => EdgeMode::Symbolic,
            (true, true) => EdgeMode::Both {
                numeric_weight: numeric,
            },
        }
    }

    /// the `(numeric, symbolic)` mask values of the mode. `Both` with a zero weight yields the masks of `Symbolic`.
    pub fn masks(&self) -> (f64, f64) {
        match self {
            EdgeMode::Off => (0.0, 0.0),
            EdgeMode::Numeric => (1.0, 0.0),
            EdgeMode::Symbolic => (0.0, 1.0),
            EdgeMode::Both { numeric_weight } => (*numeric_weight, 1.0),
        }
    }
}

impl Kan {
    /// the mode of edge `(i, j)` of layer `l`
    ///
    /// # Errors
    /// returns a [`KanError`] if the edge does not exist
    pub fn edge_mode(&self, l: usize, i: usize, j: usize) -> Result<EdgeMode, KanError> {
        self.check_edge(l, i, j)?;
        let e = j * self.topology.width_in(l) + i;
        Ok(EdgeMode::from_masks(
            self.layers[l].mask()[e],
            self.symbolic_layers[l].mask()[(j, i)],
        ))
    }

    /// Set the masks of edge `(i, j)` of layer `l` to those of `mode`
    ///
    /// # Errors
    /// returns a [`KanError`] if the edge does not exist
    pub fn set_mode(&mut self, l: usize, i: usize, j: usize, mode: EdgeMode) -> Result<(), KanError> {
        self.check_edge(l, i, j)?;
        let (numeric, symbolic) = mode.masks();
        let e = j * self.topology.width_in(l) + i;
        self.layers[l].set_mask_value(e, numeric);
        self.symbolic_layers[l].set_mask_value(i, j, symbolic);
        Ok(())
    }

    /// Fix edge `(i, j)` of layer `l` to `function` and make it symbolic-only.
    ///
    /// With `fit = Some(options)` the edge's affine parameters are fit against the cached activations of the last forward pass
    /// (the layer input `i` and the edge's output, both branches included) and the goodness of fit is returned. If the edge's numeric mask is
    /// zero the fit is meaningless and [`DEGENERATE_FIT_SCORE`] is returned instead. With `fit = None` the primitive is used as is
    /// and `None` is returned.
    ///
    /// # Errors
    /// * [`KanError`] if the edge does not exist
    /// * [`KanError`] if fitting is requested but no forward pass has been run
    pub fn fix_symbolic(
        &mut self,
        l: usize,
        i: usize,
        j: usize,
        function: SymbolicFunction,
        fit: Option<&FitOptions>,
    ) -> Result<Option<f64>, KanError> {
        self.check_edge(l, i, j)?;
        let score = match fit {
            None => {
                self.symbolic_layers[l].fix_symbolic(i, j, function, None);
                None
            }
            Some(options) => {
                let cache = self.cache.as_ref().ok_or_else(KanError::missing_cache)?;
                let e = j * self.topology.width_in(l) + i;
                let x: Vec<f64> = cache.acts[l].column(i).iter().copied().collect();
                let y: Vec<f64> = cache.layers[l]
                    .postacts
                    .column(e)
                    .iter()
                    .copied()
                    .collect();
                let score = self.symbolic_layers[l]
                    .fix_symbolic(i, j, function, Some((&x, &y, options)))
                    .unwrap_or_default();
                if self.layers[l].mask()[e] == 0.0 {
                    warn!(
                        "edge ({}, {}, {}) has no numeric signal, reporting a degenerate fit for {}",
                        l, i, j, function
                    );
                    Some(DEGENERATE_FIT_SCORE)
                } else {
                    Some(score)
                }
            }
        };
        self.set_mode(l, i, j, EdgeMode::Symbolic)?;
        debug!("edge ({}, {}, {}) fixed to {}", l, i, j, function);
        Ok(score)
    }

    /// Make edge `(i, j)` of layer `l` numeric-only and forget its symbolic primitive
    ///
    /// # Errors
    /// returns a [`KanError`] if the edge does not exist
    pub fn unfix_symbolic(&mut self, l: usize, i: usize, j: usize) -> Result<(), KanError> {
        self.set_mode(l, i, j, EdgeMode::Numeric)?;
        self.symbolic_layers[l].clear_function(i, j);
        Ok(())
    }

    /// [`Kan::unfix_symbolic`] on every edge of the network
    pub fn unfix_symbolic_all(&mut self) {
        for l in 0..self.depth() {
            for i in 0..self.topology.width_in(l) {
                for j in 0..self.topology.width_out(l + 1) {
                    let e = j * self.topology.width_in(l) + i;
                    self.layers[l].set_mask_value(e, 1.0);
                    self.symbolic_layers[l].set_mask_value(i, j, 0.0);
                    self.symbolic_layers[l].clear_function(i, j);
                }
            }
        }
    }

    /// Switch edge `(i, j)` of layer `l` off entirely
    ///
    /// # Errors
    /// returns a [`KanError`] if the edge does not exist
    pub fn remove_edge(&mut self, l: usize, i: usize, j: usize) -> Result<(), KanError> {
        self.set_mode(l, i, j, EdgeMode::Off)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kan::KanOptions;
    use crate::topology::LayerWidth;
    use nalgebra::DMatrix;
    use test_log::test;

    fn model() -> Kan {
        Kan::new(&KanOptions::new(vec![
            LayerWidth::sum_only(2),
            LayerWidth::sum_only(2),
        ]))
        .unwrap()
    }

    fn x() -> DMatrix<f64> {
        DMatrix::from_fn(21, 2, |b, i| -1.0 + 0.1 * b as f64 + 0.05 * i as f64)
    }

    #[test]
    fn test_mode_round_trips_through_masks() {
        for mode in [
            EdgeMode::Off,
            EdgeMode::Numeric,
            EdgeMode::Symbolic,
            EdgeMode::Both {
                numeric_weight: 0.3,
            },
        ] {
            let (n, s) = mode.masks();
            assert_eq!(EdgeMode::from_masks(n, s), mode);
        }
        assert_eq!(
            EdgeMode::Both { numeric_weight: 0.0 }.masks(),
            EdgeMode::Symbolic.masks()
        );
    }

    #[test]
    fn test_new_edges_are_numeric() {
        let model = model();
        assert_eq!(model.edge_mode(0, 1, 1).unwrap(), EdgeMode::Numeric);
        assert!(model.edge_mode(0, 2, 0).is_err());
        assert!(model.edge_mode(1, 0, 0).is_err());
    }

    #[test]
    fn test_set_mode() {
        let mut model = model();
        model.set_mode(0, 0, 1, EdgeMode::both()).unwrap();
        assert_eq!(model.edge_mode(0, 0, 1).unwrap(), EdgeMode::both());
        model.remove_edge(0, 0, 1).unwrap();
        assert_eq!(model.edge_mode(0, 0, 1).unwrap(), EdgeMode::Off);
    }

    #[test]
    fn test_fix_symbolic_makes_edge_symbolic() {
        let mut model = model();
        model.forward(&x()).unwrap();
        let score = model
            .fix_symbolic(0, 1, 0, SymbolicFunction::Identity, Some(&FitOptions::default()))
            .unwrap()
            .unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(model.edge_mode(0, 1, 0).unwrap(), EdgeMode::Symbolic);
        assert_eq!(
            model.fix_symbolic(0, 0, 0, SymbolicFunction::Sin, None).unwrap(),
            None
        );
        assert_eq!(model.edge_mode(0, 0, 0).unwrap(), EdgeMode::Symbolic);
    }

    #[test]
    fn test_fit_tracks_both_branches() {
        // flat splines leave a numeric branch of `scale_base * silu(x)`, which a shifted square fits closely
        let mut model = Kan::new(&KanOptions {
            noise_scale: 0.0,
            ..KanOptions::new(vec![LayerWidth::sum_only(1), LayerWidth::sum_only(1)])
        })
        .unwrap();
        model.set_mode(0, 0, 0, EdgeMode::both()).unwrap();
        let symbolic = model.symbolic_layer_mut(0);
        symbolic.fix_symbolic(0, 0, SymbolicFunction::Square, None);
        symbolic.set_affine(0, 0, [1.0, 0.0, 5.0, 0.0]);
        let x = DMatrix::from_fn(41, 1, |b, _| -1.0 + 0.05 * b as f64);
        let combined = model.forward(&x).unwrap();

        let score = model
            .fix_symbolic(0, 0, 0, SymbolicFunction::Square, Some(&FitOptions::default()))
            .unwrap()
            .unwrap();
        assert!(score > 0.9, "r2 = {}", score);
        assert_eq!(model.edge_mode(0, 0, 0).unwrap(), EdgeMode::Symbolic);
        let fitted = model.forward(&x).unwrap();
        for (f, c) in fitted.iter().zip(combined.iter()) {
            assert!((f - c).abs() < 0.1, "fitted {} vs combined {}", f, c);
        }
    }

    #[test]
    fn test_fit_requires_cache() {
        let mut model = model();
        assert!(model
            .fix_symbolic(0, 0, 0, SymbolicFunction::Sin, Some(&FitOptions::default()))
            .is_err());
    }

    #[test]
    fn test_masked_edge_reports_degenerate_score() {
        let mut model = model();
        model.remove_edge(0, 1, 1).unwrap();
        model.forward(&x()).unwrap();
        for function in [SymbolicFunction::Identity, SymbolicFunction::Exp] {
            let score = model
                .fix_symbolic(0, 1, 1, function, Some(&FitOptions::default()))
                .unwrap();
            assert_eq!(score, Some(DEGENERATE_FIT_SCORE));
        }
    }

    #[test]
    fn test_unfix_symbolic() {
        let mut model = model();
        model.fix_symbolic(0, 1, 1, SymbolicFunction::Cos, None).unwrap();
        model.unfix_symbolic(0, 1, 1).unwrap();
        assert_eq!(model.edge_mode(0, 1, 1).unwrap(), EdgeMode::Numeric);
        assert_eq!(model.symbolic_layers()[0].function(1, 1), None);
    }

    #[test]
    fn test_unfix_symbolic_all() {
        let mut model = model();
        model.fix_symbolic(0, 0, 1, SymbolicFunction::Cos, None).unwrap();
        model.remove_edge(0, 1, 0).unwrap();
        model.unfix_symbolic_all();
        for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            assert_eq!(model.edge_mode(0, i, j).unwrap(), EdgeMode::Numeric);
        }
    }
}
