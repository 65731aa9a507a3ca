//! Structural pruning: scoring neurons and edges by their activation scales, masking the unimportant ones and extracting the smaller network

use log::{debug, info};
use nalgebra::DMatrix;

use super::{kan_error::KanError, Kan};
use crate::topology::{LayerWidth, Topology};

/// How [`Kan::prune_node`] decides which hidden neurons survive
#[derive(Debug, Clone, PartialEq)]
pub enum PruneMode {
    /// keep the hidden neurons with an incoming and an outgoing edge whose scale exceeds the threshold
    Auto,
    /// keep exactly the listed neurons of every hidden level (`depth - 1` lists, indices after multiplication).
    /// Indices are range-checked but otherwise taken as given.
    Manual(Vec<Vec<usize>>),
}

/// Which of a neuron's edges [`Kan::remove_node`] switches off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSide {
    /// the edges leaving the neuron, i.e. reading input `node` of the layer at `level`
    Up,
    /// the edges entering the neuron, i.e. producing output `node` of the layer below `level`
    Down,
}

/// per output row, whether any entry exceeds `threshold`
fn any_row_above(scale: &DMatrix<f64>, threshold: f64) -> Vec<bool> {
    scale
        .row_iter()
        .map(|row| row.iter().any(|s| *s > threshold))
        .collect()
}

/// per input column, whether any entry exceeds `threshold`
fn any_column_above(scale: &DMatrix<f64>, threshold: f64) -> Vec<bool> {
    scale
        .column_iter()
        .map(|column| column.iter().any(|s| *s > threshold))
        .collect()
}

/// project a per-neuron flag back onto the values the neurons consume: sum neurons once, multiplication neurons twice
fn expand_pairs(up: &[bool], width: LayerWidth) -> Vec<bool> {
    let mut down = Vec::with_capacity(width.width_out());
    down.extend_from_slice(&up[..width.sum]);
    for flag in &up[width.sum..] {
        down.push(*flag);
        down.push(*flag);
    }
    down
}

fn active_indices(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter_map(|(n, keep)| keep.then_some(n))
        .collect()
}

impl Kan {
    /// Switch off every numeric and symbolic edge on one side of neuron `node` at depth level `level`
    ///
    /// # Errors
    /// returns a [`KanError`] if the level has no edges on that side or the neuron does not exist
    pub fn remove_node(&mut self, level: usize, node: usize, side: NodeSide) -> Result<(), KanError> {
        match side {
            NodeSide::Up => {
                if level >= self.depth() {
                    return Err(KanError::node_out_of_range(level, node, 0));
                }
                let in_dim = self.topology.width_in(level);
                if node >= in_dim {
                    return Err(KanError::node_out_of_range(level, node, in_dim));
                }
                for j in 0..self.topology.width_out(level + 1) {
                    self.layers[level].set_mask_value(j * in_dim + node, 0.0);
                    self.symbolic_layers[level].set_mask_value(node, j, 0.0);
                }
            }
            NodeSide::Down => {
                if level == 0 || level > self.depth() {
                    return Err(KanError::node_out_of_range(level, node, 0));
                }
                let out_dim = self.topology.width_out(level);
                if node >= out_dim {
                    return Err(KanError::node_out_of_range(level, node, out_dim));
                }
                let in_dim = self.topology.width_in(level - 1);
                for i in 0..in_dim {
                    self.layers[level - 1].set_mask_value(node * in_dim + i, 0.0);
                    self.symbolic_layers[level - 1].set_mask_value(i, node, 0.0);
                }
            }
        }
        Ok(())
    }

    /// Switch off the numeric branch of every edge whose combined scale in the last forward pass is at or below `threshold`.
    /// The topology is unchanged and no mask is ever switched on.
    ///
    /// # Errors
    /// returns a [`KanError`] if no forward pass has been run
    pub fn prune_edge(&mut self, threshold: f64) -> Result<(), KanError> {
        let cache = self.cache.as_ref().ok_or_else(KanError::missing_cache)?;
        let mut removed = 0;
        for (l, activations) in cache.layers.iter().enumerate() {
            let in_dim = self.topology.width_in(l);
            for (j, row) in activations.acts_scale.row_iter().enumerate() {
                for (i, scale) in row.iter().enumerate() {
                    let e = j * in_dim + i;
                    if *scale <= threshold && self.layers[l].mask()[e] != 0.0 {
                        self.layers[l].set_mask_value(e, 0.0);
                        removed += 1;
                    }
                }
            }
        }
        debug!("pruned {} edges at threshold {}", removed, threshold);
        Ok(())
    }

    /// Remove the unimportant hidden neurons and return the smaller network.
    ///
    /// For every hidden level, a neuron is important in [`PruneMode::Auto`] when some edge entering it and some edge leaving it
    /// have a combined scale above `threshold` in the last forward pass; a multiplication neuron's incoming importance requires
    /// both of its factors to be important. The edges on both sides of every unimportant neuron are switched off in this network,
    /// then a new network is built from copies of the surviving rows and columns of every layer, the surviving biases and the
    /// cached input. The input and output levels are never pruned.
    ///
    /// # Errors
    /// * [`KanError`] if `mode` is [`PruneMode::Auto`] and no forward pass has been run
    /// * [`KanError`] if a manual list has the wrong length or an index out of range
    /// * [`KanError`] if pruning leaves a level without neurons
    pub fn prune_node(&mut self, threshold: f64, mode: &PruneMode) -> Result<Kan, KanError> {
        let depth = self.depth();
        let hidden = depth - 1;
        if let PruneMode::Manual(lists) = mode {
            if lists.len() != hidden {
                return Err(KanError::manual_prune_depth(lists.len(), hidden));
            }
        }
        let mut active_up = vec![(0..self.topology.width_in(0)).collect::<Vec<usize>>()];
        let mut active_down = Vec::with_capacity(depth);
        for l in 0..hidden {
            let width = self.topology.width(l + 1);
            let up = match mode {
                PruneMode::Auto => {
                    let cache = self.require_cache()?;
                    let incoming = any_row_above(&cache.layers[l].acts_scale, threshold);
                    let mut incoming_reduced = incoming[..width.sum].to_vec();
                    incoming_reduced.extend(
                        incoming[width.sum..]
                            .chunks(2)
                            .map(|pair| pair.iter().all(|flag| *flag)),
                    );
                    let outgoing = any_column_above(&cache.layers[l + 1].acts_scale, threshold);
                    incoming_reduced
                        .iter()
                        .zip(outgoing.iter())
                        .map(|(a, b)| *a && *b)
                        .collect::<Vec<bool>>()
                }
                PruneMode::Manual(lists) => {
                    let mut flags = vec![false; width.width_in()];
                    for &n in &lists[l] {
                        if n >= flags.len() {
                            return Err(KanError::manual_prune_index(l + 1, n, flags.len()));
                        }
                        flags[n] = true;
                    }
                    flags
                }
            };
            let down = expand_pairs(&up, width);
            active_up.push(active_indices(&up));
            active_down.push(active_indices(&down));
        }
        active_down.push((0..self.topology.width_out(depth)).collect());

        for l in 0..hidden {
            for n in 0..self.topology.width_in(l + 1) {
                if !active_up[l + 1].contains(&n) {
                    self.remove_node(l + 1, n, NodeSide::Up)?;
                }
            }
            for m in 0..self.topology.width_out(l + 1) {
                if !active_down[l].contains(&m) {
                    self.remove_node(l + 1, m, NodeSide::Down)?;
                }
            }
        }

        let mut widths = Vec::with_capacity(depth + 1);
        widths.push(self.topology.width(0));
        for l in 0..hidden {
            let num_mult = active_down[l].len().saturating_sub(active_up[l + 1].len());
            let num_sum = active_down[l].len().saturating_sub(2 * num_mult);
            widths.push(LayerWidth::new(num_sum, num_mult));
        }
        widths.push(self.topology.width(depth));
        let topology = Topology::new(widths)?;

        let layers = (0..depth)
            .map(|l| self.layers[l].subset(&active_up[l], &active_down[l]))
            .collect();
        let symbolic_layers = (0..depth)
            .map(|l| self.symbolic_layers[l].subset(&active_up[l], &active_down[l]))
            .collect();
        let biases = (0..depth)
            .map(|l| {
                let bias = &self.biases[l];
                match active_up.get(l + 1) {
                    Some(keep) => keep.iter().map(|&n| bias[n]).collect::<Vec<f64>>().into(),
                    None => bias.clone(),
                }
            })
            .collect();
        info!("pruned network {} down to {}", self.topology, topology);
        let mut pruned = Kan::from_parts(
            topology,
            layers,
            symbolic_layers,
            biases,
            self.options.clone(),
        );
        pruned.cache_input = self.cache_input.clone();
        Ok(pruned)
    }

    /// Node pruning followed by edge pruning of the smaller network on the cached input.
    ///
    /// # Errors
    /// * any error from [`Kan::prune_node`]
    /// * [`KanError`] if no input has been cached
    pub fn prune(&mut self, node_threshold: f64, edge_threshold: f64) -> Result<Kan, KanError> {
        if self.cache.is_none() {
            self.reforward()?;
        }
        let mut pruned = self.prune_node(node_threshold, &PruneMode::Auto)?;
        pruned.reforward()?;
        pruned.prune_edge(edge_threshold)?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kan::{edge_mode::EdgeMode, KanOptions};
    use statrs::assert_almost_eq;
    use test_log::test;

    fn model(widths: &[(usize, usize)]) -> Kan {
        Kan::new(&KanOptions::new(
            widths.iter().map(|&(s, m)| LayerWidth::new(s, m)).collect(),
        ))
        .unwrap()
    }

    fn x(rows: usize, cols: usize) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |b, i| {
            -1.0 + 2.0 * ((b * (i + 2) + 3 * i) % rows) as f64 / rows as f64
        })
    }

    #[test]
    fn test_remove_node_sides() {
        let mut model = model(&[(2, 0), (3, 0), (1, 0)]);
        model.remove_node(1, 2, NodeSide::Down).unwrap();
        for i in 0..2 {
            assert_eq!(model.edge_mode(0, i, 2).unwrap(), EdgeMode::Off);
            assert_eq!(model.edge_mode(0, i, 1).unwrap(), EdgeMode::Numeric);
        }
        model.remove_node(1, 0, NodeSide::Up).unwrap();
        assert_eq!(model.edge_mode(1, 0, 0).unwrap(), EdgeMode::Off);
        assert_eq!(model.edge_mode(1, 1, 0).unwrap(), EdgeMode::Numeric);
        assert!(model.remove_node(0, 0, NodeSide::Down).is_err());
        assert!(model.remove_node(2, 0, NodeSide::Up).is_err());
        assert!(model.remove_node(1, 3, NodeSide::Down).is_err());
    }

    #[test]
    fn test_prune_edge_only_switches_off() {
        let mut model = model(&[(2, 0), (2, 0)]);
        model.remove_edge(0, 1, 0).unwrap();
        model.forward(&x(12, 2)).unwrap();
        model.prune_edge(1e-9).unwrap();
        assert_eq!(model.edge_mode(0, 1, 0).unwrap(), EdgeMode::Off);
        assert_eq!(model.edge_mode(0, 0, 0).unwrap(), EdgeMode::Numeric);
        model.prune_edge(f64::INFINITY).unwrap();
        for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            assert_eq!(model.edge_mode(0, i, j).unwrap(), EdgeMode::Off);
        }
    }

    #[test]
    fn test_prune_edge_requires_cache() {
        assert!(model(&[(1, 0), (1, 0)]).prune_edge(0.1).is_err());
    }

    #[test]
    fn test_auto_prune_drops_silent_neuron() {
        let mut model = model(&[(2, 0), (3, 0), (1, 0)]);
        model.remove_node(1, 1, NodeSide::Down).unwrap();
        model.remove_node(1, 1, NodeSide::Up).unwrap();
        let data = x(16, 2);
        let before = model.forward(&data).unwrap();
        let mut pruned = model.prune_node(1e-2, &PruneMode::Auto).unwrap();
        assert_eq!(pruned.topology().to_string(), "[2, 2, 1]");
        assert_eq!(pruned.layers()[0].out_dim(), 2);
        assert_eq!(pruned.layers()[1].in_dim(), 2);
        assert_eq!(pruned.cached_input(), Some(&data));
        let after = pruned.reforward().unwrap();
        for (a, b) in after.iter().zip(before.iter()) {
            assert_almost_eq!(*a, *b, 1e-12);
        }
    }

    #[test]
    fn test_mult_neuron_needs_both_factors() {
        let mut model = model(&[(2, 0), (1, 1), (1, 0)]);
        // silence the second factor of the multiplication neuron
        model.remove_node(1, 2, NodeSide::Down).unwrap();
        model.forward(&x(16, 2)).unwrap();
        let pruned = model.prune_node(1e-2, &PruneMode::Auto).unwrap();
        assert_eq!(pruned.topology().width(1), LayerWidth::new(1, 0));
        assert_eq!(pruned.layers()[0].out_dim(), 1);
        // both factors of the dropped neuron lose their incoming edges in the original network
        for i in 0..2 {
            assert_eq!(model.edge_mode(0, i, 1).unwrap(), EdgeMode::Off);
            assert_eq!(model.edge_mode(0, i, 0).unwrap(), EdgeMode::Numeric);
        }
        assert_eq!(model.edge_mode(1, 1, 0).unwrap(), EdgeMode::Off);
    }

    #[test]
    fn test_manual_prune() {
        let mut model = model(&[(2, 0), (2, 2), (1, 0)]);
        model.set_bias(0, 3, 0.5);
        let pruned = model
            .prune_node(0.0, &PruneMode::Manual(vec![vec![0, 3]]))
            .unwrap();
        assert_eq!(pruned.topology().width(1), LayerWidth::new(1, 1));
        assert_eq!(pruned.layers()[0].out_dim(), 3);
        // kept outputs are 0 and the pair (4, 5) of the second multiplication neuron
        assert_eq!(
            pruned.layers()[0].coef().row(2),
            model.layers()[0].coef().row(4 * 2)
        );
        assert_eq!(pruned.biases()[0].as_slice(), &[0.0, 0.5]);
    }

    #[test]
    fn test_manual_prune_is_range_checked() {
        let mut model = model(&[(2, 0), (2, 0), (1, 0)]);
        assert!(model
            .prune_node(0.0, &PruneMode::Manual(vec![vec![2]]))
            .is_err());
        assert!(model
            .prune_node(0.0, &PruneMode::Manual(vec![vec![0], vec![0]]))
            .is_err());
    }

    #[test]
    fn test_auto_prune_requires_cache() {
        let mut model = model(&[(2, 0), (2, 0), (1, 0)]);
        assert!(model.prune_node(1e-2, &PruneMode::Auto).is_err());
    }

    #[test]
    fn test_prune_runs_node_then_edge() {
        let mut model = model(&[(2, 0), (4, 0), (1, 0)]);
        model.remove_node(1, 3, NodeSide::Down).unwrap();
        model.forward(&x(20, 2)).unwrap();
        let pruned = model.prune(1e-2, 3e-2).unwrap();
        assert_eq!(pruned.topology().width_in(1), 3);
        assert!(pruned.cache().is_some());
    }
}
