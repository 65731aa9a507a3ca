mod util;

use multkan::kan::edge_mode::EdgeMode;
use multkan::kan::prune::PruneMode;
use multkan::kan::{Kan, KanOptions};
use multkan::topology::LayerWidth;
use statrs::assert_almost_eq;
use util::square_grid;

fn model() -> Kan {
    Kan::new(&KanOptions {
        seed: 11,
        ..KanOptions::new(vec![
            LayerWidth::new(2, 0),
            LayerWidth::new(2, 1),
            LayerWidth::new(1, 0),
        ])
    })
    .unwrap()
}

/// switch off every edge touching hidden neuron 1, both the edges feeding it and the edges leaving it
fn silence_hidden_sum_neuron(model: &mut Kan) {
    for i in 0..2 {
        model.remove_edge(0, i, 1).unwrap();
    }
    model.remove_edge(1, 1, 0).unwrap();
}

#[test]
fn pruning_drops_silent_neurons_and_keeps_the_output() {
    let mut model = model();
    silence_hidden_sum_neuron(&mut model);
    let x = square_grid(6);
    let before = model.forward(&x).unwrap();

    let mut pruned = model.prune_node(1e-6, &PruneMode::Auto).unwrap();
    assert_eq!(pruned.topology().widths()[1], LayerWidth::new(1, 1));
    let after = pruned.forward(&x).unwrap();
    for (a, b) in after.iter().zip(before.iter()) {
        assert_almost_eq!(*a, *b, 1e-9);
    }

    let cache = pruned.cache().unwrap();
    assert!(cache.acts_scale().iter().all(|scale| scale.iter().all(|s| *s > 1e-6)));
}

#[test]
fn a_product_with_a_dead_factor_is_pruned() {
    let mut model = model();
    // the second factor of the multiplication neuron receives nothing
    for i in 0..2 {
        model.remove_edge(0, i, 3).unwrap();
    }
    model.forward(&square_grid(6)).unwrap();
    let pruned = model.prune_node(1e-6, &PruneMode::Auto).unwrap();
    assert_eq!(pruned.topology().widths()[1], LayerWidth::new(2, 0));
    // both factors lose their incoming edges in the original network
    for j in 2..4 {
        for i in 0..2 {
            assert_eq!(model.edge_mode(0, i, j).unwrap(), EdgeMode::Off);
        }
    }
}

#[test]
fn manual_pruning_keeps_the_listed_neurons() {
    let mut model = model();
    model.forward(&square_grid(4)).unwrap();
    let pruned = model
        .prune_node(0.0, &PruneMode::Manual(vec![vec![0, 2]]))
        .unwrap();
    assert_eq!(pruned.topology().widths()[1], LayerWidth::new(1, 1));
    assert_eq!(pruned.topology().input_dim(), 2);
    assert_eq!(pruned.topology().output_dim(), 1);
}

#[test]
fn prune_then_edge_prune_only_switches_edges_off() {
    let mut model = model();
    silence_hidden_sum_neuron(&mut model);
    model.forward(&square_grid(6)).unwrap();
    let pruned = model.prune(1e-6, 1e-6).unwrap();
    let depth = pruned.depth();
    assert_eq!(depth, 2);
    for l in 0..depth {
        for i in 0..pruned.topology().width_in(l) {
            for j in 0..pruned.topology().width_out(l + 1) {
                let mode = pruned.edge_mode(l, i, j).unwrap();
                assert!(matches!(mode, EdgeMode::Numeric | EdgeMode::Off));
            }
        }
    }
}

#[test]
fn pruning_without_a_forward_pass_is_an_error() {
    let mut model = model();
    assert!(model.prune_node(1e-2, &PruneMode::Auto).is_err());
    assert!(model.prune_edge(1e-2).is_err());
}
