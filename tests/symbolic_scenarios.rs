mod util;

use multkan::kan::edge_mode::{EdgeMode, DEGENERATE_FIT_SCORE};
use multkan::kan::symbolic::{FormulaOptions, SuggestOptions};
use multkan::kan::{Kan, KanOptions};
use multkan::symbolic_layer::fit::FitOptions;
use multkan::symbolic_layer::symbolic_function::SymbolicFunction;
use multkan::topology::LayerWidth;
use nalgebra::DMatrix;
use statrs::assert_almost_eq;
use util::square_grid;

fn build(widths: Vec<LayerWidth>) -> Kan {
    Kan::new(&KanOptions::new(widths)).unwrap()
}

/// fix edge `(i, j)` of layer `l` to `c * f(a * x + b) + d`
fn plant(model: &mut Kan, l: usize, i: usize, j: usize, function: SymbolicFunction, affine: [f64; 4]) {
    model.fix_symbolic(l, i, j, function, None).unwrap();
    model.symbolic_layer_mut(l).set_affine(i, j, affine);
}

fn assert_formula_matches_network(model: &Kan, x: &DMatrix<f64>, tolerance: f64) {
    let formula = model
        .symbolic_formula(&FormulaOptions {
            digits: 15,
            ..FormulaOptions::default()
        })
        .unwrap();
    let prediction = model.infer(x).unwrap();
    for b in 0..x.nrows() {
        let point: Vec<f64> = x.row(b).iter().copied().collect();
        let evaluated = formula.evaluate(&point);
        for (o, value) in evaluated.iter().enumerate() {
            assert_almost_eq!(*value, prediction[(b, o)], tolerance);
        }
    }
}

/// two inputs, one hidden sum neuron, one output, every edge fixed to the identity
#[test]
fn identity_network_reduces_to_affine_formula() {
    let mut model = build(vec![
        LayerWidth::new(2, 0),
        LayerWidth::new(1, 0),
        LayerWidth::new(1, 0),
    ]);
    plant(&mut model, 0, 0, 0, SymbolicFunction::Identity, [1.0, 0.0, 2.0, 0.5]);
    plant(&mut model, 0, 1, 0, SymbolicFunction::Identity, [1.0, 0.0, 3.0, 0.0]);
    plant(&mut model, 1, 0, 0, SymbolicFunction::Identity, [1.0, 0.0, 1.0, 0.0]);

    let formula = model.symbolic_formula(&FormulaOptions::default()).unwrap();
    assert_eq!(formula.outputs.len(), 1);
    assert_eq!(formula.variables.len(), 2);
    for (x1, x2) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (-0.3, 0.7)] {
        assert_almost_eq!(formula.evaluate(&[x1, x2])[0], 2.0 * x1 + 3.0 * x2 + 0.5, 1e-12);
    }
    assert_formula_matches_network(&model, &square_grid(5), 1e-9);
}

/// the sum neurons come first and each multiplication neuron consumes the next two columns in order
#[test]
fn multiplication_pairs_consume_consecutive_columns() {
    let mut model = build(vec![
        LayerWidth::new(2, 0),
        LayerWidth::new(1, 1),
        LayerWidth::new(1, 0),
    ]);
    // layer 0 produces [2*x1, x1, x2]
    plant(&mut model, 0, 0, 0, SymbolicFunction::Identity, [1.0, 0.0, 2.0, 0.0]);
    plant(&mut model, 0, 0, 1, SymbolicFunction::Identity, [1.0, 0.0, 1.0, 0.0]);
    plant(&mut model, 0, 1, 2, SymbolicFunction::Identity, [1.0, 0.0, 1.0, 0.0]);
    model.remove_edge(0, 1, 0).unwrap();
    model.remove_edge(0, 1, 1).unwrap();
    model.remove_edge(0, 0, 2).unwrap();
    // layer 1 adds the sum neuron to ten times the product
    plant(&mut model, 1, 0, 0, SymbolicFunction::Identity, [1.0, 0.0, 1.0, 0.0]);
    plant(&mut model, 1, 1, 0, SymbolicFunction::Identity, [1.0, 0.0, 10.0, 0.0]);

    let x = square_grid(4);
    let prediction = model.infer(&x).unwrap();
    for b in 0..x.nrows() {
        let (x1, x2) = (x[(b, 0)], x[(b, 1)]);
        assert_almost_eq!(prediction[(b, 0)], 2.0 * x1 + 10.0 * x1 * x2, 1e-12);
    }
    assert_formula_matches_network(&model, &x, 1e-9);
}

#[test]
fn auto_symbolic_then_formula_round_trip() {
    let mut model = build(vec![
        LayerWidth::new(2, 0),
        LayerWidth::new(1, 1),
        LayerWidth::new(1, 0),
    ]);
    model.forward(&square_grid(6)).unwrap();
    let options = SuggestOptions {
        library: Some(vec![
            SymbolicFunction::Identity,
            SymbolicFunction::Square,
            SymbolicFunction::Sin,
            SymbolicFunction::Tanh,
        ]),
        fit: FitOptions {
            grid_number: 21,
            ..FitOptions::default()
        },
        ..SuggestOptions::default()
    };
    model.auto_symbolic(&options).unwrap();
    for l in 0..model.depth() {
        for i in 0..model.topology().width_in(l) {
            for j in 0..model.topology().width_out(l + 1) {
                let mode = model.edge_mode(l, i, j).unwrap();
                assert!(matches!(mode, EdgeMode::Symbolic | EdgeMode::Off));
            }
        }
    }

    // idempotent
    let converted = model.clone();
    model.auto_symbolic(&options).unwrap();
    assert_eq!(model.symbolic_layers(), converted.symbolic_layers());
    assert_eq!(model.layers(), converted.layers());

    assert_formula_matches_network(&model, &square_grid(5), 1e-6);
}

#[test]
fn fixing_a_silent_edge_reports_the_sentinel() {
    let mut model = build(vec![LayerWidth::new(2, 0), LayerWidth::new(1, 0)]);
    model.set_mode(0, 1, 0, EdgeMode::Symbolic).unwrap();
    model.forward(&square_grid(5)).unwrap();
    for function in [SymbolicFunction::Identity, SymbolicFunction::Sin, SymbolicFunction::Exp] {
        let score = model
            .fix_symbolic(0, 1, 0, function, Some(&FitOptions::default()))
            .unwrap();
        assert_eq!(score, Some(DEGENERATE_FIT_SCORE));
        assert_eq!(model.edge_mode(0, 1, 0).unwrap(), EdgeMode::Symbolic);
    }

    let candidates = model
        .suggest_symbolic(0, 0, 0, &SuggestOptions::default())
        .unwrap();
    assert!(candidates[0].r2 > DEGENERATE_FIT_SCORE);
}

#[test]
fn formula_requires_a_fully_symbolic_network() {
    let mut model = build(vec![LayerWidth::new(1, 0), LayerWidth::new(1, 0)]);
    let error = model.symbolic_formula(&FormulaOptions::default()).unwrap_err();
    assert!(error.is_incomplete_symbolic());
    plant(&mut model, 0, 0, 0, SymbolicFunction::Cos, [1.0, 0.0, 1.0, 0.0]);
    let formula = model.symbolic_formula(&FormulaOptions::default()).unwrap();
    assert_almost_eq!(formula.evaluate(&[0.0])[0], 1.0, 1e-12);
}
