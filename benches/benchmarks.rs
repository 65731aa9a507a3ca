#![feature(test)]
extern crate test;
use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng, SeedableRng};
use test::Bencher;

use multkan::kan::symbolic::SuggestOptions;
use multkan::kan::{Kan, KanOptions};
use multkan::kan_layer::{KanLayer, KanLayerOptions};
use multkan::symbolic_layer::fit::FitOptions;
use multkan::topology::LayerWidth;

const INPUT_DIMENSION: usize = 32;
const OUTPUT_DIMENSION: usize = 12;
const DEGREE: usize = 3;
const GRID: usize = 10;
const BATCH: usize = 64;

fn layer(rng: &mut StdRng) -> KanLayer {
    KanLayer::new(
        &KanLayerOptions {
            in_dim: INPUT_DIMENSION,
            out_dim: OUTPUT_DIMENSION,
            grid: GRID,
            k: DEGREE,
            noise_scale: 0.1,
            scale_base_mu: 0.0,
            scale_base_sigma: 1.0,
            grid_eps: 1.0,
            grid_range: (-1.0, 1.0),
            sp_trainable: true,
            sb_trainable: true,
        },
        rng,
    )
}

fn batch(rng: &mut StdRng, width: usize) -> DMatrix<f64> {
    DMatrix::from_fn(BATCH, width, |_, _| rng.gen_range(-1.0..1.0))
}

#[bench]
fn bench_forward(b: &mut Bencher) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut layer = layer(&mut rng);
    let input = batch(&mut rng, INPUT_DIMENSION);
    b.iter(|| layer.forward(&input));
}

#[bench]
fn bench_backward(b: &mut Bencher) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut layer = layer(&mut rng);
    let input = batch(&mut rng, INPUT_DIMENSION);
    let _ = layer.forward(&input);
    let error = batch(&mut rng, INPUT_DIMENSION * OUTPUT_DIMENSION);
    b.iter(|| layer.backward(&error));
}

#[bench]
fn bench_update_grid_from_samples(b: &mut Bencher) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut layer = layer(&mut rng);
    let input = batch(&mut rng, INPUT_DIMENSION);
    b.iter(|| layer.update_grid_from_samples(&input));
}

#[bench]
fn bench_network_forward(b: &mut Bencher) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut model = Kan::new(&KanOptions::new(vec![
        LayerWidth::new(8, 0),
        LayerWidth::new(4, 4),
        LayerWidth::new(2, 0),
    ]))
    .unwrap();
    let input = batch(&mut rng, 8);
    b.iter(|| model.forward(&input));
}

#[bench]
fn bench_suggest_symbolic(b: &mut Bencher) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut model = Kan::new(&KanOptions::new(vec![2.into(), 1.into()])).unwrap();
    model.forward(&batch(&mut rng, 2)).unwrap();
    let options = SuggestOptions {
        fit: FitOptions {
            grid_number: 21,
            ..FitOptions::default()
        },
        ..SuggestOptions::default()
    };
    b.iter(|| model.suggest_symbolic(0, 0, 0, &options));
}
