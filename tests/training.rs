mod util;

use multkan::kan::{Kan, KanOptions};
use multkan::optimizer::Adam;
use multkan::regularizer::RegularizationOptions;
use multkan::topology::LayerWidth;
use multkan::training_options::TrainingOptions;
use multkan::{train_model, Dataset, Sample};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::File;
use std::io::Seek;
use tempfile::tempfile;
use util::TestObserver;

fn product_dataset(train: usize, test: usize) -> Dataset {
    let mut rng = StdRng::seed_from_u64(42);
    let mut sample = || {
        let x: f64 = rng.gen_range(-1.0..1.0);
        let y: f64 = rng.gen_range(-1.0..1.0);
        Sample::new(vec![x, y], vec![x * y])
    };
    Dataset {
        train: (0..train).map(|_| sample()).collect(),
        test: (0..test).map(|_| sample()).collect(),
    }
}

/// a single multiplication neuron can learn f(x, y) = xy
#[test]
fn regressor_xy() {
    let dataset = product_dataset(200, 50);
    let untrained_model = Kan::new(&KanOptions::new(vec![
        LayerWidth::new(2, 0),
        LayerWidth::new(0, 1),
        LayerWidth::new(1, 0),
    ]))
    .unwrap();
    let training_result = train_model(
        untrained_model,
        &dataset,
        &mut Adam::new(0.02),
        &TestObserver::new(),
        &TrainingOptions {
            steps: 200,
            batch_size: Some(64),
            seed: Some(5),
            ..TrainingOptions::default()
        },
    );
    if let Err(e) = training_result {
        panic!("Error training model: {:#?}", e);
    }
    let (_, history) = training_result.unwrap();
    let first = history.test_loss[0];
    let last = *history.test_loss.last().unwrap();
    assert!(
        last < first,
        "Test loss did not decrease after training. Before training: {}, After training: {}",
        first,
        last
    );
}

#[test]
fn regularized_training_records_the_penalty() {
    let dataset = product_dataset(64, 16);
    let model = Kan::new(&KanOptions::new(vec![2.into(), LayerWidth::new(2, 1), 1.into()])).unwrap();
    let options = TrainingOptions {
        steps: 10,
        update_grid: false,
        regularization: RegularizationOptions {
            lamb: 0.01,
            lamb_coef: 0.5,
            lamb_coefdiff: 0.5,
            ..RegularizationOptions::default()
        },
        seed: Some(1),
        ..TrainingOptions::default()
    };
    let (trained_model, history) =
        train_model(model, &dataset, &mut Adam::new(0.01), &TestObserver::new(), &options).unwrap();
    assert_eq!(history.reg.len(), 10);
    assert!(history.reg.iter().all(|r| r.is_finite() && *r > 0.0));
    assert!(trained_model.cache().is_some());
}

#[test]
fn trained_model_survives_serialization() {
    let dataset = product_dataset(32, 0);
    let model = Kan::new(&KanOptions::new(vec![
        LayerWidth::new(2, 0),
        LayerWidth::new(1, 1),
        LayerWidth::new(1, 0),
    ]))
    .unwrap();
    let (trained_model, history) = train_model(
        model,
        &dataset,
        &mut Adam::new(0.01),
        &TestObserver::new(),
        &TrainingOptions {
            steps: 5,
            ..TrainingOptions::default()
        },
    )
    .unwrap();
    assert!(history.test_loss.iter().all(|l| l.is_nan()));

    let mut file: File = tempfile().unwrap();
    ciborium::into_writer(&trained_model, &mut file).unwrap();
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    let loaded_model: Kan = ciborium::from_reader(&file).unwrap();
    assert!(loaded_model.cache().is_none());
    assert_eq!(loaded_model.parameters(), trained_model.parameters());

    let samples: Vec<&Sample> = dataset.train.iter().collect();
    let (x, _) = multkan::to_matrices(&samples);
    assert_eq!(loaded_model.infer(&x).unwrap(), trained_model.infer(&x).unwrap());
}
