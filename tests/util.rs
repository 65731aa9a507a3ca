use multkan::training_observer::TrainingObserver;
use nalgebra::DMatrix;

#[allow(dead_code)]
pub struct TestObserver {}

#[allow(dead_code)]
impl TestObserver {
    pub fn new() -> Self {
        TestObserver {}
    }
}

impl TrainingObserver for TestObserver {
    fn on_step_end(&self, step: usize, train_loss: f64, test_loss: f64, reg: f64) {
        println!(
            "Step: {}, Train Loss: {}, Test Loss: {}, Reg: {}",
            step, train_loss, test_loss, reg
        );
    }

    fn on_grid_update(&self, step: usize) {
        println!("Grid updated at step {}", step);
    }
}

/// `n * n` points on a regular grid over `[-1, 1]^2`, one per row
#[allow(dead_code)]
pub fn square_grid(n: usize) -> DMatrix<f64> {
    let coordinate = |c: usize| -1.0 + 2.0 * c as f64 / (n - 1) as f64;
    DMatrix::from_fn(n * n, 2, |b, i| {
        if i == 0 {
            coordinate(b / n)
        } else {
            coordinate(b % n)
        }
    })
}
