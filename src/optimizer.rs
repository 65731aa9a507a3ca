//! First-order optimizers over a model's flat parameter vector (see [`Kan::parameters`](crate::kan::Kan::parameters))

use serde::{Deserialize, Serialize};

/// Updates a flat parameter vector in place from its gradient, once per training step
pub trait Optimizer {
    /// apply one update. `parameters` and `gradients` have the same length.
    fn step(&mut self, parameters: &mut [f64], gradients: &[f64]);
}

/// Plain gradient descent: `p -= learning_rate * g`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    #[allow(missing_docs)]
    pub learning_rate: f64,
}

impl Sgd {
    #[allow(missing_docs)]
    pub fn new(learning_rate: f64) -> Self {
        Sgd { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &mut [f64], gradients: &[f64]) {
        for (p, g) in parameters.iter_mut().zip(gradients.iter()) {
            *p -= self.learning_rate * g;
        }
    }
}

/// Adam with bias-corrected moment estimates.
///
/// The moments are reset whenever the parameter count changes, e.g. after the model is pruned or refined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    #[allow(missing_docs)]
    pub learning_rate: f64,
    #[allow(missing_docs)]
    pub beta1: f64,
    #[allow(missing_docs)]
    pub beta2: f64,
    #[allow(missing_docs)]
    pub epsilon: f64,
    first_moment: Vec<f64>,
    second_moment: Vec<f64>,
    steps: i32,
}

impl Adam {
    /// An optimizer with `beta1 = 0.9`, `beta2 = 0.999` and `epsilon = 1e-8`
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
            steps: 0,
        }
    }

    fn reset(&mut self, len: usize) {
        self.first_moment = vec![0.0; len];
        self.second_moment = vec![0.0; len];
        self.steps = 0;
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut [f64], gradients: &[f64]) {
        if self.first_moment.len() != parameters.len() {
            self.reset(parameters.len());
        }
        self.steps = self.steps.saturating_add(1);
        let correction1 = 1.0 - self.beta1.powi(self.steps);
        let correction2 = 1.0 - self.beta2.powi(self.steps);
        for (n, (p, g)) in parameters.iter_mut().zip(gradients.iter()).enumerate() {
            let m = &mut self.first_moment[n];
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            let v = &mut self.second_moment[n];
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = self.first_moment[n] / correction1;
            let v_hat = self.second_moment[n] / correction2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}
