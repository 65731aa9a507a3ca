//! Symbolic search over the primitive library and extraction of a closed-form formula from a fully symbolic network

use std::fmt;

use log::{debug, info, warn};
use strum::IntoEnumIterator;

use super::{kan_error::KanError, Kan};
use crate::expr::{Expr, Symbol};
use crate::symbolic_layer::{fit::FitOptions, symbolic_function::SymbolicFunction};
use crate::topology::reduce_products;

/// Settings for [`Kan::suggest_symbolic`] and [`Kan::auto_symbolic`]
#[derive(Debug, Clone)]
pub struct SuggestOptions {
    /// affine fit search settings
    pub fit: FitOptions,
    /// the primitives to try; `None` tries the whole library
    pub library: Option<Vec<SymbolicFunction>>,
    /// how many candidates to return
    pub topk: usize,
    /// weight of the complexity term in the ranking loss, in `[0, 1]`
    pub weight_simple: f64,
    /// maps a goodness-of-fit score to a loss; must be decreasing
    pub r2_loss: fn(f64) -> f64,
    /// maps a complexity cost to a loss; must be increasing
    pub complexity_loss: fn(f64) -> f64,
}

impl Default for SuggestOptions {
    /// * `fit`: [`FitOptions::default`]
    /// * `library`: every primitive
    /// * `topk`: 5
    /// * `weight_simple`: 0.02
    /// * `r2_loss`: `1 - r2`
    /// * `complexity_loss`: identity
    fn default() -> Self {
        SuggestOptions {
            fit: FitOptions::default(),
            library: None,
            topk: 5,
            weight_simple: 0.02,
            r2_loss: |r2| 1.0 - r2,
            complexity_loss: |c| c,
        }
    }
}

/// One primitive tried by [`Kan::suggest_symbolic`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolicCandidate {
    #[allow(missing_docs)]
    pub function: SymbolicFunction,
    /// goodness of fit against the edge's cached activations
    pub r2: f64,
    #[allow(missing_docs)]
    pub complexity: usize,
    /// `weight_simple * complexity_loss(complexity) + (1 - weight_simple) * r2_loss(r2)`, lower is better
    pub loss: f64,
}

/// Settings for [`Kan::symbolic_formula`]
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaOptions {
    /// significant digits kept in every constant
    pub digits: usize,
    /// names of the input variables; `None` names them `x_1`, `x_2`, ...
    pub variables: Option<Vec<String>>,
    /// per-input `(mean, std)`: the network was trained on `(x - mean) / std`
    pub normalizer: Option<(Vec<f64>, Vec<f64>)>,
    /// per-output `(mean, std)`: the network was trained to predict `(y - mean) / std`
    pub output_normalizer: Option<(Vec<f64>, Vec<f64>)>,
    /// simplify the expression after every layer
    pub simplify: bool,
}

impl Default for FormulaOptions {
    /// * `digits`: 4
    /// * `variables`: `x_1`, `x_2`, ...
    /// * `normalizer`: none
    /// * `output_normalizer`: none
    /// * `simplify`: true
    fn default() -> Self {
        FormulaOptions {
            digits: 4,
            variables: None,
            normalizer: None,
            output_normalizer: None,
            simplify: true,
        }
    }
}

/// One closed-form expression per network output, over the input variables
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicFormula {
    #[allow(missing_docs)]
    pub outputs: Vec<Expr>,
    /// one variable per network input, in input order
    pub variables: Vec<Symbol>,
}

impl SymbolicFormula {
    /// evaluate every output expression at one input point
    pub fn evaluate(&self, x: &[f64]) -> Vec<f64> {
        self.outputs.iter().map(|e| e.evaluate(x)).collect()
    }
}

impl fmt::Display for SymbolicFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, output) in self.outputs.iter().enumerate() {
            if n > 0 {
                writeln!(f)?;
            }
            write!(f, "y_{} = {}", n + 1, output)?;
        }
        Ok(())
    }
}

fn check_lengths(
    normalizer: &Option<(Vec<f64>, Vec<f64>)>,
    what: &'static str,
    expected: usize,
) -> Result<(), KanError> {
    if let Some((mean, std)) = normalizer {
        for values in [mean, std] {
            if values.len() != expected {
                return Err(KanError::mismatched_length(what, values.len(), expected));
            }
        }
    }
    Ok(())
}

impl Kan {
    /// Rank the library's primitives as replacements for edge `(i, j)` of layer `l`.
    ///
    /// Each primitive is fit against the cached activations of the last forward pass (see [`Kan::fix_symbolic`]) and the edge is
    /// restored to its previous state afterwards. Candidates are returned best first, at most `options.topk` of them.
    /// Degenerate fits (see [`DEGENERATE_FIT_SCORE`](super::edge_mode::DEGENERATE_FIT_SCORE)) sort last.
    ///
    /// # Errors
    /// * [`KanError`] if the edge does not exist
    /// * [`KanError`] if no forward pass has been run
    pub fn suggest_symbolic(
        &mut self,
        l: usize,
        i: usize,
        j: usize,
        options: &SuggestOptions,
    ) -> Result<Vec<SymbolicCandidate>, KanError> {
        self.check_edge(l, i, j)?;
        self.require_cache()?;
        let library: Vec<SymbolicFunction> = match &options.library {
            Some(library) => library.clone(),
            None => SymbolicFunction::iter().collect(),
        };
        let e = j * self.topology.width_in(l) + i;
        let numeric_mask = self.layers[l].mask()[e];
        let symbolic_mask = self.symbolic_layers[l].mask()[(j, i)];
        let affine = self.symbolic_layers[l].affine(i, j);
        let previous = self.symbolic_layers[l].function(i, j);

        let mut candidates = Vec::with_capacity(library.len());
        for function in library {
            let r2 = self
                .fix_symbolic(l, i, j, function, Some(&options.fit))?
                .unwrap_or_default();
            let complexity = function.complexity();
            let loss = options.weight_simple * (options.complexity_loss)(complexity as f64)
                + (1.0 - options.weight_simple) * (options.r2_loss)(r2);
            candidates.push(SymbolicCandidate {
                function,
                r2,
                complexity,
                loss,
            });
        }

        self.layers[l].set_mask_value(e, numeric_mask);
        self.symbolic_layers[l].set_mask_value(i, j, symbolic_mask);
        match previous {
            Some(function) => {
                self.symbolic_layers[l].fix_symbolic(i, j, function, None);
            }
            None => self.symbolic_layers[l].clear_function(i, j),
        }
        self.symbolic_layers[l].set_affine(i, j, affine);

        candidates.sort_by(|a, b| a.loss.total_cmp(&b.loss));
        candidates.truncate(options.topk.max(1));
        if let Some(best) = candidates.first() {
            debug!(
                "best candidate for edge ({}, {}, {}) is {} with r2={:.4}",
                l, i, j, best.function, best.r2
            );
        }
        Ok(candidates)
    }

    /// Fix every numeric-only edge to its best suggestion (see [`Kan::suggest_symbolic`]).
    ///
    /// Edges that are switched off entirely are fixed to the zero primitive without fitting. Edges with an active symbolic branch,
    /// symbolic-only or mixed, are left as they are, so a second call changes nothing. An edge for which the library yields no
    /// candidate stays numeric and is reported with a warning. Every fit reads the cache of the last forward pass.
    ///
    /// # Errors
    /// returns a [`KanError`] if no forward pass has been run
    pub fn auto_symbolic(&mut self, options: &SuggestOptions) -> Result<(), KanError> {
        self.require_cache()?;
        for l in 0..self.depth() {
            let in_dim = self.topology.width_in(l);
            for i in 0..in_dim {
                for j in 0..self.topology.width_out(l + 1) {
                    let numeric = self.layers[l].mask()[j * in_dim + i];
                    let symbolic = self.symbolic_layers[l].mask()[(j, i)];
                    if symbolic > 0.0 {
                        debug!("skipping ({}, {}, {}), already symbolic", l, i, j);
                    } else if symbolic == 0.0 && numeric == 0.0 {
                        self.fix_symbolic(l, i, j, SymbolicFunction::Zero, None)?;
                        info!("fixing ({}, {}, {}) with 0", l, i, j);
                    } else {
                        let candidates = self.suggest_symbolic(l, i, j, options)?;
                        let Some(best) = candidates.first() else {
                            warn!(
                                "no symbolic candidate for ({}, {}, {}), leaving it numeric",
                                l, i, j
                            );
                            continue;
                        };
                        self.fix_symbolic(l, i, j, best.function, Some(&options.fit))?;
                        info!(
                            "fixing ({}, {}, {}) with {}, r2={:.4}, c={}",
                            l, i, j, best.function, best.r2, best.complexity
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Write the network out as one closed-form expression per output.
    ///
    /// Every edge must be symbolic-only or off: an edge whose numeric branch is still active, or whose symbolic mask is set without a
    /// primitive, makes the conversion fail with an error naming the edge. Each layer sums `mask * (c * f(a * x_i + b) + d)` over its
    /// inputs, reduces the multiplication pairs and adds the bias.
    ///
    /// # Errors
    /// * [`KanError`] if an edge is not fully symbolic (see [`KanError::is_incomplete_symbolic`])
    /// * [`KanError`] if the variable names or either normalizer have the wrong length
    pub fn symbolic_formula(&self, options: &FormulaOptions) -> Result<SymbolicFormula, KanError> {
        let input_dim = self.topology.input_dim();
        let output_dim = self.topology.output_dim();
        check_lengths(&options.normalizer, "input normalizer entries", input_dim)?;
        check_lengths(&options.output_normalizer, "output normalizer entries", output_dim)?;
        let variables: Vec<Symbol> = match &options.variables {
            Some(names) if names.len() != input_dim => {
                return Err(KanError::mismatched_length(
                    "variable names",
                    names.len(),
                    input_dim,
                ))
            }
            Some(names) => names
                .iter()
                .enumerate()
                .map(|(n, name)| Symbol::new(n, name.clone()))
                .collect(),
            None => (0..input_dim)
                .map(|n| Symbol::new(n, format!("x_{}", n + 1)))
                .collect(),
        };

        for l in 0..self.depth() {
            let in_dim = self.topology.width_in(l);
            for j in 0..self.topology.width_out(l + 1) {
                for i in 0..in_dim {
                    if self.layers[l].mask()[j * in_dim + i] != 0.0 {
                        return Err(KanError::incomplete_symbolic(l, i, j, true));
                    }
                    if self.symbolic_layers[l].mask()[(j, i)] != 0.0
                        && self.symbolic_layers[l].function(i, j).is_none()
                    {
                        return Err(KanError::incomplete_symbolic(l, i, j, false));
                    }
                }
            }
        }

        let mut x: Vec<Expr> = variables
            .iter()
            .enumerate()
            .map(|(n, symbol)| {
                let variable = Expr::Variable(symbol.clone());
                match &options.normalizer {
                    Some((mean, std)) => (variable - mean[n]) * (1.0 / std[n]),
                    None => variable,
                }
            })
            .collect();

        for l in 0..self.depth() {
            let layer = &self.symbolic_layers[l];
            let sums: Vec<Expr> = (0..self.topology.width_out(l + 1))
                .map(|j| {
                    let terms: Vec<Expr> = x
                        .iter()
                        .enumerate()
                        .filter_map(|(i, x_i)| {
                            let mask = layer.mask()[(j, i)];
                            let function = layer.function(i, j)?;
                            if mask == 0.0 {
                                return None;
                            }
                            let [a, b, c, d] = layer.affine(i, j);
                            let edge = Expr::apply(function, x_i.clone() * a + b) * c + d;
                            Some(if mask == 1.0 { edge } else { edge * mask })
                        })
                        .collect();
                    match terms.len() {
                        0 => Expr::Constant(0.0),
                        _ => Expr::Sum(terms),
                    }
                })
                .collect();
            x = reduce_products(sums, self.topology.width(l + 1))
                .into_iter()
                .zip(self.biases[l].iter())
                .map(|(y, bias)| {
                    let y = if *bias == 0.0 { y } else { y + *bias };
                    if options.simplify {
                        y.simplify()
                    } else {
                        y
                    }
                })
                .collect();
        }

        let outputs = x
            .into_iter()
            .enumerate()
            .map(|(n, y)| {
                let y = match &options.output_normalizer {
                    Some((mean, std)) => y * std[n] + mean[n],
                    None => y,
                };
                let y = if options.simplify { y.simplify() } else { y };
                y.round_significant(options.digits)
            })
            .collect();
        Ok(SymbolicFormula { outputs, variables })
    }
}
