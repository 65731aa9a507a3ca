//! A small closed-form expression tree, used to write a fully symbolic network out as a formula

use std::fmt::{self, Formatter};
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::symbolic_layer::symbolic_function::SymbolicFunction;

/// A named input variable. `index` is the input column the variable reads when an expression is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    index: usize,
    name: String,
}

impl Symbol {
    #[allow(missing_docs)]
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Symbol {
            index,
            name: name.into(),
        }
    }

    /// the input column this variable reads
    pub fn index(&self) -> usize {
        self.index
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A closed-form expression over [`Symbol`]s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Expr {
    Constant(f64),
    Variable(Symbol),
    Sum(Vec<Expr>),
    Product(Vec<Expr>),
    Apply(SymbolicFunction, Box<Expr>),
}

impl Expr {
    /// `function(arg)`, with the zero and identity primitives written out directly
    pub fn apply(function: SymbolicFunction, arg: Expr) -> Expr {
        match function {
            SymbolicFunction::Zero => Expr::Constant(0.0),
            SymbolicFunction::Identity => arg,
            _ => Expr::Apply(function, Box::new(arg)),
        }
    }

    /// Evaluate the expression with variable `x_i` bound to `values[x_i.index()]`.
    /// Variables without a value evaluate to NaN.
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        match self {
            Expr::Constant(v) => *v,
            Expr::Variable(symbol) => values.get(symbol.index).copied().unwrap_or(f64::NAN),
            Expr::Sum(terms) => terms.iter().map(|t| t.evaluate(values)).sum(),
            Expr::Product(factors) => factors.iter().map(|t| t.evaluate(values)).product(),
            Expr::Apply(function, arg) => function.evaluate(arg.evaluate(values)),
        }
    }

    /// a copy of the expression with every constant rounded to `digits` significant digits
    pub fn round_significant(&self, digits: usize) -> Expr {
        match self {
            Expr::Constant(v) => Expr::Constant(round_to_significant(*v, digits)),
            Expr::Variable(_) => self.clone(),
            Expr::Sum(terms) => Expr::Sum(terms.iter().map(|t| t.round_significant(digits)).collect()),
            Expr::Product(factors) => {
                Expr::Product(factors.iter().map(|t| t.round_significant(digits)).collect())
            }
            Expr::Apply(function, arg) => {
                Expr::Apply(*function, Box::new(arg.round_significant(digits)))
            }
        }
    }

    /// Algebraic simplification.
    ///
    /// Nested sums and products are flattened, constants are folded (including primitives applied to constants),
    /// a constant factor is distributed over a single sum, like terms are collected and zero terms are dropped.
    /// Simplification never changes the value of the expression beyond floating point rounding.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Constant(_) | Expr::Variable(_) => self.clone(),
            Expr::Apply(function, arg) => match arg.simplify() {
                Expr::Constant(v) => Expr::Constant(function.evaluate(v)),
                arg => Expr::apply(*function, arg),
            },
            Expr::Sum(terms) => simplify_sum(terms.iter().map(Expr::simplify).collect()),
            Expr::Product(factors) => {
                simplify_product(factors.iter().map(Expr::simplify).collect())
            }
        }
    }

    /// the positive counterpart of a term that displays with a leading minus sign
    fn negated(&self) -> Option<Expr> {
        match self {
            Expr::Constant(v) if *v < 0.0 => Some(Expr::Constant(-v)),
            Expr::Product(factors) => match factors.first() {
                Some(Expr::Constant(v)) if *v < 0.0 => {
                    let mut positive = factors.clone();
                    if *v == -1.0 && factors.len() > 1 {
                        positive.remove(0);
                    } else {
                        positive[0] = Expr::Constant(-v);
                    }
                    Some(match positive.len() {
                        1 => positive.swap_remove(0),
                        _ => Expr::Product(positive),
                    })
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn is_atom(&self) -> bool {
        match self {
            Expr::Variable(_) | Expr::Apply(..) => true,
            Expr::Constant(v) => *v >= 0.0,
            _ => false,
        }
    }
}

fn round_to_significant(value: f64, digits: usize) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let shift = digits as i32 - 1 - magnitude;
    let rounded = if shift >= 0 {
        let factor = 10f64.powi(shift);
        (value * factor).round() / factor
    } else {
        let factor = 10f64.powi(-shift);
        (value / factor).round() * factor
    };
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// split a term into its constant coefficient and the rest
fn split_coefficient(term: Expr) -> (f64, Expr) {
    match term {
        Expr::Product(factors) => {
            let mut coefficient = 1.0;
            let mut rest = Vec::with_capacity(factors.len());
            for factor in factors {
                match factor {
                    Expr::Constant(v) => coefficient *= v,
                    other => rest.push(other),
                }
            }
            let rest = match rest.len() {
                0 => Expr::Constant(1.0),
                1 => rest.swap_remove(0),
                _ => Expr::Product(rest),
            };
            (coefficient, rest)
        }
        other => (1.0, other),
    }
}

fn scale(coefficient: f64, term: Expr) -> Expr {
    if coefficient == 1.0 {
        return term;
    }
    match term {
        Expr::Constant(v) => Expr::Constant(coefficient * v),
        Expr::Product(mut factors) => {
            factors.insert(0, Expr::Constant(coefficient));
            Expr::Product(factors)
        }
        other => Expr::Product(vec![Expr::Constant(coefficient), other]),
    }
}

fn simplify_sum(terms: Vec<Expr>) -> Expr {
    let mut constant = 0.0;
    let mut collected: Vec<(f64, Expr)> = Vec::new();
    let flat = terms.into_iter().flat_map(|term| match term {
        Expr::Sum(inner) => inner,
        other => vec![other],
    });
    for term in flat {
        if let Expr::Constant(v) = term {
            constant += v;
            continue;
        }
        let (coefficient, rest) = split_coefficient(term);
        match collected.iter_mut().find(|(_, existing)| *existing == rest) {
            Some(entry) => entry.0 += coefficient,
            None => collected.push((coefficient, rest)),
        }
    }
    let mut result: Vec<Expr> = collected
        .into_iter()
        .filter(|(coefficient, _)| *coefficient != 0.0)
        .map(|(coefficient, rest)| scale(coefficient, rest))
        .collect();
    if constant != 0.0 {
        result.push(Expr::Constant(constant));
    }
    match result.len() {
        0 => Expr::Constant(0.0),
        1 => result.swap_remove(0),
        _ => Expr::Sum(result),
    }
}

fn simplify_product(factors: Vec<Expr>) -> Expr {
    let mut coefficient = 1.0;
    let mut rest = Vec::with_capacity(factors.len());
    let flat = factors.into_iter().flat_map(|factor| match factor {
        Expr::Product(inner) => inner,
        other => vec![other],
    });
    for factor in flat {
        match factor {
            Expr::Constant(v) => coefficient *= v,
            other => rest.push(other),
        }
    }
    if coefficient == 0.0 || rest.is_empty() {
        return Expr::Constant(coefficient);
    }
    if rest.len() == 1 && coefficient != 1.0 {
        if let Expr::Sum(terms) = &rest[0] {
            return simplify_sum(
                terms
                    .iter()
                    .map(|term| simplify_product(vec![Expr::Constant(coefficient), term.clone()]))
                    .collect(),
            );
        }
    }
    let rest = match rest.len() {
        1 => rest.swap_remove(0),
        _ => Expr::Product(rest),
    };
    scale(coefficient, rest)
}

fn write_base(f: &mut Formatter<'_>, arg: &Expr) -> fmt::Result {
    if arg.is_atom() {
        write!(f, "{}", arg)
    } else {
        write!(f, "({})", arg)
    }
}

fn write_apply(f: &mut Formatter<'_>, function: SymbolicFunction, arg: &Expr) -> fmt::Result {
    let power = |f: &mut Formatter<'_>, n: u32| -> fmt::Result {
        write_base(f, arg)?;
        write!(f, "^{}", n)
    };
    match function {
        SymbolicFunction::Zero => write!(f, "0"),
        SymbolicFunction::Identity => write!(f, "{}", arg),
        SymbolicFunction::Square => power(f, 2),
        SymbolicFunction::Cube => power(f, 3),
        SymbolicFunction::Quartic => power(f, 4),
        SymbolicFunction::Quintic => power(f, 5),
        SymbolicFunction::Inverse => {
            write!(f, "1/")?;
            write_base(f, arg)
        }
        SymbolicFunction::InverseSquare => {
            write!(f, "1/")?;
            power(f, 2)
        }
        SymbolicFunction::Gaussian => {
            write!(f, "exp(-")?;
            power(f, 2)?;
            write!(f, ")")
        }
        other => write!(f, "{}({})", other.name(), arg),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Variable(symbol) => write!(f, "{}", symbol),
            Expr::Sum(terms) => {
                if terms.is_empty() {
                    return write!(f, "0");
                }
                for (n, term) in terms.iter().enumerate() {
                    match (n, term.negated()) {
                        (0, _) => write!(f, "{}", term)?,
                        (_, Some(positive)) => write!(f, " - {}", positive)?,
                        (_, None) => write!(f, " + {}", term)?,
                    }
                }
                Ok(())
            }
            Expr::Product(factors) => {
                if factors.is_empty() {
                    return write!(f, "1");
                }
                let mut first = true;
                for (n, factor) in factors.iter().enumerate() {
                    if n == 0 && *factor == Expr::Constant(-1.0) && factors.len() > 1 {
                        write!(f, "-")?;
                        continue;
                    }
                    if !first {
                        write!(f, "*")?;
                    }
                    first = false;
                    match factor {
                        Expr::Sum(_) => write!(f, "({})", factor)?,
                        Expr::Constant(v) if *v < 0.0 && n > 0 => write!(f, "({})", v)?,
                        _ => write!(f, "{}", factor)?,
                    }
                }
                Ok(())
            }
            Expr::Apply(function, arg) => write_apply(f, *function, arg),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Constant(value)
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::Variable(symbol)
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        match self {
            Expr::Sum(mut terms) => {
                terms.push(rhs);
                Expr::Sum(terms)
            }
            lhs => Expr::Sum(vec![lhs, rhs]),
        }
    }
}

impl Add<f64> for Expr {
    type Output = Expr;

    fn add(self, rhs: f64) -> Expr {
        self + Expr::Constant(rhs)
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        match self {
            Expr::Product(mut factors) => {
                factors.push(rhs);
                Expr::Product(factors)
            }
            lhs => Expr::Product(vec![lhs, rhs]),
        }
    }
}

impl Mul<f64> for Expr {
    type Output = Expr;

    fn mul(self, rhs: f64) -> Expr {
        Expr::Product(vec![Expr::Constant(rhs), self])
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self * -1.0
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        self + (-rhs)
    }
}

impl Sub<f64> for Expr {
    type Output = Expr;

    fn sub(self, rhs: f64) -> Expr {
        self + Expr::Constant(-rhs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use statrs::assert_almost_eq;
    use test_log::test;

    fn x() -> Expr {
        Expr::Variable(Symbol::new(0, "x"))
    }

    fn y() -> Expr {
        Expr::Variable(Symbol::new(1, "y"))
    }

    #[test]
    fn test_evaluate() {
        let expr = Expr::apply(SymbolicFunction::Sin, x() * 2.0) * y() + 1.0;
        assert_almost_eq!(expr.evaluate(&[0.3, -2.0]), (0.6f64).sin() * -2.0 + 1.0, 1e-12);
        assert!(x().evaluate(&[]).is_nan());
    }

    #[test]
    fn test_apply_shortcuts() {
        assert_eq!(Expr::apply(SymbolicFunction::Zero, x()), Expr::Constant(0.0));
        assert_eq!(Expr::apply(SymbolicFunction::Identity, x()), x());
    }

    #[test]
    fn test_collect_like_terms() {
        assert_eq!((x() + x()).simplify(), x() * 2.0);
        assert_eq!((x() * 3.0 - x() * 3.0).simplify(), Expr::Constant(0.0));
    }

    #[test]
    fn test_distribute_constant() {
        let expr = (x() + 1.0) * 2.0;
        assert_eq!(expr.simplify().to_string(), "2*x + 2");
    }

    #[test]
    fn test_fold_constants() {
        let expr = Expr::apply(SymbolicFunction::Cos, Expr::Constant(0.0)) * x() + 0.0 * 5.0;
        assert_eq!(expr.simplify(), x());
    }

    #[test]
    fn test_simplify_keeps_value() {
        let expr = ((x() + y() * 0.5) * 3.0 + Expr::apply(SymbolicFunction::Exp, y() - 1.0))
            * (x() - 2.0)
            + x() * 4.0;
        let simplified = expr.simplify();
        for point in [[0.1, 0.2], [-1.5, 0.7], [2.0, -3.0]] {
            assert_almost_eq!(expr.evaluate(&point), simplified.evaluate(&point), 1e-9);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!((x() * 2.0 - y()).simplify().to_string(), "2*x - y");
        assert_eq!(
            Expr::apply(SymbolicFunction::Square, x() + 1.0).to_string(),
            "(x + 1)^2"
        );
        assert_eq!(Expr::apply(SymbolicFunction::Inverse, x()).to_string(), "1/x");
        assert_eq!(
            Expr::apply(SymbolicFunction::Tanh, x() * y()).to_string(),
            "tanh(x*y)"
        );
        assert_eq!((-x()).to_string(), "-x");
    }

    #[test]
    fn test_round_significant() {
        let expr = x() * 1.23456 + 0.000987654;
        assert_eq!(expr.round_significant(4).to_string(), "1.235*x + 0.0009877");
        assert_eq!(round_to_significant(-98765.0, 2), -99000.0);
        assert_eq!(round_to_significant(0.0, 3), 0.0);
    }
}
