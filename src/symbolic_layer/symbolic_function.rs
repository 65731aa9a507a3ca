use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Largest magnitude the reciprocal primitives are allowed to reach near their singularity
const SINGULARITY_CAP: f64 = 1e3;
/// `log` is evaluated on `max(|x|, LOG_FLOOR)`
const LOG_FLOOR: f64 = 1e-8;
/// `exp` saturates above this argument
const EXP_CEILING: f64 = 700.0;

/// The library of closed-form primitives a symbolic edge can be fixed to.
///
/// Each primitive has a short name (used for display and parsing, e.g. `"x^2"`) and an integer complexity used to rank candidates.
/// Singular primitives are evaluated in a protected form so they stay finite everywhere: the reciprocals are capped near zero,
/// `sqrt` is zero for negative input, `log` takes the log of the magnitude with a floor, and `exp` saturates.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    IntoStaticStr,
)]
pub enum SymbolicFunction {
    #[strum(serialize = "0")]
    Zero,
    #[strum(serialize = "x")]
    Identity,
    #[strum(serialize = "x^2")]
    Square,
    #[strum(serialize = "x^3")]
    Cube,
    #[strum(serialize = "x^4")]
    Quartic,
    #[strum(serialize = "x^5")]
    Quintic,
    #[strum(serialize = "1/x")]
    Inverse,
    #[strum(serialize = "1/x^2")]
    InverseSquare,
    #[strum(serialize = "sqrt")]
    Sqrt,
    #[strum(serialize = "exp")]
    Exp,
    #[strum(serialize = "log")]
    Log,
    #[strum(serialize = "abs")]
    Abs,
    #[strum(serialize = "sin")]
    Sin,
    #[strum(serialize = "cos")]
    Cos,
    #[strum(serialize = "tan")]
    Tan,
    #[strum(serialize = "tanh")]
    Tanh,
    #[strum(serialize = "sgn")]
    Sign,
    #[strum(serialize = "arctan")]
    Arctan,
    #[strum(serialize = "gaussian")]
    Gaussian,
}

impl SymbolicFunction {
    /// the name of the primitive, e.g. `"x^2"`
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// the complexity cost of the primitive; simpler functions are preferred when fits are comparable
    pub fn complexity(&self) -> usize {
        match self {
            SymbolicFunction::Zero => 0,
            SymbolicFunction::Identity => 1,
            SymbolicFunction::Square
            | SymbolicFunction::Inverse
            | SymbolicFunction::InverseSquare
            | SymbolicFunction::Sqrt
            | SymbolicFunction::Exp
            | SymbolicFunction::Log
            | SymbolicFunction::Sin
            | SymbolicFunction::Cos => 2,
            SymbolicFunction::Cube
            | SymbolicFunction::Quartic
            | SymbolicFunction::Quintic
            | SymbolicFunction::Abs
            | SymbolicFunction::Tan
            | SymbolicFunction::Tanh
            | SymbolicFunction::Sign
            | SymbolicFunction::Gaussian => 3,
            SymbolicFunction::Arctan => 4,
        }
    }

    /// evaluate the (protected) primitive at `x`
    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            SymbolicFunction::Zero => 0.0,
            SymbolicFunction::Identity => x,
            SymbolicFunction::Square => x * x,
            SymbolicFunction::Cube => x.powi(3),
            SymbolicFunction::Quartic => x.powi(4),
            SymbolicFunction::Quintic => x.powi(5),
            SymbolicFunction::Inverse => {
                if x.abs() < 1.0 / SINGULARITY_CAP {
                    x * SINGULARITY_CAP * SINGULARITY_CAP
                } else {
                    1.0 / x
                }
            }
            SymbolicFunction::InverseSquare => {
                if x * x < 1.0 / SINGULARITY_CAP {
                    SINGULARITY_CAP
                } else {
                    1.0 / (x * x)
                }
            }
            SymbolicFunction::Sqrt => x.max(0.0).sqrt(),
            SymbolicFunction::Exp => x.min(EXP_CEILING).exp(),
            SymbolicFunction::Log => x.abs().max(LOG_FLOOR).ln(),
            SymbolicFunction::Abs => x.abs(),
            SymbolicFunction::Sin => x.sin(),
            SymbolicFunction::Cos => x.cos(),
            SymbolicFunction::Tan => x.tan(),
            SymbolicFunction::Tanh => x.tanh(),
            SymbolicFunction::Sign => sign(x),
            SymbolicFunction::Arctan => x.atan(),
            SymbolicFunction::Gaussian => (-x * x).exp(),
        }
    }

    /// derivative of [`SymbolicFunction::evaluate`] at `x`
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            SymbolicFunction::Zero => 0.0,
            SymbolicFunction::Identity => 1.0,
            SymbolicFunction::Square => 2.0 * x,
            SymbolicFunction::Cube => 3.0 * x * x,
            SymbolicFunction::Quartic => 4.0 * x.powi(3),
            SymbolicFunction::Quintic => 5.0 * x.powi(4),
            SymbolicFunction::Inverse => {
                if x.abs() < 1.0 / SINGULARITY_CAP {
                    SINGULARITY_CAP * SINGULARITY_CAP
                } else {
                    -1.0 / (x * x)
                }
            }
            SymbolicFunction::InverseSquare => {
                if x * x < 1.0 / SINGULARITY_CAP {
                    0.0
                } else {
                    -2.0 / x.powi(3)
                }
            }
            SymbolicFunction::Sqrt => {
                if x > 0.0 {
                    0.5 / x.sqrt()
                } else {
                    0.0
                }
            }
            SymbolicFunction::Exp => {
                if x < EXP_CEILING {
                    x.exp()
                } else {
                    0.0
                }
            }
            SymbolicFunction::Log => {
                if x.abs() > LOG_FLOOR {
                    1.0 / x
                } else {
                    0.0
                }
            }
            SymbolicFunction::Abs => sign(x),
            SymbolicFunction::Sin => x.cos(),
            SymbolicFunction::Cos => -x.sin(),
            SymbolicFunction::Tan => 1.0 / (x.cos() * x.cos()),
            SymbolicFunction::Tanh => 1.0 - x.tanh() * x.tanh(),
            SymbolicFunction::Sign => 0.0,
            SymbolicFunction::Arctan => 1.0 / (1.0 + x * x),
            SymbolicFunction::Gaussian => -2.0 * x * (-x * x).exp(),
        }
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use statrs::assert_almost_eq;
    use std::str::FromStr;
    use strum::IntoEnumIterator;
    use test_log::test;

    #[test]
    fn names_round_trip() {
        for function in SymbolicFunction::iter() {
            assert_eq!(SymbolicFunction::from_str(function.name()).unwrap(), function);
            assert_eq!(function.to_string(), function.name());
        }
        assert!(SymbolicFunction::from_str("x^7").is_err());
    }

    #[test]
    fn zero_is_the_simplest() {
        let min = SymbolicFunction::iter().map(|f| f.complexity()).min().unwrap();
        assert_eq!(min, 0);
        assert_eq!(SymbolicFunction::Zero.complexity(), 0);
        assert_eq!(SymbolicFunction::Identity.complexity(), 1);
    }

    #[test]
    fn protected_functions_stay_finite() {
        for function in SymbolicFunction::iter() {
            for x in [-1e3, -1.0, -1e-9, 0.0, 1e-9, 0.5, 800.0] {
                assert!(function.evaluate(x).is_finite(), "{} at {}", function, x);
            }
        }
    }

    #[test]
    fn derivatives_match_finite_difference() {
        let h = 1e-6;
        for function in SymbolicFunction::iter() {
            for x in [-1.3, -0.4, 0.7, 1.9] {
                let numeric = (function.evaluate(x + h) - function.evaluate(x - h)) / (2.0 * h);
                assert_almost_eq!(function.derivative(x), numeric, 1e-4);
            }
        }
    }

    #[test]
    fn reciprocal_is_continuous_at_cap() {
        let edge = 1.0 / SINGULARITY_CAP;
        assert_almost_eq!(
            SymbolicFunction::Inverse.evaluate(edge * 0.999_999),
            SymbolicFunction::Inverse.evaluate(edge),
            1e-2
        );
    }
}
