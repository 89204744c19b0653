//! Reversible operations
//!
//! Every arithmetic update a variable goes through is recorded with both its
//! forward and inverse map. The operator set is closed and explicit; nothing
//! is discovered at runtime.

use std::fmt;

use crate::{ChronaError, ChronaResult, Value};

/// Operation recorded with a forward and an inverse mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReversibleOp {
    /// x + k
    Add(Value),
    /// x - k
    Sub(Value),
    /// x * k, inverse x / k
    Mul(Value),
    /// x / k, inverse x * k
    Div(Value),
    /// Euclidean x mod d. Not bijective: the inverse is the identity.
    Mod(Value),
    /// -x
    Neg,
    /// x ^ k
    Xor(Value),
}

impl ReversibleOp {
    /// Reject operations whose maps are undefined
    pub fn validate(self) -> ChronaResult<Self> {
        match self {
            ReversibleOp::Mul(0) | ReversibleOp::Div(0) => Err(ChronaError::InvalidOperation(
                format!("{self} has no inverse"),
            )),
            ReversibleOp::Mod(d) if d <= 0 => Err(ChronaError::InvalidOperation(format!(
                "modulus must be positive, got {d}"
            ))),
            _ => Ok(self),
        }
    }

    /// Apply the operation as written
    #[inline]
    pub fn forward(self, x: Value) -> Value {
        match self {
            ReversibleOp::Add(k) => x.wrapping_add(k),
            ReversibleOp::Sub(k) => x.wrapping_sub(k),
            ReversibleOp::Mul(k) => x.wrapping_mul(k),
            ReversibleOp::Div(k) => {
                if k == 0 {
                    x
                } else {
                    x.wrapping_div(k)
                }
            }
            ReversibleOp::Mod(d) => {
                if d == 0 {
                    x
                } else {
                    x.rem_euclid(d)
                }
            }
            ReversibleOp::Neg => x.wrapping_neg(),
            ReversibleOp::Xor(k) => x ^ k,
        }
    }

    /// Undo the operation
    #[inline]
    pub fn inverse(self, x: Value) -> Value {
        match self {
            ReversibleOp::Add(k) => x.wrapping_sub(k),
            ReversibleOp::Sub(k) => x.wrapping_add(k),
            ReversibleOp::Mul(k) => {
                if k == 0 {
                    x
                } else {
                    x.wrapping_div(k)
                }
            }
            ReversibleOp::Div(k) => x.wrapping_mul(k),
            ReversibleOp::Mod(_) => x,
            ReversibleOp::Neg => x.wrapping_neg(),
            ReversibleOp::Xor(k) => x ^ k,
        }
    }

    /// Whether `inverse(forward(x)) == x` holds for every x in range
    pub fn is_bijective(self) -> bool {
        !matches!(self, ReversibleOp::Mod(_))
    }

    pub fn is_addition(self) -> bool {
        matches!(self, ReversibleOp::Add(_))
    }

    /// Divisor of a modulus operation
    pub fn modulus(self) -> Option<Value> {
        match self {
            ReversibleOp::Mod(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for ReversibleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReversibleOp::Add(k) => write!(f, "+{k}"),
            ReversibleOp::Sub(k) => write!(f, "-{k}"),
            ReversibleOp::Mul(k) => write!(f, "*{k}"),
            ReversibleOp::Div(k) => write!(f, "/{k}"),
            ReversibleOp::Mod(d) => write!(f, "%{d}"),
            ReversibleOp::Neg => write!(f, "neg"),
            ReversibleOp::Xor(k) => write!(f, "^{k}"),
        }
    }
}
