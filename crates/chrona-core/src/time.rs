//! Time direction primitives
//!
//! Convergence alternates two directions of simulated time:
//! - Forward: the code block executes and records its writes
//! - Reverse: recorded writes are replayed backward to rebuild antecedents

use std::fmt;

/// Direction of simulated time, carried as an entropy sign (+1 / -1)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(i8)]
pub enum TimeDirection {
    #[default]
    Forward = 1,
    Reverse = -1,
}

impl TimeDirection {
    /// Entropy sign
    #[inline]
    pub fn entropy(self) -> i8 {
        self as i8
    }

    /// Parse from entropy sign; any non-negative value is forward
    #[inline]
    pub fn from_entropy(entropy: i8) -> Self {
        if entropy < 0 {
            TimeDirection::Reverse
        } else {
            TimeDirection::Forward
        }
    }

    #[inline]
    pub fn flipped(self) -> Self {
        match self {
            TimeDirection::Forward => TimeDirection::Reverse,
            TimeDirection::Reverse => TimeDirection::Forward,
        }
    }

    #[inline]
    pub fn is_forward(self) -> bool {
        self == TimeDirection::Forward
    }

    #[inline]
    pub fn is_reverse(self) -> bool {
        self == TimeDirection::Reverse
    }
}

impl fmt::Display for TimeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeDirection::Forward => write!(f, "forward"),
            TimeDirection::Reverse => write!(f, "reverse"),
        }
    }
}
