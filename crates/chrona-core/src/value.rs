//! Value sets - every value a variable could hold at one point in its history
//!
//! A `ValueSet` is the multi-valued container the engine works with. The core
//! only ever constructs one from an iterator, unions, removes and iterates;
//! it never depends on the internal representation.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

/// Scalar value carried by a variable
pub type Value = i64;

/// Distinct values in first-seen order with order-independent equality
#[derive(Clone, Default, Serialize)]
pub struct ValueSet {
    values: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        ValueSet { values: Vec::new() }
    }

    /// Single-valued set
    pub fn single(value: Value) -> Self {
        ValueSet {
            values: vec![value],
        }
    }

    /// Number of distinct values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when the set holds exactly one value
    #[inline]
    pub fn is_single(&self) -> bool {
        self.values.len() == 1
    }

    /// The only value, if the set is single-valued
    pub fn as_single(&self) -> Option<Value> {
        match self.values.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    pub fn contains(&self, value: Value) -> bool {
        self.values.contains(&value)
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    /// Add a value if not already present
    pub fn insert(&mut self, value: Value) -> bool {
        if self.values.contains(&value) {
            return false;
        }
        self.values.push(value);
        true
    }

    /// Union, keeping the left-hand order first
    pub fn union(&self, other: &ValueSet) -> ValueSet {
        let mut merged = self.clone();
        merged.extend(other.iter());
        merged
    }

    /// Values of `self` not present in `other`
    pub fn without(&self, other: &ValueSet) -> ValueSet {
        self.iter().filter(|v| !other.contains(*v)).collect()
    }

    /// Apply `f` to every value, collapsing duplicates
    pub fn map(&self, f: impl Fn(Value) -> Value) -> ValueSet {
        self.iter().map(f).collect()
    }

    /// Values in ascending order
    pub fn sorted(&self) -> Vec<Value> {
        let mut values = self.values.clone();
        values.sort_unstable();
        values
    }
}

impl Extend<Value> for ValueSet {
    fn extend<I: IntoIterator<Item = Value>>(&mut self, iter: I) {
        for value in iter {
            self.insert(value);
        }
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let values = iter.into_iter().filter(|v| seen.insert(*v)).collect();
        ValueSet { values }
    }
}

impl From<Value> for ValueSet {
    fn from(value: Value) -> Self {
        ValueSet::single(value)
    }
}

impl From<i32> for ValueSet {
    fn from(value: i32) -> Self {
        ValueSet::single(Value::from(value))
    }
}

impl From<Vec<Value>> for ValueSet {
    fn from(values: Vec<Value>) -> Self {
        values.into_iter().collect()
    }
}

impl<const N: usize> From<[Value; N]> for ValueSet {
    fn from(values: [Value; N]) -> Self {
        values.into_iter().collect()
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|v| other.contains(v))
    }
}

impl Eq for ValueSet {}

impl fmt::Debug for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.iter()).finish()
    }
}

impl fmt::Display for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.as_single() {
            return write!(f, "{v}");
        }
        write!(f, "any(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_on_construction() {
        let set = ValueSet::from(vec![3, 1, 3, 2, 1]);
        assert_eq!(set.as_slice(), &[3, 1, 2]);
    }

    #[test]
    fn test_order_independent_equality() {
        assert_eq!(ValueSet::from([0, 1, 2]), ValueSet::from([2, 0, 1]));
        assert_ne!(ValueSet::from([0, 1]), ValueSet::from([0, 1, 2]));
    }

    #[test]
    fn test_union_and_without() {
        let a = ValueSet::from([1, 2]);
        let b = ValueSet::from([2, 3]);
        assert_eq!(a.union(&b), ValueSet::from([1, 2, 3]));
        assert_eq!(a.without(&b), ValueSet::single(1));
    }

    #[test]
    fn test_map_collapses_duplicates() {
        let set = ValueSet::from([1, -1]);
        assert_eq!(set.map(|v| v * v), ValueSet::single(1));
    }

    #[test]
    fn test_display() {
        assert_eq!(ValueSet::single(4).to_string(), "4");
        assert_eq!(ValueSet::from([-1, 1]).to_string(), "any(-1, 1)");
    }
}
