//! Scalar quantities that may be unknown.
//!
//! Extents, footprints, load counts, and costs are all [`Value`]s.
//! Every operation propagates `Unknown`; there is no sentinel integer
//! anywhere in the scheduler.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Mul, Sub};

use num_integer::Integer;

/// An integer quantity that may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// A known quantity.
    Known(i64),
    /// Unresolvable; poisons every computation it enters.
    Unknown,
}

impl Value {
    /// The known value, if any.
    pub fn known(self) -> Option<i64> {
        match self {
            Value::Known(v) => Some(v),
            Value::Unknown => None,
        }
    }

    /// True if the value is unknown.
    pub fn is_unknown(self) -> bool {
        matches!(self, Value::Unknown)
    }

    /// Apply a binary operation, propagating unknowns.
    pub fn zip(self, other: Value, f: impl FnOnce(i64, i64) -> i64) -> Value {
        match (self, other) {
            (Value::Known(a), Value::Known(b)) => Value::Known(f(a, b)),
            _ => Value::Unknown,
        }
    }

    /// Minimum of two values.
    pub fn min(self, other: Value) -> Value {
        self.zip(other, i64::min)
    }

    /// Maximum of two values.
    pub fn max(self, other: Value) -> Value {
        self.zip(other, i64::max)
    }

    /// Ceiling division.
    pub fn div_ceil_by(self, divisor: i64) -> Value {
        assert!(divisor > 0, "division by non-positive tile size");
        match self {
            Value::Known(v) => Value::Known(Integer::div_ceil(&v, &divisor)),
            Value::Unknown => Value::Unknown,
        }
    }
}

impl Add for Value {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        self.zip(rhs, i64::saturating_add)
    }
}

impl Sub for Value {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        self.zip(rhs, i64::saturating_sub)
    }
}

impl Mul for Value {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        self.zip(rhs, i64::saturating_mul)
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Value>>(iter: I) -> Value {
        iter.fold(Value::Known(0), |acc, v| acc + v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Known(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Known(v) => write!(f, "{}", v),
            Value::Unknown => write!(f, "?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_poisons() {
        let a = Value::Known(3);
        assert_eq!(a + Value::Known(4), Value::Known(7));
        assert_eq!(a * Value::Unknown, Value::Unknown);
        assert_eq!(Value::Unknown - a, Value::Unknown);
        assert!((a + Value::Unknown).is_unknown());
    }

    #[test]
    fn test_sum_with_unknown() {
        let vals = vec![Value::Known(1), Value::Known(2), Value::Unknown];
        let total: Value = vals.into_iter().sum();
        assert!(total.is_unknown());
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(Value::Known(100).div_ceil_by(64), Value::Known(2));
        assert_eq!(Value::Known(128).div_ceil_by(64), Value::Known(2));
        assert_eq!(Value::Unknown.div_ceil_by(64), Value::Unknown);
    }
}
