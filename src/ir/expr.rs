//! Scalar expressions defining pipeline functions.
//!
//! An expression is an integer-valued tree of constants, loop variables,
//! arithmetic, min/max, calls to other pipeline functions or input
//! buffers, and let bindings. Expressions are small and immutable;
//! passes produce new trees rather than mutating in place.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Binary operators on expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Euclidean (floor) division.
    Div,
    /// Euclidean remainder.
    Mod,
    Min,
    Max,
}

impl BinOp {
    /// Fold the operator over two constants.
    pub fn fold(self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    0
                } else {
                    a.div_euclid(b)
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    0
                } else {
                    a.rem_euclid(b)
                }
            }
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        }
    }
}

/// A scalar integer expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer constant.
    Const(i64),
    /// Loop variable or pipeline parameter.
    Var(String),
    /// Binary operation.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// Call to a pipeline function or input buffer at the given indices.
    Call {
        /// Name of the callee.
        name: String,
        /// Index expression per storage dimension of the callee.
        args: Vec<Expr>,
        /// Which value of a multi-valued callee is read.
        value_index: usize,
    },
    /// Let binding scoping `value` as `name` inside `body`.
    Let {
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
    },
}

impl Expr {
    /// A variable reference.
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    /// A call to `name` reading value 0.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            value_index: 0,
        }
    }

    /// A let binding.
    pub fn let_in(name: impl Into<String>, value: Expr, body: Expr) -> Expr {
        Expr::Let {
            name: name.into(),
            value: Box::new(value),
            body: Box::new(body),
        }
    }

    /// Elementwise minimum.
    pub fn min(self, other: Expr) -> Expr {
        Expr::Bin(BinOp::Min, Box::new(self), Box::new(other))
    }

    /// Elementwise maximum.
    pub fn max(self, other: Expr) -> Expr {
        Expr::Bin(BinOp::Max, Box::new(self), Box::new(other))
    }

    /// Euclidean division.
    pub fn div(self, other: Expr) -> Expr {
        Expr::Bin(BinOp::Div, Box::new(self), Box::new(other))
    }

    /// Euclidean remainder.
    pub fn modulo(self, other: Expr) -> Expr {
        Expr::Bin(BinOp::Mod, Box::new(self), Box::new(other))
    }

    /// The constant value, if this expression is a constant.
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// The variable name, if this expression is a bare variable.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Visit every node of the tree in pre-order.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Const(_) | Expr::Var(_) => {}
            Expr::Bin(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.visit(f);
                }
            }
            Expr::Let { value, body, .. } => {
                value.visit(f);
                body.visit(f);
            }
        }
    }

    /// True if the expression mentions the variable `name`. Let bindings
    /// shadow: a bound occurrence does not count as a use.
    pub fn uses_var(&self, name: &str) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Var(v) => v == name,
            Expr::Bin(_, a, b) => a.uses_var(name) || b.uses_var(name),
            Expr::Call { args, .. } => args.iter().any(|a| a.uses_var(name)),
            Expr::Let {
                name: bound,
                value,
                body,
            } => value.uses_var(name) || (bound != name && body.uses_var(name)),
        }
    }

    /// True if the expression mentions any variable in `vars`.
    pub fn uses_any_var(&self, vars: &std::collections::BTreeSet<String>) -> bool {
        vars.iter().any(|v| self.uses_var(v))
    }

    /// Substitute variables by the expressions in `subs`. Let bindings
    /// shadow substitutions of the bound name inside their body.
    pub fn substitute(&self, subs: &BTreeMap<String, Expr>) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Var(v) => subs.get(v).cloned().unwrap_or_else(|| self.clone()),
            Expr::Bin(op, a, b) => Expr::Bin(
                *op,
                Box::new(a.substitute(subs)),
                Box::new(b.substitute(subs)),
            ),
            Expr::Call {
                name,
                args,
                value_index,
            } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|a| a.substitute(subs)).collect(),
                value_index: *value_index,
            },
            Expr::Let { name, value, body } => {
                let new_value = value.substitute(subs);
                let new_body = if subs.contains_key(name) {
                    let mut inner = subs.clone();
                    inner.remove(name);
                    body.substitute(&inner)
                } else {
                    body.substitute(subs)
                };
                Expr::Let {
                    name: name.clone(),
                    value: Box::new(new_value),
                    body: Box::new(new_body),
                }
            }
        }
    }

    /// Collect every call site as a (callee, index expressions) pair, in
    /// pre-order. Duplicate call sites are kept; stride analysis counts
    /// each access separately.
    pub fn collect_calls(&self, out: &mut Vec<(String, Vec<Expr>)>) {
        self.visit(&mut |e| {
            if let Expr::Call { name, args, .. } = e {
                out.push((name.clone(), args.clone()));
            }
        });
    }

    /// Names of all callees referenced by the expression.
    pub fn callees(&self, out: &mut std::collections::BTreeSet<String>) {
        self.visit(&mut |e| {
            if let Expr::Call { name, .. } = e {
                out.insert(name.clone());
            }
        });
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Bin(BinOp::Add, Box::new(self), Box::new(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Bin(BinOp::Sub, Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Bin(BinOp::Mul, Box::new(self), Box::new(rhs))
    }
}

impl From<i64> for Expr {
    fn from(c: i64) -> Expr {
        Expr::Const(c)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{}", c),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Bin(op, a, b) => match op {
                BinOp::Add => write!(f, "({} + {})", a, b),
                BinOp::Sub => write!(f, "({} - {})", a, b),
                BinOp::Mul => write!(f, "({}*{})", a, b),
                BinOp::Div => write!(f, "({}/{})", a, b),
                BinOp::Mod => write!(f, "({} % {})", a, b),
                BinOp::Min => write!(f, "min({}, {})", a, b),
                BinOp::Max => write!(f, "max({}, {})", a, b),
            },
            Expr::Call { name, args, .. } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Let { name, value, body } => {
                write!(f, "(let {} = {} in {})", name, value, body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_shadowing() {
        // let x = 3 in x + y, substituting x -> 7 must not touch the body.
        let e = Expr::let_in("x", Expr::Const(3), Expr::var("x") + Expr::var("y"));
        let mut subs = BTreeMap::new();
        subs.insert("x".to_string(), Expr::Const(7));
        let out = e.substitute(&subs);
        match out {
            Expr::Let { body, .. } => {
                assert!(body.uses_var("x"));
                assert!(body.uses_var("y"));
            }
            _ => panic!("expected let"),
        }
    }

    #[test]
    fn test_uses_var() {
        let e = Expr::call("f", vec![Expr::var("x") + Expr::Const(1)]);
        assert!(e.uses_var("x"));
        assert!(!e.uses_var("y"));
    }

    #[test]
    fn test_collect_calls_keeps_duplicates() {
        let e = Expr::call("h", vec![Expr::var("x")]) + Expr::call("h", vec![Expr::var("x")]);
        let mut calls = Vec::new();
        e.collect_calls(&mut calls);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_display() {
        let e = Expr::var("x") * Expr::var("y");
        assert_eq!(format!("{}", e), "(x*y)");
    }
}
