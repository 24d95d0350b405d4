//! The bounds engine: expression simplification and box queries.
//!
//! Everything the region analyzer knows about producer regions comes
//! from [`bounds_of_expr_in_scope`] and [`boxes_required`]: interval
//! arithmetic over index expressions under a scope of loop bounds.
//! Unresolvable shapes degrade to unbounded intervals rather than
//! failing.

use std::collections::BTreeMap;

use crate::ir::expr::{BinOp, Expr};
use crate::ir::function::PipelineEnv;
use crate::symbolic::interval::{Interval, Region, RegionMap};
use crate::symbolic::scope::Scope;

/// Bounds on the values (not the domain) of each function, keyed by
/// (function name, value index). Used to bound data-dependent index
/// expressions such as histogram bins.
pub type FuncValueBounds = BTreeMap<(String, usize), Interval>;

/// Simplify an expression: constant folding plus the identities the
/// bounds queries rely on (`x - x`, additive and multiplicative units,
/// collapsed min/max of equal operands).
pub fn simplify(e: &Expr) -> Expr {
    match e {
        Expr::Const(_) | Expr::Var(_) => e.clone(),
        Expr::Bin(op, a, b) => {
            let sa = simplify(a);
            let sb = simplify(b);
            if let (Some(ca), Some(cb)) = (sa.as_const(), sb.as_const()) {
                return Expr::Const(op.fold(ca, cb));
            }
            match op {
                BinOp::Add => {
                    if sa.as_const() == Some(0) {
                        return sb;
                    }
                    if sb.as_const() == Some(0) {
                        return sa;
                    }
                }
                BinOp::Sub => {
                    if sb.as_const() == Some(0) {
                        return sa;
                    }
                    if sa == sb {
                        return Expr::Const(0);
                    }
                }
                BinOp::Mul => {
                    if sa.as_const() == Some(0) || sb.as_const() == Some(0) {
                        return Expr::Const(0);
                    }
                    if sa.as_const() == Some(1) {
                        return sb;
                    }
                    if sb.as_const() == Some(1) {
                        return sa;
                    }
                }
                BinOp::Div => {
                    if sb.as_const() == Some(1) {
                        return sa;
                    }
                }
                BinOp::Mod => {
                    if sb.as_const() == Some(1) {
                        return Expr::Const(0);
                    }
                }
                BinOp::Min | BinOp::Max => {
                    if sa == sb {
                        return sa;
                    }
                }
            }
            Expr::Bin(*op, Box::new(sa), Box::new(sb))
        }
        Expr::Call {
            name,
            args,
            value_index,
        } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(simplify).collect(),
            value_index: *value_index,
        },
        Expr::Let { name, value, body } => {
            let sv = simplify(value);
            if sv.as_const().is_some() {
                let mut subs = BTreeMap::new();
                subs.insert(name.clone(), sv);
                return simplify(&body.substitute(&subs));
            }
            Expr::Let {
                name: name.clone(),
                value: Box::new(sv),
                body: Box::new(simplify(body)),
            }
        }
    }
}

/// Replace free variables that have recorded scalar parameter estimates
/// by their estimated values.
pub fn substitute_param_estimates(e: &Expr, env: &PipelineEnv) -> Expr {
    let params = env.params();
    if params.is_empty() {
        return e.clone();
    }
    let subs: BTreeMap<String, Expr> = params
        .iter()
        .map(|(name, value)| (name.clone(), Expr::Const(*value)))
        .collect();
    e.substitute(&subs)
}

fn min_endpoint(a: &Option<Expr>, b: &Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.clone().min(y.clone())),
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (None, None) => None,
    }
}

fn max_endpoint(a: &Option<Expr>, b: &Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.clone().max(y.clone())),
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (None, None) => None,
    }
}

fn both(a: &Option<Expr>, b: &Option<Expr>, f: impl FnOnce(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x.clone(), y.clone())),
        _ => None,
    }
}

fn scale_interval(i: &Interval, c: i64) -> Interval {
    let times = |e: &Option<Expr>| e.as_ref().map(|x| x.clone() * Expr::Const(c));
    if c >= 0 {
        Interval {
            min: times(&i.min),
            max: times(&i.max),
        }
    } else {
        Interval {
            min: times(&i.max),
            max: times(&i.min),
        }
    }
}

fn divide_interval(i: &Interval, c: i64) -> Interval {
    let over = |e: &Option<Expr>| e.as_ref().map(|x| x.clone().div(Expr::Const(c)));
    if c > 0 {
        Interval {
            min: over(&i.min),
            max: over(&i.max),
        }
    } else {
        Interval {
            min: over(&i.max),
            max: over(&i.min),
        }
    }
}

fn as_point_const(i: &Interval) -> Option<i64> {
    match i.as_const_bounds() {
        Some((lo, hi)) if lo == hi => Some(lo),
        _ => None,
    }
}

/// Interval of values an expression can take under a scope of loop
/// bounds. Free variables not in scope stay symbolic (a point interval
/// at the variable itself); shapes the arithmetic cannot bound degrade
/// to unbounded.
pub fn bounds_of_expr_in_scope(
    e: &Expr,
    scope: &mut Scope<Interval>,
    fvb: &FuncValueBounds,
) -> Interval {
    match e {
        Expr::Const(c) => Interval::point(Expr::Const(*c)),
        Expr::Var(v) => match scope.get(v) {
            Some(i) => i.clone(),
            None => Interval::point(Expr::Var(v.clone())),
        },
        Expr::Bin(op, a, b) => {
            let ia = bounds_of_expr_in_scope(a, scope, fvb);
            let ib = bounds_of_expr_in_scope(b, scope, fvb);
            match op {
                BinOp::Add => Interval {
                    min: both(&ia.min, &ib.min, |x, y| x + y),
                    max: both(&ia.max, &ib.max, |x, y| x + y),
                },
                BinOp::Sub => Interval {
                    min: both(&ia.min, &ib.max, |x, y| x - y),
                    max: both(&ia.max, &ib.min, |x, y| x - y),
                },
                BinOp::Mul => {
                    if let Some(c) = as_point_const(&ib) {
                        scale_interval(&ia, c)
                    } else if let Some(c) = as_point_const(&ia) {
                        scale_interval(&ib, c)
                    } else if let (Some((al, ah)), Some((bl, bh))) =
                        (ia.as_const_bounds(), ib.as_const_bounds())
                    {
                        let products = [al * bl, al * bh, ah * bl, ah * bh];
                        Interval::new(
                            *products.iter().min().unwrap(),
                            *products.iter().max().unwrap(),
                        )
                    } else {
                        Interval::unbounded()
                    }
                }
                BinOp::Div => match as_point_const(&ib) {
                    Some(c) if c != 0 => divide_interval(&ia, c),
                    _ => Interval::unbounded(),
                },
                BinOp::Mod => match as_point_const(&ib) {
                    Some(c) if c > 0 => Interval::new(0, c - 1),
                    _ => Interval::unbounded(),
                },
                BinOp::Min => Interval {
                    min: both(&ia.min, &ib.min, |x, y| x.min(y)),
                    max: min_endpoint(&ia.max, &ib.max),
                },
                BinOp::Max => Interval {
                    min: max_endpoint(&ia.min, &ib.min),
                    max: both(&ia.max, &ib.max, |x, y| x.max(y)),
                },
            }
        }
        Expr::Call {
            name, value_index, ..
        } => fvb
            .get(&(name.clone(), *value_index))
            .cloned()
            .unwrap_or_else(Interval::unbounded),
        Expr::Let { name, value, body } => {
            let vb = bounds_of_expr_in_scope(value, scope, fvb);
            scope.push(name.clone(), vb);
            let out = bounds_of_expr_in_scope(body, scope, fvb);
            scope.pop(name);
            out
        }
    }
}

/// The box of every allocation read by an expression under a scope of
/// loop bounds: one interval per index expression of each call, widened
/// across call sites.
pub fn boxes_required(
    e: &Expr,
    scope: &mut Scope<Interval>,
    fvb: &FuncValueBounds,
) -> RegionMap {
    let mut out = RegionMap::new();
    collect_boxes(e, scope, fvb, &mut out);
    out
}

fn collect_boxes(
    e: &Expr,
    scope: &mut Scope<Interval>,
    fvb: &FuncValueBounds,
    out: &mut RegionMap,
) {
    match e {
        Expr::Const(_) | Expr::Var(_) => {}
        Expr::Bin(_, a, b) => {
            collect_boxes(a, scope, fvb, out);
            collect_boxes(b, scope, fvb, out);
        }
        Expr::Call { name, args, .. } => {
            let mut region = Region::new();
            for a in args {
                region.push(bounds_of_expr_in_scope(a, scope, fvb));
            }
            match out.get_mut(name) {
                Some(existing) => existing.merge(&region),
                None => {
                    out.insert(name.clone(), region);
                }
            }
            for a in args {
                collect_boxes(a, scope, fvb, out);
            }
        }
        Expr::Let { name, value, body } => {
            collect_boxes(value, scope, fvb, out);
            let vb = bounds_of_expr_in_scope(value, scope, fvb);
            scope.push(name.clone(), vb);
            collect_boxes(body, scope, fvb, out);
            scope.pop(name);
        }
    }
}

/// Bounds on the values of every function, computed in realization
/// order so that callee bounds are available when a consumer needs
/// them. Loop variables are unconstrained here; only expressions whose
/// values are bounded regardless (modulus, clamps, constants) produce
/// finite intervals.
pub fn compute_function_value_bounds(order: &[String], env: &PipelineEnv) -> FuncValueBounds {
    let mut fvb = FuncValueBounds::new();
    for name in order {
        let id = match env.lookup(name) {
            Some(id) => id,
            None => continue,
        };
        let f = env.func(id);
        if f.has_extern_definition() {
            for vi in 0..f.output_types().len() {
                fvb.insert((name.clone(), vi), Interval::unbounded());
            }
            continue;
        }
        let mut scope: Scope<Interval> = Scope::new();
        for arg in f.args() {
            scope.push(arg.clone(), Interval::unbounded());
        }
        for (vi, value) in f.stage(0).values.iter().enumerate() {
            let subs = substitute_param_estimates(value, env);
            let mut b = bounds_of_expr_in_scope(&subs, &mut scope, &fvb);
            b.simplify();
            fvb.insert((name.clone(), vi), b);
        }
    }
    fvb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simplify_folds_and_units() {
        let e = (Expr::var("x") + Expr::Const(0)) * Expr::Const(1);
        assert_eq!(simplify(&e), Expr::var("x"));
        let e = Expr::var("x") - Expr::var("x");
        assert_eq!(simplify(&e), Expr::Const(0));
        let e = Expr::Const(3) + Expr::Const(4);
        assert_eq!(simplify(&e), Expr::Const(7));
    }

    #[test]
    fn test_bounds_of_shifted_var() {
        let mut scope = Scope::new();
        scope.push("x", Interval::new(0, 9));
        let fvb = FuncValueBounds::new();
        let b = bounds_of_expr_in_scope(&(Expr::var("x") + Expr::Const(1)), &mut scope, &fvb);
        assert_eq!(b.as_const_bounds(), Some((1, 10)));
    }

    #[test]
    fn test_bounds_of_mod_is_finite() {
        let mut scope = Scope::new();
        let fvb = FuncValueBounds::new();
        let b = bounds_of_expr_in_scope(
            &Expr::var("free").modulo(Expr::Const(10)),
            &mut scope,
            &fvb,
        );
        assert_eq!(b.as_const_bounds(), Some((0, 9)));
    }

    #[test]
    fn test_boxes_required_widens_across_calls() {
        // h(x, y) + h(x + 1, y) reads h over [x, x+1] in dim 0.
        let e = Expr::call("h", vec![Expr::var("x"), Expr::var("y")])
            + Expr::call("h", vec![Expr::var("x") + Expr::Const(1), Expr::var("y")]);
        let mut scope = Scope::new();
        scope.push("x", Interval::new(0, 255));
        scope.push("y", Interval::new(0, 255));
        let fvb = FuncValueBounds::new();
        let boxes = boxes_required(&e, &mut scope, &fvb);
        let h = &boxes["h"];
        assert_eq!(h.rank(), 2);
        assert_eq!(h.dim(0).as_const_bounds(), Some((0, 256)));
        assert_eq!(h.dim(1).as_const_bounds(), Some((0, 255)));
    }

    #[test]
    fn test_bounds_through_let() {
        let e = Expr::let_in(
            "t",
            Expr::var("x") * Expr::Const(2),
            Expr::var("t") + Expr::Const(1),
        );
        let mut scope = Scope::new();
        scope.push("x", Interval::new(0, 4));
        let fvb = FuncValueBounds::new();
        let b = bounds_of_expr_in_scope(&e, &mut scope, &fvb);
        assert_eq!(b.as_const_bounds(), Some((1, 9)));
    }
}
