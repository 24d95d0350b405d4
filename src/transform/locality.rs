//! Access-stride analysis for loop reordering.
//!
//! For each loop dimension of a stage, sums the largest storage stride
//! any access takes when that loop advances. The emitter orders loops
//! so the smallest total stride is innermost.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::expr::Expr;
use crate::ir::function::FStage;
use crate::symbolic::interval::{Region, RegionMap};
use crate::symbolic::value::Value;
use crate::transform::grouping::Partitioner;

/// Variables transitively dependent on `var` across the let bindings of
/// the given expressions: a let whose value mentions a dependent
/// variable makes its bound name dependent too.
pub fn find_vars_using_var(exprs: &[&Expr], var: &str) -> BTreeSet<String> {
    let mut deps: BTreeSet<String> = BTreeSet::new();
    deps.insert(var.to_string());
    for e in exprs {
        e.visit(&mut |node| {
            if let Expr::Let { name, value, .. } = node {
                if value.uses_any_var(&deps) {
                    deps.insert(name.clone());
                }
            }
        });
    }
    deps
}

/// Largest stride, in bytes, that an access to `func_acc` takes when
/// any variable in `dep_vars` advances. `acc_exprs` are the access's
/// index expressions; `buffer_bounds` bounds the allocation. Walks
/// storage dimensions innermost to outermost, growing the running
/// stride by each dimension's extent.
pub fn find_max_access_stride(
    part: &Partitioner<'_>,
    dep_vars: &BTreeSet<String>,
    func_acc: &str,
    acc_exprs: &[Expr],
    buffer_bounds: &Region,
) -> Value {
    let env = part.env();
    let (bytes_per_ele, num_storage_dims) = match env.lookup(func_acc) {
        Some(id) => {
            let f = env.func(id);
            (f.bytes_per_point(), f.args().len())
        }
        None => {
            let input = env
                .input(func_acc)
                .unwrap_or_else(|| panic!("access to unknown allocation {}", func_acc));
            (input.ty.bytes(), buffer_bounds.rank())
        }
    };
    assert!(num_storage_dims <= acc_exprs.len());

    let mut curr_stride = Value::Known(bytes_per_ele);
    let mut stride = Value::Known(0);
    for sdim in 0..num_storage_dims {
        // Accesses not involving the loop variable have stride 0 along
        // it.
        if acc_exprs[sdim].uses_any_var(dep_vars) {
            stride = stride.max(curr_stride);
        }
        curr_stride = curr_stride * buffer_bounds.dim(sdim).extent();
    }
    stride
}

/// Sum of access strides along each loop variable of a stage. Strides
/// are computed on the expressions after inlining: a transpose inlined
/// into a transpose accesses with identity strides, which neither
/// definition shows alone. The left-hand-side store participates like
/// any read.
pub fn analyze_spatial_locality(
    part: &Partitioner<'_>,
    stg: &FStage,
    allocation_bounds: &RegionMap,
    inlines: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    let env = part.env();
    let func = env.func(stg.func);
    assert!(
        !func.has_extern_definition(),
        "stride analysis of extern stage {}",
        func.name()
    );
    let def = func.stage(stg.stage);

    let inlined_values: Vec<Expr> = def
        .values
        .iter()
        .map(|v| env.inline_expr(v, inlines))
        .collect();
    let inlined_args: Vec<Expr> = def
        .args
        .iter()
        .map(|a| env.inline_expr(a, inlines))
        .collect();

    let mut call_args: Vec<(String, Vec<Expr>)> = Vec::new();
    for e in inlined_values.iter().chain(inlined_args.iter()) {
        e.collect_calls(&mut call_args);
    }
    call_args.push((func.name().to_string(), inlined_args.clone()));

    let all_exprs: Vec<&Expr> = inlined_values.iter().chain(inlined_args.iter()).collect();

    let mut var_strides = BTreeMap::new();
    for dim in &def.dims {
        let dep_vars = find_vars_using_var(&all_exprs, &dim.var);
        let mut total = Value::Known(0);
        for (callee, acc_exprs) in &call_args {
            let alloc_region = allocation_bounds
                .get(callee)
                .or_else(|| part.pipeline_bounds().get(callee))
                .unwrap_or_else(|| panic!("no allocation bounds for {}", callee));
            total = total
                + find_max_access_stride(part, &dep_vars, callee, acc_exprs, alloc_region);
        }
        var_strides.insert(dim.var.clone(), total);
    }
    var_strides
}
