//! Arithmetic and memory costs of computing function regions.
//!
//! [`RegionCosts`] is the oracle the grouping engine consults: per-point
//! expression costs scaled by region sizes, detailed per-callee load
//! counts, and allocation footprints in bytes. An inlined set folds the
//! cost of inlined producers into their consumers; inlined functions
//! never appear as load keys. Unknown extents poison every result.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::expr::Expr;
use crate::ir::function::{FuncId, PipelineEnv};
use crate::symbolic::interval::{DimBounds, Region, RegionMap};
use crate::symbolic::value::Value;

use crate::analysis::dependence::get_stage_bounds;

/// Arithmetic and memory cost of a computation. Either component may
/// be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cost {
    /// Number of arithmetic operations.
    pub arith: Value,
    /// Bytes moved to and from memory.
    pub memory: Value,
}

impl Cost {
    /// A cost from explicit components.
    pub fn new(arith: Value, memory: Value) -> Self {
        Self { arith, memory }
    }

    /// The zero cost.
    pub fn zero() -> Self {
        Self::new(Value::Known(0), Value::Known(0))
    }

    /// The fully unknown cost.
    pub fn unknown() -> Self {
        Self::new(Value::Unknown, Value::Unknown)
    }

    /// True if either component is unknown.
    pub fn is_unknown(&self) -> bool {
        self.arith.is_unknown() || self.memory.is_unknown()
    }

    /// Component-wise sum.
    pub fn add(&self, other: &Cost) -> Cost {
        Cost::new(self.arith + other.arith, self.memory + other.memory)
    }

    /// Sum of both components.
    pub fn total(&self) -> Value {
        self.arith + self.memory
    }
}

/// Per-callee load counts.
pub type LoadCosts = BTreeMap<String, Value>;

/// Add the counts of `partial` into `result`.
pub fn combine_load_costs(result: &mut LoadCosts, partial: LoadCosts) {
    for (name, count) in partial {
        let entry = result.entry(name).or_insert(Value::Known(0));
        *entry = *entry + count;
    }
}

/// Cost oracle over the pipeline environment.
pub struct RegionCosts<'a> {
    env: &'a PipelineEnv,
}

impl<'a> RegionCosts<'a> {
    /// Create the oracle.
    pub fn new(env: &'a PipelineEnv) -> Self {
        Self { env }
    }

    /// Per-point cost of one stage under an inlined set: arithmetic
    /// operations and bytes loaded to compute one point of the stage's
    /// domain. Extern stages are opaque and cost unknown.
    pub fn stage_point_cost(&self, f: FuncId, stage: u32, inlined: &BTreeSet<String>) -> Cost {
        let func = self.env.func(f);
        if func.has_extern_definition() {
            return Cost::unknown();
        }
        let def = func.stage(stage);
        let mut cost = Cost::zero();
        for e in def.values.iter().chain(def.args.iter()) {
            let inlined_expr = self.env.inline_expr(e, inlined);
            let (arith, mem) = self.expr_cost(&inlined_expr);
            cost.arith = cost.arith + Value::Known(arith);
            cost.memory = cost.memory + Value::Known(mem);
        }
        cost
    }

    /// Arithmetic operation count and bytes loaded by one evaluation of
    /// an expression. Calls to inlined functions must have been
    /// substituted away before this runs.
    fn expr_cost(&self, e: &Expr) -> (i64, i64) {
        let mut arith = 0i64;
        let mut mem = 0i64;
        e.visit(&mut |node| match node {
            Expr::Bin(..) => arith += 1,
            Expr::Call {
                name, value_index, ..
            } => {
                if let Some(id) = self.env.lookup(name) {
                    mem += self.env.func(id).output_types()[*value_index].bytes();
                } else if let Some(input) = self.env.input(name) {
                    mem += input.ty.bytes();
                }
            }
            _ => {}
        });
        (arith, mem)
    }

    /// Per-point load counts of one stage under an inlined set, keyed
    /// by callee.
    fn stage_point_loads(&self, f: FuncId, stage: u32, inlined: &BTreeSet<String>) -> LoadCosts {
        let func = self.env.func(f);
        let mut loads = LoadCosts::new();
        if func.has_extern_definition() {
            return loads;
        }
        let def = func.stage(stage);
        for e in def.values.iter().chain(def.args.iter()) {
            let inlined_expr = self.env.inline_expr(e, inlined);
            inlined_expr.visit(&mut |node| {
                if let Expr::Call { name, .. } = node {
                    assert!(
                        !inlined.contains(name),
                        "inlined function {} survived substitution",
                        name
                    );
                    let entry = loads.entry(name.clone()).or_insert(Value::Known(0));
                    *entry = *entry + Value::Known(1);
                }
            });
        }
        loads
    }

    /// Number of points in a stage's domain given its loop bounds.
    fn stage_domain_size(&self, f: FuncId, stage: u32, bounds: &DimBounds) -> Value {
        let def = self.env.func(f).stage(stage);
        def.dims.iter().fold(Value::Known(1), |acc, d| {
            let extent = bounds
                .get(&d.var)
                .map(|i| i.extent())
                .unwrap_or(Value::Unknown);
            acc * extent
        })
    }

    /// Cost of computing one stage over the given loop bounds.
    pub fn stage_region_cost(
        &self,
        f: FuncId,
        stage: u32,
        bounds: &DimBounds,
        inlined: &BTreeSet<String>,
    ) -> Cost {
        let size = self.stage_domain_size(f, stage, bounds);
        let point = self.stage_point_cost(f, stage, inlined);
        Cost::new(point.arith * size, point.memory * size)
    }

    /// Cost of computing a whole region of a function, over all stages.
    pub fn region_cost(&self, f: FuncId, region: &Region, inlined: &BTreeSet<String>) -> Cost {
        let func = self.env.func(f);
        assert_eq!(region.rank(), func.args().len());
        let mut pure_bounds = DimBounds::new();
        for (arg, interval) in func.args().iter().zip(region.iter()) {
            pure_bounds.insert(arg.clone(), interval.clone());
        }
        let mut total = Cost::zero();
        for s in 0..func.num_stages() {
            let bounds = get_stage_bounds(self.env, f, s, &pure_bounds);
            total = total.add(&self.stage_region_cost(f, s, &bounds, inlined));
        }
        total
    }

    /// Cost of computing every function region in a map. Inlined
    /// functions and pipeline inputs carry no cost of their own.
    pub fn region_cost_map(&self, regions: &RegionMap, inlined: &BTreeSet<String>) -> Cost {
        let mut total = Cost::zero();
        for (name, region) in regions {
            if inlined.contains(name) {
                continue;
            }
            if let Some(id) = self.env.lookup(name) {
                total = total.add(&self.region_cost(id, region, inlined));
            }
        }
        total
    }

    /// Load counts per callee for one stage over the given bounds.
    pub fn stage_detailed_load_costs(
        &self,
        f: FuncId,
        stage: u32,
        bounds: &DimBounds,
        inlined: &BTreeSet<String>,
    ) -> LoadCosts {
        let size = self.stage_domain_size(f, stage, bounds);
        self.stage_point_loads(f, stage, inlined)
            .into_iter()
            .map(|(name, count)| (name, count * size))
            .collect()
    }

    /// Load counts per callee for every function region in a map.
    pub fn detailed_load_costs_map(
        &self,
        regions: &RegionMap,
        inlined: &BTreeSet<String>,
    ) -> LoadCosts {
        let mut loads = LoadCosts::new();
        for (name, region) in regions {
            if inlined.contains(name) {
                continue;
            }
            let id = match self.env.lookup(name) {
                Some(id) => id,
                None => continue,
            };
            let func = self.env.func(id);
            assert_eq!(region.rank(), func.args().len());
            let mut pure_bounds = DimBounds::new();
            for (arg, interval) in func.args().iter().zip(region.iter()) {
                pure_bounds.insert(arg.clone(), interval.clone());
            }
            for s in 0..func.num_stages() {
                let bounds = get_stage_bounds(self.env, id, s, &pure_bounds);
                combine_load_costs(
                    &mut loads,
                    self.stage_detailed_load_costs(id, s, &bounds, inlined),
                );
            }
        }
        loads
    }

    /// Allocation footprint of a function region, in bytes.
    pub fn region_size(&self, f: FuncId, region: &Region) -> Value {
        region.size() * Value::Known(self.env.func(f).bytes_per_point())
    }

    /// Allocation footprint of an input region, in bytes.
    pub fn input_region_size(&self, name: &str, region: &Region) -> Value {
        match self.env.input(name) {
            Some(input) => region.size() * Value::Known(input.ty.bytes()),
            None => Value::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{ElemType, Function, Pipeline};
    use crate::symbolic::interval::Interval;

    fn stencil_pipeline() -> Pipeline {
        let h = Function::new("h", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") * Expr::var("y"));
        let g = Function::new("g", &["x", "y"], ElemType::Int32)
            .define(
                Expr::call("h", vec![Expr::var("x"), Expr::var("y")])
                    + Expr::call("h", vec![Expr::var("x") + Expr::Const(1), Expr::var("y")]),
            )
            .estimate("x", 0, 256)
            .estimate("y", 0, 256);
        Pipeline::new(vec![h, g], vec![], &["g"]).unwrap()
    }

    fn square_bounds(extent: i64) -> DimBounds {
        let mut b = DimBounds::new();
        b.insert("x".into(), Interval::new(0, extent - 1));
        b.insert("y".into(), Interval::new(0, extent - 1));
        b
    }

    #[test]
    fn test_stage_region_cost_scales_with_size() {
        let p = stencil_pipeline();
        let costs = RegionCosts::new(p.env());
        let g = p.env().lookup("g").unwrap();
        let inlined = BTreeSet::new();

        let small = costs.stage_region_cost(g, 0, &square_bounds(16), &inlined);
        let large = costs.stage_region_cost(g, 0, &square_bounds(32), &inlined);
        let (sa, la) = (small.arith.known().unwrap(), large.arith.known().unwrap());
        assert_eq!(la, 4 * sa);
        assert!(small.memory.known().unwrap() > 0);
    }

    #[test]
    fn test_inlining_folds_producer_cost() {
        let p = stencil_pipeline();
        let costs = RegionCosts::new(p.env());
        let g = p.env().lookup("g").unwrap();

        let no_inline = costs.stage_point_cost(g, 0, &BTreeSet::new());
        let mut inl = BTreeSet::new();
        inl.insert("h".to_string());
        let with_inline = costs.stage_point_cost(g, 0, &inl);

        // Inlining h replaces two 4-byte loads with two multiplies.
        assert!(with_inline.arith.known().unwrap() > no_inline.arith.known().unwrap());
        assert!(with_inline.memory.known().unwrap() < no_inline.memory.known().unwrap());
    }

    #[test]
    fn test_detailed_loads_exclude_inlined() {
        let p = stencil_pipeline();
        let costs = RegionCosts::new(p.env());
        let g = p.env().lookup("g").unwrap();

        let plain = costs.stage_detailed_load_costs(g, 0, &square_bounds(16), &BTreeSet::new());
        assert_eq!(plain["h"], Value::Known(2 * 16 * 16));

        let mut inl = BTreeSet::new();
        inl.insert("h".to_string());
        let folded = costs.stage_detailed_load_costs(g, 0, &square_bounds(16), &inl);
        assert!(!folded.contains_key("h"));
    }

    #[test]
    fn test_region_size_in_bytes() {
        let p = stencil_pipeline();
        let costs = RegionCosts::new(p.env());
        let h = p.env().lookup("h").unwrap();
        let region = Region::from_intervals(vec![Interval::new(0, 15), Interval::new(0, 15)]);
        assert_eq!(costs.region_size(h, &region), Value::Known(16 * 16 * 4));
    }

    #[test]
    fn test_unknown_bounds_poison_cost() {
        let p = stencil_pipeline();
        let costs = RegionCosts::new(p.env());
        let g = p.env().lookup("g").unwrap();
        let mut bounds = square_bounds(16);
        bounds.insert("y".into(), Interval::unbounded());
        let c = costs.stage_region_cost(g, 0, &bounds, &BTreeSet::new());
        assert!(c.is_unknown());
    }
}
