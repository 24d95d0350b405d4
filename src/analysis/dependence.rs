//! Region analysis over the pipeline.
//!
//! [`DependenceAnalysis`] answers the central question of the
//! scheduler: which regions of which producers are needed to compute a
//! given region of a function stage. Queries walk the dependence chain
//! iteratively and never fail; bounds that cannot be resolved come back
//! unknown and are handled by the cost model.

use std::collections::{BTreeSet, VecDeque};

use crate::ir::expr::Expr;
use crate::ir::function::{DimKind, ExternArg, FStage, FuncId, PipelineEnv};
use crate::symbolic::bounds::{
    bounds_of_expr_in_scope, boxes_required, simplify, substitute_param_estimates,
    FuncValueBounds,
};
use crate::symbolic::interval::{merge_region_maps, DimBounds, Interval, Region, RegionMap};
use crate::symbolic::scope::Scope;

/// Bounds for one stage of a function, derived from bounds on the pure
/// dimensions. Pure dimensions pass through; reduction dimensions take
/// their declared domain `[min, min + extent - 1]`.
pub fn get_stage_bounds(
    env: &PipelineEnv,
    f: FuncId,
    stage: u32,
    pure_bounds: &DimBounds,
) -> DimBounds {
    let func = env.func(f);
    let mut bounds = DimBounds::new();
    for dim in &func.stage(stage).dims {
        match &dim.kind {
            DimKind::Pure => {
                let interval = pure_bounds
                    .get(&dim.var)
                    .cloned()
                    .unwrap_or_else(Interval::unbounded);
                bounds.insert(dim.var.clone(), interval);
            }
            DimKind::Reduction { min, extent, .. } => {
                let min = substitute_param_estimates(min, env);
                let extent = substitute_param_estimates(extent, env);
                let max = simplify(&(min.clone() + extent - Expr::Const(1)));
                bounds.insert(dim.var.clone(), Interval::new(min, max));
            }
        }
    }
    bounds
}

/// Bounds for every stage of a function from bounds on its pure
/// dimensions.
pub fn get_all_stage_bounds(
    env: &PipelineEnv,
    f: FuncId,
    pure_bounds: &DimBounds,
) -> Vec<DimBounds> {
    (0..env.func(f).num_stages())
        .map(|s| get_stage_bounds(env, f, s, pure_bounds))
        .collect()
}

/// Region queries over the pipeline dependence structure.
pub struct DependenceAnalysis<'a> {
    env: &'a PipelineEnv,
    func_val_bounds: &'a FuncValueBounds,
}

impl<'a> DependenceAnalysis<'a> {
    /// Create an analysis over an environment.
    pub fn new(env: &'a PipelineEnv, func_val_bounds: &'a FuncValueBounds) -> Self {
        Self {
            env,
            func_val_bounds,
        }
    }

    /// The environment the analysis runs over.
    pub fn env(&self) -> &'a PipelineEnv {
        self.env
    }

    /// Regions of the producers in `prods` required to compute the
    /// region of `f` given by `pure_bounds`, merged over all stages.
    pub fn regions_required_func(
        &self,
        f: FuncId,
        pure_bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_regions_computed: bool,
    ) -> RegionMap {
        let mut regions = RegionMap::new();
        for s in 0..self.env.func(f).num_stages() {
            let bounds = get_stage_bounds(self.env, f, s, pure_bounds);
            let stage_regions =
                self.regions_required(f, s, &bounds, prods, only_regions_computed);
            merge_region_maps(&mut regions, stage_regions);
        }
        regions
    }

    /// Regions of the producers in `prods` required to compute the
    /// region of stage (`f`, `stage`) given by `bounds`. With
    /// `only_regions_computed`, the queried stage's own function is
    /// excluded: the result covers values computed, not storage
    /// allocated.
    pub fn regions_required(
        &self,
        f: FuncId,
        stage: u32,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_regions_computed: bool,
    ) -> RegionMap {
        let mut regions = RegionMap::new();
        let mut queue: VecDeque<(FStage, DimBounds)> = VecDeque::new();
        queue.push_back((FStage::new(f, stage), bounds.clone()));

        while let Some((s, curr_bounds)) = queue.pop_front() {
            let func = self.env.func(s.func);
            let def = func.stage(s.stage);
            let curr_name = func.name().to_string();

            let mut scope: Scope<Interval> = Scope::new();
            for dim in &def.dims {
                let interval = curr_bounds
                    .get(&dim.var)
                    .unwrap_or_else(|| panic!("missing bounds for dimension {}", dim.var));
                let lower = interval
                    .min
                    .as_ref()
                    .map(|e| simplify(&substitute_param_estimates(e, self.env)));
                let upper = interval
                    .max
                    .as_ref()
                    .map(|e| simplify(&substitute_param_estimates(e, self.env)));
                scope.push(
                    dim.var.clone(),
                    Interval {
                        min: lower,
                        max: upper,
                    },
                );
            }

            // Extern definitions are opaque. Function arguments are
            // assumed to be needed in full; buffer arguments likewise
            // but are not pipeline stages and are not traversed.
            if let Some(ext_args) = func.extern_arguments() {
                for arg in ext_args {
                    match arg {
                        ExternArg::Func(prod_name) => {
                            if let Some(prod_id) = self.env.lookup(prod_name) {
                                let rank = self.env.func(prod_id).args().len();
                                let mut prod_reg = RegionMap::new();
                                prod_reg.insert(prod_name.clone(), Region::unbounded(rank));
                                self.merge_and_queue(
                                    &mut queue,
                                    &mut regions,
                                    prod_reg,
                                    prods,
                                    only_regions_computed,
                                    &curr_name,
                                );
                            }
                        }
                        ExternArg::Expr(e) => {
                            let subs = substitute_param_estimates(e, self.env);
                            let arg_regions =
                                boxes_required(&subs, &mut scope, self.func_val_bounds);
                            self.merge_and_queue(
                                &mut queue,
                                &mut regions,
                                arg_regions,
                                prods,
                                only_regions_computed,
                                &curr_name,
                            );
                        }
                        ExternArg::Buffer(buf_name) => {
                            let rank = self
                                .env
                                .input(buf_name)
                                .map(|i| i.rank)
                                .unwrap_or(0);
                            let mut buf_reg = RegionMap::new();
                            buf_reg.insert(buf_name.clone(), Region::unbounded(rank));
                            merge_region_maps(&mut regions, buf_reg);
                        }
                    }
                }
            }

            for val in &def.values {
                let subs_val = substitute_param_estimates(val, self.env);
                let mut curr_regions =
                    boxes_required(&subs_val, &mut scope, self.func_val_bounds);

                // The left-hand-side indices may themselves read
                // producers (a histogram bins on a function value), and
                // they define the region of the stage's own function.
                let mut left_reg = Region::new();
                for arg in &def.args {
                    let subs_arg = substitute_param_estimates(arg, self.env);
                    let arg_regions =
                        boxes_required(&subs_arg, &mut scope, self.func_val_bounds);
                    merge_region_maps(&mut curr_regions, arg_regions);

                    left_reg.push(bounds_of_expr_in_scope(
                        &subs_arg,
                        &mut scope,
                        self.func_val_bounds,
                    ));
                }
                match curr_regions.get_mut(&curr_name) {
                    Some(existing) => existing.merge(&left_reg),
                    None => {
                        curr_regions.insert(curr_name.clone(), left_reg);
                    }
                }

                self.merge_and_queue(
                    &mut queue,
                    &mut regions,
                    curr_regions,
                    prods,
                    only_regions_computed,
                    &curr_name,
                );
            }
        }

        self.concretize(regions)
    }

    /// Merge freshly discovered regions into the result map and enqueue
    /// producers of interest for further traversal.
    fn merge_and_queue(
        &self,
        queue: &mut VecDeque<(FStage, DimBounds)>,
        regions: &mut RegionMap,
        curr_regions: RegionMap,
        prods: &BTreeSet<String>,
        only_regions_computed: bool,
        curr_func_name: &str,
    ) {
        for (name, region) in curr_regions {
            // When querying only the computed values, the traversed
            // stage's own function is not part of the result.
            if !only_regions_computed || name != curr_func_name {
                match regions.get_mut(&name) {
                    Some(existing) => existing.merge(&region),
                    None => {
                        regions.insert(name.clone(), region.clone());
                    }
                }
            }

            if !prods.contains(&name) || name == curr_func_name {
                continue;
            }
            if let Some(prod_id) = self.env.lookup(&name) {
                let prod_func = self.env.func(prod_id);
                assert_eq!(
                    region.rank(),
                    prod_func.args().len(),
                    "region rank mismatch for {}",
                    name
                );
                let mut prod_pure_bounds = DimBounds::new();
                for (arg, interval) in prod_func.args().iter().zip(region.iter()) {
                    prod_pure_bounds.insert(arg.clone(), interval.clone());
                }
                for s in 0..prod_func.num_stages() {
                    let stage_bounds =
                        get_stage_bounds(self.env, prod_id, s, &prod_pure_bounds);
                    queue.push_back((FStage::new(prod_id, s), stage_bounds));
                }
            }
        }
    }

    /// Simplify every box and lower unresolved endpoints to the
    /// producing function's own estimates where available.
    fn concretize(&self, regions: RegionMap) -> RegionMap {
        let mut concrete = RegionMap::new();
        for (name, mut region) in regions {
            region.simplify();
            let in_env = self.env.lookup(&name);
            let mut out = Region::new();
            for (i, interval) in region.iter().enumerate() {
                let mut lower = interval.min.clone();
                let mut upper = interval.max.clone();
                if let Some(id) = in_env {
                    let func = self.env.func(id);
                    let lower_unresolved =
                        lower.as_ref().map_or(true, |e| e.as_const().is_none());
                    if lower_unresolved && i < func.args().len() {
                        if let Some(est) = func.estimate_for(&func.args()[i]) {
                            lower = Some(Expr::Const(est.min));
                        }
                    }
                    let upper_unresolved =
                        upper.as_ref().map_or(true, |e| e.as_const().is_none());
                    if upper_unresolved && i < func.args().len() {
                        if let Some(est) = func.estimate_for(&func.args()[i]) {
                            upper = Some(Expr::Const(est.min + est.extent - 1));
                        }
                    }
                }
                out.push(Interval {
                    min: lower,
                    max: upper,
                });
            }
            concrete.insert(name, out);
        }
        concrete
    }

    /// Regions of producers redundantly computed by neighboring tiles
    /// along `var`: the overlap between the regions required at
    /// `bounds` and at `bounds` shifted by one tile extent along `var`.
    pub fn redundant_regions(
        &self,
        f: FuncId,
        stage: u32,
        var: &str,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_regions_computed: bool,
    ) -> RegionMap {
        let regions = self.regions_required(f, stage, bounds, prods, only_regions_computed);

        let mut shifted_bounds = DimBounds::new();
        for (b_var, interval) in bounds {
            if b_var == var {
                match (&interval.min, &interval.max) {
                    (Some(min), Some(max)) => {
                        let len = max.clone() - min.clone() + Expr::Const(1);
                        shifted_bounds.insert(b_var.clone(), interval.shift(&len));
                    }
                    _ => {
                        shifted_bounds.insert(b_var.clone(), interval.clone());
                    }
                }
            } else {
                shifted_bounds.insert(b_var.clone(), interval.clone());
            }
        }

        let regions_shifted =
            self.regions_required(f, stage, &shifted_bounds, prods, only_regions_computed);

        let mut overlaps = RegionMap::new();
        for (name, region) in &regions {
            // A producer absent from the shifted query contributes no
            // overlap.
            let shifted = match regions_shifted.get(name) {
                Some(r) => r,
                None => continue,
            };
            assert_eq!(region.rank(), shifted.rank());
            let mut overlap = Region::intersection(region, shifted);
            overlap.simplify();
            overlaps.insert(name.clone(), overlap);
        }
        overlaps
    }

    /// Redundantly computed regions along every loop dimension of the
    /// stage, in dimension order.
    pub fn overlap_regions(
        &self,
        f: FuncId,
        stage: u32,
        bounds: &DimBounds,
        prods: &BTreeSet<String>,
        only_regions_computed: bool,
    ) -> Vec<RegionMap> {
        self.env
            .func(f)
            .stage(stage)
            .dims
            .iter()
            .map(|d| {
                self.redundant_regions(f, stage, &d.var, bounds, prods, only_regions_computed)
            })
            .collect()
    }
}

/// Concrete bounding boxes of every function in the pipeline, inferred
/// from the output estimates. Used as the fallback whenever a symbolic
/// region cannot be resolved.
pub fn get_pipeline_bounds(
    analysis: &DependenceAnalysis<'_>,
    outputs: &[FuncId],
) -> RegionMap {
    let env = analysis.env();
    let mut pipeline_bounds = RegionMap::new();

    let prods: BTreeSet<String> = env
        .func_ids()
        .map(|id| env.name(id).to_string())
        .collect();

    for &out in outputs {
        let func = env.func(out);
        let mut pure_bounds = DimBounds::new();
        let mut out_box = Region::new();
        for arg in func.args() {
            match func.estimate_for(arg) {
                Some(est) => {
                    let interval =
                        Interval::new(Expr::Const(est.min), Expr::Const(est.min + est.extent - 1));
                    pure_bounds.insert(arg.clone(), interval.clone());
                    out_box.push(interval);
                }
                None => {
                    pure_bounds.insert(arg.clone(), Interval::unbounded());
                    out_box.push(Interval::unbounded());
                }
            }
        }

        let mut regions = analysis.regions_required_func(out, &pure_bounds, &prods, false);
        regions.entry(func.name().to_string()).or_insert(out_box);
        merge_region_maps(&mut pipeline_bounds, regions);
    }

    pipeline_bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{ElemType, Function, Pipeline};
    use crate::symbolic::bounds::compute_function_value_bounds;

    fn stencil_pipeline() -> Pipeline {
        // g(x, y) = h(x, y) + h(x + 1, y); h(x, y) = x * y.
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

    #[test]
    fn test_regions_required_stencil() {
        let p = stencil_pipeline();
        let env = p.env();
        let fvb = compute_function_value_bounds(&["h".into(), "g".into()], env);
        let analysis = DependenceAnalysis::new(env, &fvb);

        let g = env.lookup("g").unwrap();
        let mut bounds = DimBounds::new();
        bounds.insert("x".into(), Interval::new(0, 31));
        bounds.insert("y".into(), Interval::new(0, 31));
        let prods: BTreeSet<String> = ["g", "h"].iter().map(|s| s.to_string()).collect();

        let regions = analysis.regions_required(g, 0, &bounds, &prods, false);
        let h_reg = &regions["h"];
        // One extra column along x for the shifted read.
        assert_eq!(h_reg.dim(0).as_const_bounds(), Some((0, 32)));
        assert_eq!(h_reg.dim(1).as_const_bounds(), Some((0, 31)));
        // The queried function itself is in the allocated regions.
        assert!(regions.contains_key("g"));

        let computed = analysis.regions_required(g, 0, &bounds, &prods, true);
        assert!(!computed.contains_key("g"));
        assert!(computed.contains_key("h"));
    }

    #[test]
    fn test_region_monotonicity() {
        // Widening the query bounds can only widen every producer box.
        let p = stencil_pipeline();
        let env = p.env();
        let fvb = compute_function_value_bounds(&["h".into(), "g".into()], env);
        let analysis = DependenceAnalysis::new(env, &fvb);
        let g = env.lookup("g").unwrap();
        let prods: BTreeSet<String> = ["g", "h"].iter().map(|s| s.to_string()).collect();

        let mut narrow = DimBounds::new();
        narrow.insert("x".into(), Interval::new(0, 15));
        narrow.insert("y".into(), Interval::new(0, 15));
        let mut wide = DimBounds::new();
        wide.insert("x".into(), Interval::new(0, 63));
        wide.insert("y".into(), Interval::new(0, 63));

        let narrow_regions = analysis.regions_required(g, 0, &narrow, &prods, false);
        let wide_regions = analysis.regions_required(g, 0, &wide, &prods, false);
        for (name, narrow_box) in &narrow_regions {
            let wide_box = &wide_regions[name];
            for (n, w) in narrow_box.iter().zip(wide_box.iter()) {
                let (nl, nh) = n.as_const_bounds().unwrap();
                let (wl, wh) = w.as_const_bounds().unwrap();
                assert!(wl <= nl && wh >= nh);
            }
        }
    }

    #[test]
    fn test_redundant_regions_overlap() {
        let p = stencil_pipeline();
        let env = p.env();
        let fvb = compute_function_value_bounds(&["h".into(), "g".into()], env);
        let analysis = DependenceAnalysis::new(env, &fvb);
        let g = env.lookup("g").unwrap();
        let prods: BTreeSet<String> = ["h"].iter().map(|s| s.to_string()).collect();

        let mut bounds = DimBounds::new();
        bounds.insert("x".into(), Interval::new(0, 31));
        bounds.insert("y".into(), Interval::new(0, 31));

        // Neighboring tiles along x share exactly one column of h.
        let overlaps = analysis.redundant_regions(g, 0, "x", &bounds, &prods, false);
        let h_overlap = &overlaps["h"];
        assert_eq!(h_overlap.dim(0).as_const_bounds(), Some((32, 32)));

        // Along y the tiles are disjoint: the intersection is empty
        // (lower bound above upper bound).
        let overlaps_y = analysis.redundant_regions(g, 0, "y", &bounds, &prods, false);
        let h_overlap_y = &overlaps_y["h"];
        let (lo, hi) = h_overlap_y.dim(1).as_const_bounds().unwrap();
        assert!(lo > hi);
    }

    #[test]
    fn test_pipeline_bounds_cover_producers() {
        let p = stencil_pipeline();
        let env = p.env();
        let fvb = compute_function_value_bounds(&["h".into(), "g".into()], env);
        let analysis = DependenceAnalysis::new(env, &fvb);
        let bounds = get_pipeline_bounds(&analysis, p.outputs());
        assert_eq!(bounds["g"].dim(0).as_const_bounds(), Some((0, 255)));
        assert_eq!(bounds["h"].dim(0).as_const_bounds(), Some((0, 256)));
    }
}
