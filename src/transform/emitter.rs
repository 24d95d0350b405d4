//! Schedule emission.
//!
//! Lowers the final grouping to a sequence of schedule directives:
//! inline members, tile the group output, vectorize, parallelize, and
//! compute interior members at the tile loop. Every directive both
//! mutates the target stage's schedule record and appends one
//! transcript line.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::ir::function::{DimKind, FStage, PipelineEnv};
use crate::ir::schedule::{Directive, DirectiveOp, StageSchedule};
use crate::machine::Target;
use crate::symbolic::interval::{DimBounds, RegionMap};
use crate::symbolic::value::Value;
use crate::transform::grouping::{bounds_to_estimates, Group, Partitioner};
use crate::transform::locality::analyze_spatial_locality;

/// A scheduling handle on one stage: applies directives to the stage's
/// schedule record and records them in the transcript.
struct StageHandle<'a> {
    func: String,
    stage: u32,
    sched: &'a mut StageSchedule,
}

impl<'a> StageHandle<'a> {
    fn emit(&mut self, op: DirectiveOp, transcript: &mut Vec<Directive>) {
        self.sched.apply(&op);
        transcript.push(Directive::new(self.func.clone(), self.stage, op));
    }
}

/// Split a dimension, updating the estimate map: the inner loop gets
/// the factor, the outer loop the rounded-up quotient.
fn split_dim(
    handle: &mut StageHandle<'_>,
    var: &str,
    factor: i64,
    in_suffix: &str,
    out_suffix: &str,
    estimates: &mut BTreeMap<String, Value>,
    transcript: &mut Vec<Directive>,
) -> (String, String) {
    let inner = format!("{}{}", var, in_suffix);
    let outer = format!("{}{}", var, out_suffix);
    handle.emit(
        DirectiveOp::Split {
            var: var.to_string(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor,
        },
        transcript,
    );
    let est = estimates
        .get(var)
        .copied()
        .unwrap_or_else(|| panic!("no estimate for split dimension {}", var));
    assert!(!est.is_unknown(), "splitting dimension with unknown extent");
    estimates.insert(inner.clone(), Value::Known(factor));
    estimates.insert(outer.clone(), est.div_ceil_by(factor));
    estimates.remove(var);
    (inner, outer)
}

/// Reorder loops so the dimension with the smallest access stride runs
/// innermost. Pure dimensions may be placed freely; reduction
/// dimensions keep their relative order, so only the first unplaced one
/// competes with the pure candidate at each step.
fn reorder_dims(
    handle: &mut StageHandle<'_>,
    strides: &BTreeMap<String, Value>,
    transcript: &mut Vec<Directive>,
) {
    let mut remaining = strides.clone();
    let mut order: Vec<String> = Vec::new();

    while !remaining.is_empty() {
        let stride_of = |v: Value| v.known().unwrap_or(i64::MAX);

        let mut min_pure_stride = i64::MAX;
        let mut min_pure_var: Option<String> = None;
        for d in &handle.sched.dims {
            if d.is_rvar || !remaining.contains_key(&d.var) {
                continue;
            }
            let s = stride_of(remaining[&d.var]);
            if s < min_pure_stride {
                min_pure_stride = s;
                min_pure_var = Some(d.var.clone());
            }
        }

        let mut min_impure_stride = i64::MAX;
        let mut min_impure_var: Option<String> = None;
        for d in &handle.sched.dims {
            if !d.is_rvar || !remaining.contains_key(&d.var) {
                continue;
            }
            min_impure_stride = stride_of(remaining[&d.var]);
            min_impure_var = Some(d.var.clone());
            break;
        }

        let picked = if min_impure_stride < min_pure_stride {
            min_impure_var
        } else {
            min_pure_var
        }
        .expect("some dimension remains to be ordered");
        remaining.remove(&picked);
        order.push(picked);
    }

    handle.emit(DirectiveOp::Reorder { vars: order }, transcript);
}

/// Vectorize the innermost dimension whose extent covers the natural
/// vector width of the widest output type. Reduction dimensions only
/// qualify when their reduction permits reordering.
fn vectorize_stage(
    handle: &mut StageHandle<'_>,
    env: &PipelineEnv,
    stg: &FStage,
    target: &Target,
    rvar_info: &mut BTreeMap<String, bool>,
    estimates: &mut BTreeMap<String, Value>,
    transcript: &mut Vec<Directive>,
) {
    let func = env.func(stg.func);
    let vec_len = func
        .output_types()
        .iter()
        .map(|t| target.natural_vector_size(*t))
        .max()
        .unwrap_or(0);

    let mut vec_dim: Option<(usize, String)> = None;
    for (d, dim) in handle.sched.dims.iter().enumerate() {
        let can_vectorize = rvar_info.get(&dim.var).copied().unwrap_or(true);
        if let Some(est) = estimates.get(&dim.var).and_then(|v| v.known()) {
            if can_vectorize && est >= vec_len {
                vec_dim = Some((d, dim.var.clone()));
                break;
            }
        }
    }

    if let Some((index, var)) = vec_dim {
        let rvar_parallel = rvar_info.get(&var).copied();
        let (inner, outer) =
            split_dim(handle, &var, vec_len, "_vi", "_vo", estimates, transcript);
        handle.emit(DirectiveOp::Vectorize { var: inner.clone() }, transcript);

        if let Some(parallel) = rvar_parallel {
            rvar_info.remove(&var);
            rvar_info.insert(inner, parallel);
            rvar_info.insert(outer, parallel);
        }

        if index > 0 {
            warn!(
                "vectorized dimension {} of {} is not the innermost storage dimension",
                var, handle.func
            );
        }
    }
}

/// Reduction-dimension bookkeeping for a stage: variable name to the
/// parallelizable flag of its reduction.
fn rvar_flags(env: &PipelineEnv, stg: &FStage) -> BTreeMap<String, bool> {
    env.func(stg.func)
        .stage(stg.stage)
        .dims
        .iter()
        .filter_map(|d| match &d.kind {
            DimKind::Pure => None,
            DimKind::Reduction { parallelizable, .. } => {
                Some((d.var.clone(), *parallelizable))
            }
        })
        .collect()
}

/// Emit the schedule of one group.
#[allow(clippy::too_many_arguments)]
fn generate_group_cpu_schedule(
    part: &Partitioner<'_>,
    g: &Group,
    target: &Target,
    group_loop_bounds: &BTreeMap<FStage, DimBounds>,
    group_storage_bounds: &RegionMap,
    inlines: &BTreeSet<String>,
    schedules: &mut BTreeMap<FStage, StageSchedule>,
    transcript: &mut Vec<Directive>,
) {
    let env = part.env();
    let g_out = env.func(g.output.func);
    let out_name = g_out.name().to_string();

    let stg_bounds = part.get_bounds(&g.output);
    let mut stg_estimates = bounds_to_estimates(&stg_bounds);

    let tile_inner_var = {
        let sched = schedules
            .get_mut(&g.output)
            .expect("output stage has a schedule");
        let mut handle = StageHandle {
            func: out_name.clone(),
            stage: g.output.stage,
            sched,
        };

        // Updates are scheduled in place inside the pure definition's
        // storage; only the pure stage anchors the group at root.
        if g.output.stage == 0 {
            handle.emit(DirectiveOp::ComputeRoot, transcript);
        }

        if g_out.has_extern_definition() {
            assert_eq!(g.members.len(), 1, "extern stage absorbed members");
            return;
        }

        let mut rvar_info = rvar_flags(env, &g.output);

        let strides = analyze_spatial_locality(part, &g.output, group_storage_bounds, inlines);
        reorder_dims(&mut handle, &strides, transcript);

        // Tile the output loop nest per the group's configuration.
        let dim_vars: Vec<String> =
            handle.sched.dims.iter().map(|d| d.var.clone()).collect();
        let mut inner_dims: Vec<String> = Vec::new();
        let mut outer_dims: Vec<String> = Vec::new();
        for var in dim_vars {
            let estimate = stg_estimates.get(&var).and_then(|v| v.known());
            let tiled = g
                .tile_sizes
                .get(&var)
                .copied()
                .filter(|t| estimate.map_or(false, |e| e > *t));
            match tiled {
                Some(tile_size) if tile_size > 1 => {
                    let is_rvar = rvar_info.contains_key(&var);
                    let parallel = rvar_info.get(&var).copied();
                    let (inner, outer) = split_dim(
                        &mut handle,
                        &var,
                        tile_size,
                        "_i",
                        "_o",
                        &mut stg_estimates,
                        transcript,
                    );
                    inner_dims.push(inner.clone());
                    outer_dims.push(outer.clone());
                    if is_rvar {
                        let parallel = parallel.expect("rvar has a flag");
                        rvar_info.remove(&var);
                        rvar_info.insert(inner, parallel);
                        rvar_info.insert(outer, parallel);
                    }
                }
                Some(_) => outer_dims.push(var),
                None => inner_dims.push(var),
            }
        }

        if !outer_dims.is_empty() {
            let mut ordering = inner_dims.clone();
            ordering.extend(outer_dims.iter().cloned());
            handle.emit(DirectiveOp::Reorder { vars: ordering }, transcript);
        }

        vectorize_stage(
            &mut handle,
            env,
            &g.output,
            target,
            &mut rvar_info,
            &mut stg_estimates,
            transcript,
        );

        // Parallelize from the outermost loop inward until the machine
        // is saturated. Serial reductions are pushed inside the loops
        // being parallelized.
        let mut def_par: i64 = 1;
        let mut seq_var: Option<String> = None;
        let dims_snapshot: Vec<(String, bool)> = handle
            .sched
            .dims
            .iter()
            .map(|d| (d.var.clone(), d.is_rvar))
            .collect();
        for (var, is_rvar) in dims_snapshot.iter().rev() {
            if *is_rvar && !rvar_info.get(var).copied().unwrap_or(false) {
                if seq_var.is_none() {
                    seq_var = Some(var.clone());
                }
                continue;
            }
            if def_par >= part.machine().parallelism {
                break;
            }
            match stg_estimates.get(var).and_then(|v| v.known()) {
                Some(est) => {
                    if let Some(seq) = &seq_var {
                        handle.emit(
                            DirectiveOp::Reorder {
                                vars: vec![seq.clone(), var.clone()],
                            },
                            transcript,
                        );
                    }
                    handle.emit(DirectiveOp::Parallel { var: var.clone() }, transcript);
                    def_par = def_par.saturating_mul(est);
                }
                None => break,
            }
        }
        if def_par < part.machine().parallelism {
            warn!("insufficient parallelism for {}", out_name);
        }

        // The loop level interior members are computed at: the
        // innermost of the outer tile loops.
        if outer_dims.is_empty() {
            None
        } else {
            let idx = handle.sched.dims.len() - outer_dims.len();
            Some(handle.sched.dims[idx].var.clone())
        }
    };

    schedule_group_members(
        part,
        g,
        target,
        group_loop_bounds,
        group_storage_bounds,
        inlines,
        schedules,
        transcript,
        &out_name,
        tile_inner_var,
    );
}

/// Emit schedules for the non-inlined interior members of a group.
#[allow(clippy::too_many_arguments)]
fn schedule_group_members(
    part: &Partitioner<'_>,
    g: &Group,
    target: &Target,
    group_loop_bounds: &BTreeMap<FStage, DimBounds>,
    group_storage_bounds: &RegionMap,
    inlines: &BTreeSet<String>,
    schedules: &mut BTreeMap<FStage, StageSchedule>,
    transcript: &mut Vec<Directive>,
    out_name: &str,
    tile_inner_var: Option<String>,
) {
    let env = part.env();
    for mem in &g.members {
        let mem_name = env.name(mem.func).to_string();
        if g.inlined.contains(&mem_name) || mem_name == out_name {
            continue;
        }

        let mem_bounds = match group_loop_bounds.get(mem) {
            Some(b) => b,
            None => continue,
        };
        let mut mem_estimates = bounds_to_estimates(mem_bounds);
        let mut mem_rvar_info = rvar_flags(env, mem);

        let sched = schedules
            .get_mut(mem)
            .expect("member stage has a schedule");
        let mut handle = StageHandle {
            func: mem_name.clone(),
            stage: mem.stage,
            sched,
        };

        if mem.stage == 0 {
            match &tile_inner_var {
                Some(tile_var) => {
                    handle.emit(
                        DirectiveOp::ComputeAt {
                            func: out_name.to_string(),
                            var: tile_var.clone(),
                        },
                        transcript,
                    );
                }
                None => {
                    warn!(
                        "degenerate tiling of {}: no dimensions are tiled, computing {} at root",
                        out_name, mem_name
                    );
                    handle.emit(DirectiveOp::ComputeRoot, transcript);
                }
            }
        }

        let strides = analyze_spatial_locality(part, mem, group_storage_bounds, inlines);
        reorder_dims(&mut handle, &strides, transcript);

        vectorize_stage(
            &mut handle,
            env,
            mem,
            target,
            &mut mem_rvar_info,
            &mut mem_estimates,
            transcript,
        );
    }
}

/// Lower the final grouping to directives, mutating every scheduled
/// stage's record, and return the transcript.
pub fn generate_cpu_schedule(
    part: &Partitioner<'_>,
    target: &Target,
    schedules: &mut BTreeMap<FStage, StageSchedule>,
) -> String {
    let env = part.env();
    let loop_bounds = part.group_loop_bounds();
    let storage_bounds = part.group_storage_bounds();

    let mut transcript: Vec<Directive> = Vec::new();

    // Inlined functions first, in name order.
    let mut inlines: BTreeSet<String> = BTreeSet::new();
    for g in part.groups().values() {
        for name in &g.inlined {
            inlines.insert(name.clone());
        }
    }
    for name in &inlines {
        let id = env.lookup(name).expect("inlined function is in environment");
        let stg = FStage::new(id, 0);
        let sched = schedules.get_mut(&stg).expect("stage has a schedule");
        let mut handle = StageHandle {
            func: name.clone(),
            stage: 0,
            sched,
        };
        handle.emit(DirectiveOp::ComputeInline, &mut transcript);
    }

    let empty_loop_bounds: BTreeMap<FStage, DimBounds> = BTreeMap::new();
    let empty_storage_bounds = RegionMap::new();
    for (out, g) in part.groups() {
        generate_group_cpu_schedule(
            part,
            g,
            target,
            loop_bounds.get(out).unwrap_or(&empty_loop_bounds),
            storage_bounds.get(out).unwrap_or(&empty_storage_bounds),
            &inlines,
            schedules,
            &mut transcript,
        );
    }

    render_transcript(&transcript)
}

/// Render directives as the user-facing transcript, one per line.
pub fn render_transcript(directives: &[Directive]) -> String {
    let mut out = String::new();
    for d in directives {
        out.push_str(&d.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{ElemType, Function, RVar};
    use crate::ir::schedule::StageSchedule;
    use crate::ir::Expr;

    fn reduction_schedule() -> StageSchedule {
        let f = Function::new("s", &["x"], ElemType::Int32)
            .define(Expr::Const(0))
            .update(
                vec![Expr::var("x")],
                Expr::call("s", vec![Expr::var("x")]) + Expr::Const(1),
                vec![RVar::new("r", 0, 64)],
            );
        StageSchedule::from_definition(f.stage(1))
    }

    #[test]
    fn test_reorder_prefers_small_stride_pure_dim() {
        let mut sched = reduction_schedule();
        let mut handle = StageHandle {
            func: "s".to_string(),
            stage: 1,
            sched: &mut sched,
        };
        let mut transcript = Vec::new();
        // x strides less than r; x must come innermost even though r is
        // declared first.
        let mut strides = BTreeMap::new();
        strides.insert("x".to_string(), Value::Known(4));
        strides.insert("r".to_string(), Value::Known(4096));
        reorder_dims(&mut handle, &strides, &mut transcript);
        let vars: Vec<&str> = sched.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(vars, vec!["x", "r"]);
    }

    #[test]
    fn test_reorder_keeps_cheap_reduction_inner() {
        let mut sched = reduction_schedule();
        let mut handle = StageHandle {
            func: "s".to_string(),
            stage: 1,
            sched: &mut sched,
        };
        let mut transcript = Vec::new();
        // The reduction strides less than the pure dim: it stays inner.
        let mut strides = BTreeMap::new();
        strides.insert("x".to_string(), Value::Known(4096));
        strides.insert("r".to_string(), Value::Known(4));
        reorder_dims(&mut handle, &strides, &mut transcript);
        let vars: Vec<&str> = sched.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(vars, vec!["r", "x"]);
    }

    #[test]
    fn test_split_dim_updates_estimates() {
        let f = Function::new("f", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") + Expr::var("y"));
        let mut sched = StageSchedule::from_definition(f.stage(0));
        let mut handle = StageHandle {
            func: "f".to_string(),
            stage: 0,
            sched: &mut sched,
        };
        let mut transcript = Vec::new();
        let mut estimates = BTreeMap::new();
        estimates.insert("x".to_string(), Value::Known(100));
        estimates.insert("y".to_string(), Value::Known(100));

        let (inner, outer) =
            split_dim(&mut handle, "x", 8, "_i", "_o", &mut estimates, &mut transcript);
        assert_eq!(inner, "x_i");
        assert_eq!(outer, "x_o");
        assert_eq!(estimates["x_i"], Value::Known(8));
        assert_eq!(estimates["x_o"], Value::Known(13));
        assert!(!estimates.contains_key("x"));
        assert_eq!(transcript.len(), 1);
    }
}
