//! Integration tests for the auto scheduler.

use std::collections::BTreeSet;

use pipeopt::analysis::{
    get_pipeline_bounds, realization_order, DependenceAnalysis, RegionCosts,
};
use pipeopt::ir::{DirectiveOp, ExternArg, LoopLevel};
use pipeopt::prelude::*;
use pipeopt::symbolic::compute_function_value_bounds;
use pipeopt::symbolic::DimBounds;

fn schedule(pipeline: &mut Pipeline) -> String {
    pipeopt::auto_schedule(pipeline, &Target::default(), &MachineParams::default())
        .expect("scheduling failed")
}

fn directives(transcript: &str) -> Vec<Directive> {
    Directive::parse_transcript(transcript).expect("transcript must re-parse")
}

/// Run the partitioner by hand and return (ungrouped, grouped) total
/// costs.
fn partition_costs(pipeline: &Pipeline) -> (i64, i64) {
    let env = pipeline.env();
    let order = realization_order(env);
    let fvb = compute_function_value_bounds(&order, env);
    let analysis = DependenceAnalysis::new(env, &fvb);
    let bounds = get_pipeline_bounds(&analysis, pipeline.outputs());
    let machine = MachineParams::default();
    let costs = RegionCosts::new(env);
    let mut part = Partitioner::new(&bounds, &machine, &analysis, &costs, pipeline.outputs());
    part.initialize_groups();
    let ungrouped = part.pipeline_cost().total().known().unwrap();
    part.group(Level::Inline);
    part.clear_grouping_cache();
    part.group(Level::FastMem);
    let grouped = part.pipeline_cost().total().known().unwrap();
    (ungrouped, grouped)
}

#[test]
fn test_single_stage_pointwise() {
    let f = Function::new("f", &["x", "y"], ElemType::Int32)
        .define(Expr::var("x") + Expr::var("y"))
        .estimate("x", 0, 1024)
        .estimate("y", 0, 1024);
    let mut p = Pipeline::new(vec![f], vec![], &["f"]).unwrap();
    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);

    assert!(dirs
        .iter()
        .any(|d| d.func == "f" && d.op == DirectiveOp::ComputeRoot));

    // The innermost dimension is split by the natural vector width and
    // the inner split is vectorized.
    let split = dirs
        .iter()
        .find_map(|d| match &d.op {
            DirectiveOp::Split { var, inner, factor, .. } if var == "x" => {
                Some((inner.clone(), *factor))
            }
            _ => None,
        })
        .expect("expected a split of x");
    assert_eq!(split.1, 4); // 128-bit vectors of i32
    assert!(dirs.iter().any(|d| matches!(
        &d.op,
        DirectiveOp::Vectorize { var } if *var == split.0
    )));

    // The outermost loop is parallelized.
    assert!(dirs
        .iter()
        .any(|d| matches!(&d.op, DirectiveOp::Parallel { var } if var == "y")));
}

#[test]
fn test_producer_consumer_with_reuse() {
    let h = Function::new("h", &["x", "y"], ElemType::Int32)
        .define(Expr::var("x") * Expr::var("y"));
    let g = Function::new("g", &["x", "y"], ElemType::Int32)
        .define(
            Expr::call("h", vec![Expr::var("x"), Expr::var("y")])
                + Expr::call("h", vec![Expr::var("x") + Expr::Const(1), Expr::var("y")]),
        )
        .estimate("x", 0, 256)
        .estimate("y", 0, 256);
    let p = Pipeline::new(vec![h, g], vec![], &["g"]).unwrap();

    let (ungrouped, grouped) = partition_costs(&p);
    assert!(
        grouped < ungrouped,
        "grouping must beat separate computation ({} vs {})",
        grouped,
        ungrouped
    );

    let mut p = p;
    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);
    // h is either inlined into g or computed inside g's tile.
    let absorbed = dirs.iter().any(|d| {
        d.func == "h"
            && matches!(
                &d.op,
                DirectiveOp::ComputeInline | DirectiveOp::ComputeAt { .. }
            )
    });
    assert!(absorbed, "h must be absorbed into g:\n{}", transcript);
}

#[test]
fn test_two_stage_reduction() {
    // s(x) = 0; s(x) += in(x, r) over r in [0, N).
    let s = Function::new("s", &["x"], ElemType::Int32)
        .define(Expr::Const(0))
        .update(
            vec![Expr::var("x")],
            Expr::call("s", vec![Expr::var("x")])
                + Expr::call("in", vec![Expr::var("x"), Expr::var("r")]),
            vec![RVar::new("r", 0, Expr::var("N"))],
        )
        .estimate("x", 0, 1024);
    let mut p = Pipeline::new(
        vec![s],
        vec![InputBuffer::new("in", ElemType::Int32, 2)],
        &["s"],
    )
    .unwrap();
    p.set_param_estimate("N", 128);

    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);

    // The reduction variable is never tiled, parallelized, or
    // vectorized: the update operator was not declared reorderable.
    for d in &dirs {
        match &d.op {
            DirectiveOp::Split { var, .. } => assert_ne!(var, "r"),
            DirectiveOp::Parallel { var } => assert_ne!(var, "r"),
            DirectiveOp::Vectorize { var } => assert_ne!(var, "r"),
            _ => {}
        }
    }

    // The pure dimension of the update is parallelized.
    let update_parallel = dirs.iter().any(|d| {
        d.func == "s"
            && d.stage == 1
            && matches!(&d.op, DirectiveOp::Parallel { var } if var.starts_with('x'))
    });
    assert!(update_parallel, "update must parallelize over x:\n{}", transcript);
}

#[test]
fn test_transpose_chain_identity_order() {
    let f = Function::new("f", &["x", "y"], ElemType::Int32)
        .define(Expr::call("in", vec![Expr::var("x"), Expr::var("y")]));
    let g = Function::new("g", &["x", "y"], ElemType::Int32)
        .define(Expr::call("f", vec![Expr::var("y"), Expr::var("x")]));
    let h = Function::new("h", &["x", "y"], ElemType::Int32)
        .define(Expr::call("g", vec![Expr::var("y"), Expr::var("x")]))
        .estimate("x", 0, 512)
        .estimate("y", 0, 512);
    let mut p = Pipeline::new(
        vec![f, g, h],
        vec![InputBuffer::new("in", ElemType::Int32, 2)],
        &["h"],
    )
    .unwrap();

    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);

    // The transpose is inlined away.
    assert!(dirs
        .iter()
        .any(|d| d.func == "g" && d.op == DirectiveOp::ComputeInline));

    // Through the double transpose, h accesses storage in identity
    // order: x stays the innermost loop.
    let h_reorder = dirs
        .iter()
        .find_map(|d| match &d.op {
            DirectiveOp::Reorder { vars } if d.func == "h" => Some(vars.clone()),
            _ => None,
        })
        .expect("h must be reordered");
    assert_eq!(h_reorder[0], "x");
}

#[test]
fn test_extern_producer_boundary() {
    let f = Function::new_extern(
        "f",
        &["x", "y"],
        ElemType::Float32,
        vec![ExternArg::Buffer("in".to_string())],
    )
    .estimate("x", 0, 256)
    .estimate("y", 0, 256);
    let g = Function::new("g", &["x", "y"], ElemType::Float32)
        .define(Expr::call("f", vec![Expr::var("x"), Expr::var("y")]) * Expr::Const(2))
        .estimate("x", 0, 256)
        .estimate("y", 0, 256);
    let p = Pipeline::new(
        vec![f, g],
        vec![InputBuffer::new("in", ElemType::Float32, 2)],
        &["g"],
    )
    .unwrap();

    // The extern producer's region resolves to its declared estimates.
    let env = p.env();
    let order = realization_order(env);
    let fvb = compute_function_value_bounds(&order, env);
    let analysis = DependenceAnalysis::new(env, &fvb);
    let g_id = env.lookup("g").unwrap();
    let mut bounds = DimBounds::new();
    bounds.insert("x".into(), Interval::new(0, 255));
    bounds.insert("y".into(), Interval::new(0, 255));
    let prods: BTreeSet<String> = ["f", "g"].iter().map(|s| s.to_string()).collect();
    let regions = analysis.regions_required(g_id, 0, &bounds, &prods, false);
    assert_eq!(regions["f"].dim(0).as_const_bounds(), Some((0, 255)));
    assert_eq!(regions["f"].dim(1).as_const_bounds(), Some((0, 255)));

    // No merge crosses the extern boundary.
    let mut p = p;
    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);
    assert!(dirs
        .iter()
        .all(|d| !matches!(&d.op, DirectiveOp::ComputeInline | DirectiveOp::ComputeAt { .. })));
    assert!(dirs
        .iter()
        .any(|d| d.func == "f" && d.op == DirectiveOp::ComputeRoot));
    assert!(dirs
        .iter()
        .any(|d| d.func == "g" && d.op == DirectiveOp::ComputeRoot));
}

#[test]
fn test_missing_estimate_falls_back_to_root() {
    let h = Function::new("h", &["x", "y"], ElemType::Int32)
        .define(Expr::var("x") * Expr::var("y"));
    let g = Function::new("g", &["x", "y"], ElemType::Int32)
        .define(Expr::call("h", vec![Expr::var("x"), Expr::var("y")]))
        .estimate("x", 0, 256); // y is missing
    let mut p = Pipeline::new(vec![h, g], vec![], &["g"]).unwrap();

    let transcript = schedule(&mut p);
    assert!(transcript.is_empty());
    for stg in p.env().all_stages() {
        assert_eq!(p.schedule(stg).compute_level, LoopLevel::Root);
        assert_eq!(p.schedule(stg).store_level, LoopLevel::Root);
    }
}

#[test]
fn test_separable_blur_computes_producer_at_tile() {
    let in_call = |x: Expr, y: Expr| Expr::call("in", vec![x, y]);
    let blur_x = Function::new("blur_x", &["x", "y"], ElemType::UInt16).define(
        (in_call(Expr::var("x"), Expr::var("y"))
            + in_call(Expr::var("x") + Expr::Const(1), Expr::var("y"))
            + in_call(Expr::var("x") + Expr::Const(2), Expr::var("y")))
        .div(Expr::Const(3)),
    );
    let bx = |x: Expr, y: Expr| Expr::call("blur_x", vec![x, y]);
    let blur_y = Function::new("blur_y", &["x", "y"], ElemType::UInt16)
        .define(
            (bx(Expr::var("x"), Expr::var("y"))
                + bx(Expr::var("x"), Expr::var("y") + Expr::Const(1))
                + bx(Expr::var("x"), Expr::var("y") + Expr::Const(2)))
            .div(Expr::Const(3)),
        )
        .estimate("x", 0, 2048)
        .estimate("y", 0, 2048);
    let mut p = Pipeline::new(
        vec![blur_x, blur_y],
        vec![InputBuffer::new("in", ElemType::UInt16, 2)],
        &["blur_y"],
    )
    .unwrap();

    let transcript = schedule(&mut p);
    let dirs = directives(&transcript);

    // The producer is computed inside the consumer's tile loop.
    let compute_at = dirs.iter().find_map(|d| match &d.op {
        DirectiveOp::ComputeAt { func, var } if d.func == "blur_x" => {
            Some((func.clone(), var.clone()))
        }
        _ => None,
    });
    if let Some((target, var)) = compute_at {
        assert_eq!(target, "blur_y");
        // The compute level is one of blur_y's outer tile loops.
        assert!(var.ends_with("_o"), "compute level {} is not a tile loop", var);
        // The consumer was actually tiled.
        assert!(dirs
            .iter()
            .any(|d| d.func == "blur_y" && matches!(&d.op, DirectiveOp::Split { .. })));
    } else {
        // Fusion is only rejected if inlining won instead.
        assert!(
            dirs.iter()
                .any(|d| d.func == "blur_x" && d.op == DirectiveOp::ComputeInline),
            "blur_x neither tiled into nor inlined:\n{}",
            transcript
        );
    }
}

#[test]
fn test_transcript_round_trip() -> anyhow::Result<()> {
    let h = Function::new("h", &["x", "y"], ElemType::Int32)
        .define(Expr::var("x") * Expr::var("y"));
    let g = Function::new("g", &["x", "y"], ElemType::Int32)
        .define(
            Expr::call("h", vec![Expr::var("x"), Expr::var("y")])
                + Expr::call("h", vec![Expr::var("x") + Expr::Const(1), Expr::var("y")]),
        )
        .estimate("x", 0, 1024)
        .estimate("y", 0, 1024);
    let mut p = Pipeline::new(vec![h, g], vec![], &["g"])?;

    let transcript =
        pipeopt::auto_schedule(&mut p, &Target::default(), &MachineParams::default())?;
    assert!(!transcript.is_empty());
    let dirs = Directive::parse_transcript(&transcript)?;
    let rendered = pipeopt::transform::render_transcript(&dirs);
    assert_eq!(transcript, rendered);
    Ok(())
}

#[test]
fn test_stage_co_location_under_merges() {
    // b has an update stage; when b is absorbed into out, both of its
    // stages must travel together.
    let b = Function::new("b", &["x"], ElemType::Int32)
        .define(Expr::Const(0))
        .update(
            vec![Expr::var("x")],
            Expr::call("b", vec![Expr::var("x")])
                + Expr::call("in", vec![Expr::var("x"), Expr::var("r")]),
            vec![RVar::new("r", 0, 64)],
        );
    let out = Function::new("out", &["x"], ElemType::Int32)
        .define(Expr::call("b", vec![Expr::var("x")]) + Expr::Const(1))
        .estimate("x", 0, 4096);
    let p = Pipeline::new(
        vec![b, out],
        vec![InputBuffer::new("in", ElemType::Int32, 2)],
        &["out"],
    )
    .unwrap();

    let env = p.env();
    let order = realization_order(env);
    let fvb = compute_function_value_bounds(&order, env);
    let analysis = DependenceAnalysis::new(env, &fvb);
    let bounds = get_pipeline_bounds(&analysis, p.outputs());
    let machine = MachineParams::default();
    let costs = RegionCosts::new(env);
    let mut part = Partitioner::new(&bounds, &machine, &analysis, &costs, p.outputs());
    part.initialize_groups();
    part.group(Level::Inline);
    part.clear_grouping_cache();
    part.group(Level::FastMem);

    let b_id = env.lookup("b").unwrap();
    let num_b_stages = env.func(b_id).num_stages();
    for group in part.groups().values() {
        let b_stages_here = group
            .members
            .iter()
            .filter(|m| m.func == b_id)
            .count() as u32;
        let only_member_is_b_stage = group.members.len() == 1 && group.output.func == b_id;
        assert!(
            b_stages_here == 0 || b_stages_here == num_b_stages || only_member_is_b_stage,
            "stages of b split across groups"
        );
    }
}
