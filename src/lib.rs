//! # pipeopt - Automatic Scheduler for Array Pipelines
//!
//! An automatic scheduler for data-parallel image and array pipelines:
//! given a DAG of pure and update function stages and bounds estimates
//! on the final outputs, it decides which producers to inline, which to
//! compute at tiles of their consumer, and the tile sizes and loop
//! order of every stage.
//!
//! ## Architecture
//!
//! ```text
//! Functions → Pipeline graph → Region analysis → Cost model
//!                                   ↓                ↓
//!                            Grouping engine (inline, then tiles)
//!                                   ↓
//!                     Locality analysis → Schedule emitter → Directives
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipeopt::prelude::*;
//!
//! let blur_x = Function::new("blur_x", &["x", "y"], ElemType::Float32)
//!     .define(/* ... */);
//! let blur_y = Function::new("blur_y", &["x", "y"], ElemType::Float32)
//!     .define(/* ... */)
//!     .estimate("x", 0, 1920)
//!     .estimate("y", 0, 1080);
//!
//! let mut pipeline = Pipeline::new(vec![blur_x, blur_y], inputs, &["blur_y"])?;
//! let transcript = pipeopt::auto_schedule(
//!     &mut pipeline,
//!     &Target::default(),
//!     &MachineParams::default(),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(dead_code)] // During development

pub mod analysis;
pub mod ir;
pub mod machine;
pub mod symbolic;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::analysis::{Cost, DependenceAnalysis, RegionCosts};
    pub use crate::ir::{
        Directive, DirectiveOp, ElemType, Expr, FStage, FuncId, Function, InputBuffer,
        LoopLevel, Pipeline, RVar, StageSchedule,
    };
    pub use crate::machine::{MachineParams, Target};
    pub use crate::symbolic::{Interval, Region, Value};
    pub use crate::transform::{Group, Level, Partitioner};
    pub use crate::utils::errors::*;
}

use log::warn;

use crate::analysis::cost::RegionCosts;
use crate::analysis::dependence::{get_pipeline_bounds, DependenceAnalysis};
use crate::analysis::graph::realization_order;
use crate::ir::function::Pipeline;
use crate::ir::schedule::{ForType, LoopLevel};
use crate::machine::{MachineParams, Target};
use crate::symbolic::bounds::compute_function_value_bounds;
use crate::transform::emitter::generate_cpu_schedule;
use crate::transform::grouping::{Level, Partitioner};
use crate::utils::errors::{AutoScheduleError, UsageError, UsageErrorKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reject pipelines with partially specified schedules: the scheduler
/// owns every decision, so any pre-existing split, non-serial loop, or
/// reordered dimension is a usage error.
fn validate_no_partial_schedules(pipeline: &Pipeline) -> Result<(), UsageError> {
    for stg in pipeline.env.all_stages() {
        let func = pipeline.env.func(stg.func);
        let def = func.stage(stg.stage);
        let sched = &pipeline.schedules[&stg];

        if !sched.splits.is_empty() {
            return Err(UsageError::new(
                UsageErrorKind::PartialSplits,
                func.name(),
                format!("stage {} has partially specified splits", stg.stage),
            ));
        }
        if sched.dims.iter().any(|d| d.for_type != ForType::Serial) {
            return Err(UsageError::new(
                UsageErrorKind::NonSerialLoop,
                func.name(),
                format!("stage {} is not serial in every dimension", stg.stage),
            ));
        }
        if !sched.is_unscheduled(def) {
            return Err(UsageError::new(
                UsageErrorKind::ReorderedDims,
                func.name(),
                format!(
                    "stage {} has dimensions reordered relative to the declaration",
                    stg.stage
                ),
            ));
        }
    }
    Ok(())
}

/// True if every output has an estimate on each of its pure dimensions.
fn check_estimates_on_outputs(pipeline: &Pipeline) -> bool {
    pipeline.outputs.iter().all(|&out| {
        let func = pipeline.env.func(out);
        func.args()
            .iter()
            .all(|arg| func.estimate_for(arg).is_some())
    })
}

/// Compute and store every stage at root.
fn set_schedule_defaults(pipeline: &mut Pipeline) {
    for sched in pipeline.schedules.values_mut() {
        sched.compute_level = LoopLevel::Root;
        sched.store_level = LoopLevel::Root;
    }
}

/// Generate schedules for every function needed to compute the
/// pipeline's outputs. The schedules are applied to the stage records
/// of the pipeline and returned as a printable transcript.
///
/// Without estimates on every output dimension no cost can be
/// quantified: a warning is logged, every stage is computed and stored
/// at root, and the transcript is empty.
pub fn auto_schedule(
    pipeline: &mut Pipeline,
    target: &Target,
    machine: &MachineParams,
) -> Result<String, AutoScheduleError> {
    validate_no_partial_schedules(pipeline)?;

    if !check_estimates_on_outputs(pipeline) {
        warn!("please provide estimates for each dimension of the pipeline output functions");
        set_schedule_defaults(pipeline);
        return Ok(String::new());
    }

    let env = &pipeline.env;
    let outputs = &pipeline.outputs;
    let schedules = &mut pipeline.schedules;

    let order = realization_order(env);
    let func_val_bounds = compute_function_value_bounds(&order, env);
    let dep_analysis = DependenceAnalysis::new(env, &func_val_bounds);
    let pipeline_bounds = get_pipeline_bounds(&dep_analysis, outputs);
    let costs = RegionCosts::new(env);

    let mut partitioner =
        Partitioner::new(&pipeline_bounds, machine, &dep_analysis, &costs, outputs);
    partitioner.initialize_groups();
    partitioner.group(Level::Inline);
    partitioner.clear_grouping_cache();
    partitioner.group(Level::FastMem);

    Ok(generate_cpu_schedule(&partitioner, target, schedules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{ElemType, Function};
    use crate::ir::Expr;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_missing_estimates_yield_empty_transcript() {
        let f = Function::new("f", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") + Expr::var("y"));
        let mut p = Pipeline::new(vec![f], vec![], &["f"]).unwrap();
        let transcript =
            auto_schedule(&mut p, &Target::default(), &MachineParams::default()).unwrap();
        assert!(transcript.is_empty());
        for sched in p.schedules.values() {
            assert_eq!(sched.compute_level, LoopLevel::Root);
            assert_eq!(sched.store_level, LoopLevel::Root);
        }
    }

    #[test]
    fn test_partial_schedule_rejected() {
        let f = Function::new("f", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") + Expr::var("y"))
            .estimate("x", 0, 64)
            .estimate("y", 0, 64);
        let mut p = Pipeline::new(vec![f], vec![], &["f"]).unwrap();
        let stg = crate::ir::FStage::new(p.env().lookup("f").unwrap(), 0);
        p.schedules.get_mut(&stg).unwrap().apply(&crate::ir::DirectiveOp::Split {
            var: "x".into(),
            outer: "x_o".into(),
            inner: "x_i".into(),
            factor: 8,
        });
        let err = auto_schedule(&mut p, &Target::default(), &MachineParams::default());
        assert!(matches!(
            err,
            Err(AutoScheduleError::Usage(UsageError {
                kind: UsageErrorKind::PartialSplits,
                ..
            }))
        ));
    }
}
