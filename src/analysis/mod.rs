//! Analysis passes over the pipeline: graph extraction, region
//! queries, and cost estimation.

pub mod cost;
pub mod dependence;
pub mod graph;

pub use cost::{combine_load_costs, Cost, LoadCosts, RegionCosts};
pub use dependence::{
    get_all_stage_bounds, get_pipeline_bounds, get_stage_bounds, DependenceAnalysis,
};
pub use graph::{build_children, realization_order};
