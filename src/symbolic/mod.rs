//! Symbolic interval arithmetic over expressions.
//!
//! The substrate under the region analyzer: scalar values that may be
//! unknown, intervals with symbolic endpoints, regions (boxes), lexical
//! scopes, and the bounds queries themselves.

pub mod bounds;
pub mod interval;
pub mod scope;
pub mod value;

pub use bounds::{
    bounds_of_expr_in_scope, boxes_required, compute_function_value_bounds, simplify,
    substitute_param_estimates, FuncValueBounds,
};
pub use interval::{merge_region_maps, DimBounds, Interval, Region, RegionMap};
pub use scope::Scope;
pub use value::Value;
