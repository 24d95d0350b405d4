//! The scheduling transforms: tiling enumeration, grouping, locality
//! analysis, and schedule emission.
//!
//! # Pipeline
//!
//! The grouping engine ([`grouping::Partitioner`]) drives everything:
//! it consults the tile enumerator and the cost model while contracting
//! the pipeline graph, and the emitter lowers the final groups to
//! schedule directives using the locality analyzer for loop orders.

pub mod emitter;
pub mod grouping;
pub mod locality;
pub mod tiling;

pub use emitter::{generate_cpu_schedule, render_transcript};
pub use grouping::{
    bounds_to_estimates, Group, GroupAnalysis, GroupConfig, GroupingChoice, Level, Partitioner,
};
pub use locality::{analyze_spatial_locality, find_max_access_stride, find_vars_using_var};
pub use tiling::{generate_tile_configs, MIN_INNER_DIM_SIZE, TILE_SIZE_VARIANTS};
