//! Tile-size configuration enumeration.
//!
//! The grouping engine evaluates a fixed family of candidate tilings
//! per group output rather than searching the full cross product of
//! sizes. Reduction dimensions are never tiled.

use std::collections::BTreeMap;

/// Tile sizes tried along each axis.
pub const TILE_SIZE_VARIANTS: [i64; 8] = [1, 4, 8, 16, 32, 64, 128, 256];

/// Floor for the innermost axis. Smaller inner extents starve
/// vectorization and prefetching.
pub const MIN_INNER_DIM_SIZE: i64 = 64;

/// Candidate tile-size maps for a stage whose pure loop variables are
/// `tile_vars`, innermost first. Three families are generated:
/// skewed (one axis swept through the size variants, axes inside it
/// maximal, axes outside it minimal), square-ish (all axes the same
/// size), and reorder-only masks (each non-empty subset of axes tiled
/// at the minimum useful size). Exact duplicates are dropped.
pub fn generate_tile_configs(tile_vars: &[String]) -> Vec<BTreeMap<String, i64>> {
    let mut configs: Vec<BTreeMap<String, i64>> = Vec::new();
    let mut push_unique = |configs: &mut Vec<BTreeMap<String, i64>>, c: BTreeMap<String, i64>| {
        if !c.is_empty() && !configs.contains(&c) {
            configs.push(c);
        }
    };

    // Skewed configurations.
    for i in 0..tile_vars.len() {
        for &size in &TILE_SIZE_VARIANTS {
            let mut tiling = BTreeMap::new();
            tiling.insert(
                tile_vars[i].clone(),
                if i == 0 {
                    size.max(MIN_INNER_DIM_SIZE)
                } else {
                    size
                },
            );
            for (j, var) in tile_vars.iter().enumerate() {
                if j < i {
                    tiling.insert(var.clone(), *TILE_SIZE_VARIANTS.last().unwrap());
                } else if j > i {
                    tiling.insert(var.clone(), TILE_SIZE_VARIANTS[0]);
                }
            }
            push_unique(&mut configs, tiling);
        }
    }

    // Almost square configurations.
    for &size in &TILE_SIZE_VARIANTS {
        let mut tiling = BTreeMap::new();
        for (j, var) in tile_vars.iter().enumerate() {
            tiling.insert(
                var.clone(),
                if j == 0 {
                    size.max(MIN_INNER_DIM_SIZE)
                } else {
                    size
                },
            );
        }
        push_unique(&mut configs, tiling);
    }

    // Reorder-only masks: tile a subset of the axes at minimal size so
    // the emitter is free to move the untiled axes.
    for mask in 0u32..(1 << tile_vars.len()) {
        let mut tiling = BTreeMap::new();
        for (j, var) in tile_vars.iter().enumerate() {
            if (mask >> j) & 1 == 1 {
                tiling.insert(
                    var.clone(),
                    if j == 0 { MIN_INNER_DIM_SIZE } else { 1 },
                );
            }
        }
        push_unique(&mut configs, tiling);
    }

    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_innermost_floor() {
        let configs = generate_tile_configs(&vars(&["x", "y"]));
        for c in &configs {
            if let Some(&x) = c.get("x") {
                assert!(x >= MIN_INNER_DIM_SIZE, "inner size {} too small", x);
            }
        }
    }

    #[test]
    fn test_no_duplicates() {
        let configs = generate_tile_configs(&vars(&["x", "y", "z"]));
        for (i, a) in configs.iter().enumerate() {
            for b in &configs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_single_var_configs() {
        let configs = generate_tile_configs(&vars(&["x"]));
        assert!(!configs.is_empty());
        // Every config tiles x at >= the floor.
        assert!(configs.iter().all(|c| c["x"] >= MIN_INNER_DIM_SIZE));
    }

    #[test]
    fn test_empty_vars_yield_nothing() {
        assert!(generate_tile_configs(&[]).is_empty());
    }
}
