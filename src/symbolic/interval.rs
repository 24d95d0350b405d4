//! Symbolic intervals and regions.
//!
//! An interval bounds one dimension with expression endpoints; either
//! endpoint may be missing, in which case the dimension is unknown in
//! that direction. A region is one interval per storage dimension of an
//! allocation.

use std::collections::BTreeMap;

use crate::ir::expr::{BinOp, Expr};
use crate::symbolic::bounds::simplify;
use crate::symbolic::value::Value;

/// Bounds of the loop dimensions of a stage, keyed by variable name.
pub type DimBounds = BTreeMap<String, Interval>;

/// Regions of several allocations, keyed by function or input name.
pub type RegionMap = BTreeMap<String, Region>;

fn opt_bin(op: BinOp, a: &Option<Expr>, b: &Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(x), Some(y)) => Some(Expr::Bin(
            op,
            Box::new(x.clone()),
            Box::new(y.clone()),
        )),
        _ => None,
    }
}

/// A closed interval with symbolic endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Lower endpoint, or unknown.
    pub min: Option<Expr>,
    /// Upper endpoint, or unknown.
    pub max: Option<Expr>,
}

impl Interval {
    /// An interval with both endpoints.
    pub fn new(min: impl Into<Expr>, max: impl Into<Expr>) -> Self {
        Self {
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    /// The interval with no information in either direction.
    pub fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    /// The single-point interval containing only `e`.
    pub fn point(e: Expr) -> Self {
        Self {
            min: Some(e.clone()),
            max: Some(e),
        }
    }

    /// True if both endpoints are present.
    pub fn has_bounds(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    /// Both endpoints as constants, after simplification.
    pub fn as_const_bounds(&self) -> Option<(i64, i64)> {
        let lo = simplify(self.min.as_ref()?).as_const()?;
        let hi = simplify(self.max.as_ref()?).as_const()?;
        Some((lo, hi))
    }

    /// Number of points in the interval, when it is constant.
    pub fn extent(&self) -> Value {
        match self.as_const_bounds() {
            Some((lo, hi)) => Value::Known(hi - lo + 1),
            None => Value::Unknown,
        }
    }

    /// The interval shifted by `offset` in both endpoints.
    pub fn shift(&self, offset: &Expr) -> Interval {
        Interval {
            min: self.min.as_ref().map(|m| m.clone() + offset.clone()),
            max: self.max.as_ref().map(|m| m.clone() + offset.clone()),
        }
    }

    /// Smallest interval containing both inputs. A missing endpoint
    /// stays missing.
    pub fn make_union(a: &Interval, b: &Interval) -> Interval {
        Interval {
            min: opt_bin(BinOp::Min, &a.min, &b.min),
            max: opt_bin(BinOp::Max, &a.max, &b.max),
        }
    }

    /// Largest interval contained in both inputs. A missing endpoint
    /// imposes no constraint.
    pub fn make_intersection(a: &Interval, b: &Interval) -> Interval {
        let min = match (&a.min, &b.min) {
            (Some(_), Some(_)) => opt_bin(BinOp::Max, &a.min, &b.min),
            (Some(x), None) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };
        let max = match (&a.max, &b.max) {
            (Some(_), Some(_)) => opt_bin(BinOp::Min, &a.max, &b.max),
            (Some(x), None) | (None, Some(x)) => Some(x.clone()),
            (None, None) => None,
        };
        Interval { min, max }
    }

    /// Simplify both endpoints in place.
    pub fn simplify(&mut self) {
        if let Some(m) = &self.min {
            self.min = Some(simplify(m));
        }
        if let Some(m) = &self.max {
            self.max = Some(simplify(m));
        }
    }
}

/// A bounding box: one interval per storage dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    dims: Vec<Interval>,
}

impl Region {
    /// The empty (rank 0) region.
    pub fn new() -> Self {
        Self::default()
    }

    /// A region of the given rank with no bounds information.
    pub fn unbounded(rank: usize) -> Self {
        Self {
            dims: vec![Interval::unbounded(); rank],
        }
    }

    /// Build a region from intervals, innermost storage dim first.
    pub fn from_intervals(dims: Vec<Interval>) -> Self {
        Self { dims }
    }

    /// Number of storage dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Append a dimension.
    pub fn push(&mut self, i: Interval) {
        self.dims.push(i);
    }

    /// The interval of one dimension.
    pub fn dim(&self, d: usize) -> &Interval {
        &self.dims[d]
    }

    /// Iterate the dimensions.
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.dims.iter()
    }

    /// Number of points in the region, when all extents are constant.
    pub fn size(&self) -> Value {
        self.dims
            .iter()
            .fold(Value::Known(1), |acc, i| acc * i.extent())
    }

    /// Widen this region to cover `other`, coordinate-wise.
    pub fn merge(&mut self, other: &Region) {
        assert_eq!(
            self.rank(),
            other.rank(),
            "merging regions of different rank"
        );
        for (a, b) in self.dims.iter_mut().zip(other.iter()) {
            *a = Interval::make_union(a, b);
        }
    }

    /// Coordinate-wise intersection of two regions of equal rank.
    pub fn intersection(a: &Region, b: &Region) -> Region {
        assert_eq!(a.rank(), b.rank(), "intersecting regions of different rank");
        Region {
            dims: a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| Interval::make_intersection(x, y))
                .collect(),
        }
    }

    /// Simplify the endpoints of every dimension.
    pub fn simplify(&mut self) {
        for d in &mut self.dims {
            d.simplify();
        }
    }
}

/// Merge a partial region map into an accumulating one; boxes of
/// functions present in both are widened coordinate-wise.
pub fn merge_region_maps(result: &mut RegionMap, partial: RegionMap) {
    for (name, region) in partial {
        match result.get_mut(&name) {
            Some(existing) => existing.merge(&region),
            None => {
                result.insert(name, region);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_intersection_constants() {
        let a = Interval::new(0, 10);
        let b = Interval::new(5, 20);
        let u = Interval::make_union(&a, &b);
        assert_eq!(u.as_const_bounds(), Some((0, 20)));
        let i = Interval::make_intersection(&a, &b);
        assert_eq!(i.as_const_bounds(), Some((5, 10)));
    }

    #[test]
    fn test_intersection_with_unbounded_side() {
        let a = Interval::unbounded();
        let b = Interval::new(5, 20);
        let i = Interval::make_intersection(&a, &b);
        assert_eq!(i.as_const_bounds(), Some((5, 20)));
        let u = Interval::make_union(&a, &b);
        assert!(!u.has_bounds());
    }

    #[test]
    fn test_region_size() {
        let r = Region::from_intervals(vec![Interval::new(0, 63), Interval::new(0, 31)]);
        assert_eq!(r.size(), Value::Known(64 * 32));
        let u = Region::unbounded(2);
        assert!(u.size().is_unknown());
    }

    #[test]
    fn test_merge_region_maps_widens() {
        let mut acc: RegionMap = BTreeMap::new();
        acc.insert(
            "f".to_string(),
            Region::from_intervals(vec![Interval::new(0, 7)]),
        );
        let mut partial: RegionMap = BTreeMap::new();
        partial.insert(
            "f".to_string(),
            Region::from_intervals(vec![Interval::new(4, 15)]),
        );
        merge_region_maps(&mut acc, partial);
        assert_eq!(acc["f"].dim(0).as_const_bounds(), Some((0, 15)));
    }
}
