//! Spatial predicates and envelope utilities on top of the geo crate.
//!
//! The partition tree and the query engine only ever need axis-aligned
//! containment and intersection tests. Those are implemented here as plain
//! min/max comparisons so the half-open boundary convention of the tree is
//! explicit, with `geo::Rect` and `geo::Coord` as the vocabulary types.

use geo::{Coord, Rect};

use crate::model::Node;

/// Inclusion predicate over a query region.
///
/// The query engine classifies leaves and relation batches with the region
/// tests and filters individual nodes with the point test. Implementations
/// other than [`RectRegion`] can express polygonal or compound regions as
/// long as they answer these three questions consistently.
pub trait RegionPredicate {
    /// Whether a point lies inside the region.
    fn contains_point(&self, lon: f64, lat: f64) -> bool;

    /// Whether a rectangle lies entirely inside the region.
    fn contains_rect(&self, rect: &Rect) -> bool;

    /// Whether a rectangle overlaps the region.
    fn intersects_rect(&self, rect: &Rect) -> bool;
}

/// The standard axis-aligned rectangular region.
///
/// # Examples
///
/// ```rust
/// use geoshard::spatial::{RegionPredicate, RectRegion, rect};
///
/// let region = RectRegion::new(rect(0.0, 0.0, 10.0, 10.0));
/// assert!(region.contains_point(5.0, 5.0));
/// assert!(region.intersects_rect(&rect(8.0, 8.0, 12.0, 12.0)));
/// assert!(!region.contains_rect(&rect(8.0, 8.0, 12.0, 12.0)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RectRegion {
    rect: Rect,
}

impl RectRegion {
    pub fn new(rect: Rect) -> Self {
        Self { rect }
    }

    pub fn rect(&self) -> &Rect {
        &self.rect
    }
}

impl RegionPredicate for RectRegion {
    fn contains_point(&self, lon: f64, lat: f64) -> bool {
        let (min, max) = (self.rect.min(), self.rect.max());
        lon >= min.x && lon <= max.x && lat >= min.y && lat <= max.y
    }

    fn contains_rect(&self, rect: &Rect) -> bool {
        let (min, max) = (self.rect.min(), self.rect.max());
        let (rmin, rmax) = (rect.min(), rect.max());
        rmin.x >= min.x && rmax.x <= max.x && rmin.y >= min.y && rmax.y <= max.y
    }

    fn intersects_rect(&self, rect: &Rect) -> bool {
        rects_intersect(&self.rect, rect)
    }
}

/// Build a rectangle from corner coordinates. Corners may be given in any
/// order; `geo::Rect` normalizes min/max.
pub fn rect(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> Rect {
    Rect::new(
        Coord { x: lon1, y: lat1 },
        Coord { x: lon2, y: lat2 },
    )
}

/// Closed-interval intersection test for two rectangles.
pub fn rects_intersect(a: &Rect, b: &Rect) -> bool {
    let (amin, amax) = (a.min(), a.max());
    let (bmin, bmax) = (b.min(), b.max());
    amin.x <= bmax.x && amax.x >= bmin.x && amin.y <= bmax.y && amax.y >= bmin.y
}

/// The envelope of a set of nodes, or `None` for an empty set.
pub fn nodes_envelope<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Option<Rect> {
    let mut iter = nodes.into_iter();
    let first = iter.next()?;
    let mut min_x = first.lon;
    let mut max_x = first.lon;
    let mut min_y = first.lat;
    let mut max_y = first.lat;
    for node in iter {
        min_x = min_x.min(node.lon);
        max_x = max_x.max(node.lon);
        min_y = min_y.min(node.lat);
        max_y = max_y.max(node.lat);
    }
    Some(rect(min_x, min_y, max_x, max_y))
}
