//! Point-in-area lookup over a growing set of labeled multipolygons.
//!
//! An R-tree over bounding rectangles narrows each query to a few
//! candidates; the exact ray-cast test runs only on those. Polygons are
//! immutable once inserted. Queries are plain reads and may run concurrently
//! with inserts.

use std::sync::RwLock;

use geo_types::{Coord, MultiPolygon};
use rstar::{RTree, RTreeObject, AABB};

use crate::polygon::{bounding_rect, multi_polygon_contains};

struct BoundEntry {
    bbox: AABB<[f64; 2]>,
    id: usize,
}

impl RTreeObject for BoundEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bbox
    }
}

struct Inner<D> {
    borders: Vec<(D, MultiPolygon)>,
    tree: RTree<BoundEntry>,
}

pub struct BorderTree<D> {
    inner: RwLock<Inner<D>>,
}

impl<D> Default for BorderTree<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> BorderTree<D> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                borders: Vec::new(),
                tree: RTree::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().borders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores the shape under `data` and indexes its bounding box. Shapes
    /// without any coordinates are ignored.
    pub fn insert(&self, data: D, shape: MultiPolygon) {
        let Some(rect) = bounding_rect(&shape) else {
            return;
        };

        let mut inner = self.inner.write().unwrap();
        let id = inner.borders.len();
        inner.borders.push((data, shape));
        inner.tree.insert(BoundEntry {
            bbox: AABB::from_corners(
                [rect.min().x, rect.min().y],
                [rect.max().x, rect.max().y],
            ),
            id,
        });
    }
}

impl<D: Clone> BorderTree<D> {
    /// Label of the first inserted shape that contains the point, if any.
    pub fn query(&self, point: Coord) -> Option<D> {
        let inner = self.inner.read().unwrap();

        let probe = AABB::from_point([point.x, point.y]);
        let mut candidates: Vec<usize> = inner
            .tree
            .locate_in_envelope_intersecting(&probe)
            .map(|entry| entry.id)
            .collect();
        // The R-tree reports hits in arbitrary order; insertion order keeps
        // overlapping-area resolution deterministic.
        candidates.sort_unstable();

        for id in candidates {
            let (data, shape) = &inner.borders[id];
            if multi_polygon_contains(shape, point) {
                return Some(data.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use geo_types::{LineString, Polygon};

    use super::*;

    fn square(min: f64, max: f64) -> MultiPolygon {
        let ring = LineString(vec![
            Coord { x: min, y: min },
            Coord { x: max, y: min },
            Coord { x: max, y: max },
            Coord { x: min, y: max },
            Coord { x: min, y: min },
        ]);
        MultiPolygon(vec![Polygon::new(ring, vec![])])
    }

    #[test]
    fn interior_hit_exterior_miss() {
        let tree = BorderTree::new();
        tree.insert("zone".to_owned(), square(0.0, 10.0));

        assert_eq!(tree.query(Coord { x: 5.0, y: 5.0 }), Some("zone".to_owned()));
        assert_eq!(tree.query(Coord { x: 15.0, y: 5.0 }), None);
    }

    #[test]
    fn nested_shapes_resolve_to_first_inserted() {
        let tree = BorderTree::new();
        tree.insert("outer".to_owned(), square(0.0, 10.0));
        tree.insert("nested".to_owned(), square(2.0, 4.0));

        // (3, 3) sits inside both; the earlier insertion wins.
        assert_eq!(
            tree.query(Coord { x: 3.0, y: 3.0 }),
            Some("outer".to_owned())
        );
        // (5, 5) is only inside the big square.
        assert_eq!(
            tree.query(Coord { x: 5.0, y: 5.0 }),
            Some("outer".to_owned())
        );
    }

    #[test]
    fn bbox_overlap_without_containment_misses() {
        // An L-shaped region: bbox contains (8, 8) but the shape does not.
        let ring = LineString(
            [
                (0.0, 0.0),
                (10.0, 0.0),
                (10.0, 4.0),
                (4.0, 4.0),
                (4.0, 10.0),
                (0.0, 10.0),
                (0.0, 0.0),
            ]
            .iter()
            .map(|&(x, y)| Coord { x, y })
            .collect(),
        );
        let tree = BorderTree::new();
        tree.insert(1u32, MultiPolygon(vec![Polygon::new(ring, vec![])]));

        assert_eq!(tree.query(Coord { x: 8.0, y: 8.0 }), None);
        assert_eq!(tree.query(Coord { x: 2.0, y: 8.0 }), Some(1));
    }

    #[test]
    fn empty_shape_is_ignored() {
        let tree: BorderTree<u32> = BorderTree::new();
        tree.insert(1, MultiPolygon(vec![]));
        assert!(tree.is_empty());
    }
}
