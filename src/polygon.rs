//! Multipolygon assembly from relation members, plus the planar predicates
//! the border index and the generator share.
//!
//! OSM encodes an administrative area as a relation whose way members carry
//! "outer"/"inner" roles. Members arrive as partial, arbitrarily oriented
//! linestrings; they are joined end-to-end into closed rings, holes are
//! attached to the outer ring that contains them, and rings are reoriented
//! (outer CCW, inner CW) on emission.

use geo_types::{Coord, LineString, MultiPolygon, Polygon, Rect};

use crate::osm::{Member, MemberKind};

/// Resolves a way id into its node polyline. Implemented by the PBF block
/// database; tests substitute a fixture map.
pub trait LineSource {
    fn way_line(&self, way_id: i64) -> Option<LineString>;
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("relation has no valid outer ring")]
    NoValidOuter,
}

/// Builds a valid multipolygon from relation members.
///
/// Handles both modern multipolygons (any number of outer rings, holes
/// assigned by containment) and "old style" ones where a single outer way
/// carries the tags and the relation only contributes holes.
pub fn assemble<S: LineSource>(
    src: &S,
    members: &[Member],
) -> Result<MultiPolygon, AssembleError> {
    let mut outer: Vec<Vec<Coord>> = Vec::new();
    let mut inner: Vec<Vec<Coord>> = Vec::new();
    let mut outer_count = 0usize;

    for m in members {
        if m.kind != MemberKind::Way {
            continue;
        }
        let is_outer = match m.role.as_str() {
            "outer" => true,
            "inner" => false,
            _ => continue,
        };
        if is_outer {
            outer_count += 1;
        }

        // A way listed in the relation may be absent from the extract; that
        // member is skipped, the join below copes with the gap.
        let Some(line) = src.way_line(m.id) else {
            continue;
        };
        if line.0.len() < 2 {
            continue;
        }

        if is_outer {
            outer.push(line.0);
        } else {
            inner.push(line.0);
        }
    }

    if outer.len() == 1 && outer_count == 1 {
        // Old style: tags live on the single outer way, the relation exists
        // only to punch holes into it.
        let outer_ring = orient_ring(outer.remove(0), true);
        if !ring_is_valid(&outer_ring) {
            return Err(AssembleError::NoValidOuter);
        }

        let mut holes = Vec::new();
        for section in join(inner) {
            let ring = orient_ring(section, false);
            if ring_is_valid(&ring) {
                holes.push(LineString(ring));
            } else {
                tracing::warn!("discarding unclosed inner ring");
            }
        }

        return Ok(MultiPolygon(vec![Polygon::new(
            LineString(outer_ring),
            holes,
        )]));
    }

    // General case: join outer segments into rings, one polygon per ring,
    // then map each inner ring to the outer that contains it.
    let mut polygons: Vec<Polygon> = Vec::new();
    for section in join(outer) {
        let ring = orient_ring(section, true);
        if ring_is_valid(&ring) {
            polygons.push(Polygon::new(LineString(ring), vec![]));
        } else {
            tracing::warn!("discarding unclosed outer ring");
        }
    }

    if polygons.is_empty() {
        return Err(AssembleError::NoValidOuter);
    }

    for section in join(inner) {
        let ring = orient_ring(section, false);
        if ring_is_valid(&ring) {
            attach_hole(&mut polygons, ring);
        } else {
            tracing::warn!("discarding unclosed inner ring");
        }
    }

    Ok(MultiPolygon(polygons))
}

/// Attaches a hole to the polygon whose outer ring contains it. With no
/// container, the hole lands on a polygon with an empty placeholder outer,
/// creating one if necessary.
fn attach_hole(polygons: &mut Vec<Polygon>, ring: Vec<Coord>) {
    for poly in polygons.iter_mut() {
        if ring
            .iter()
            .any(|c| ring_contains_coords(&poly.exterior().0, *c))
        {
            poly.interiors_push(LineString(ring));
            return;
        }
    }

    for poly in polygons.iter_mut() {
        if poly.exterior().0.is_empty() {
            poly.interiors_push(LineString(ring));
            return;
        }
    }

    polygons.push(Polygon::new(
        LineString(vec![]),
        vec![LineString(ring)],
    ));
}

#[derive(Clone, Copy)]
enum Fit {
    Append,
    AppendReversed,
    Prepend,
    PrependReversed,
}

/// Greedily joins segments into continuous sections, reversing them as
/// needed to match endpoints. A section with no matching segment left is
/// emitted as-is; callers decide whether an unclosed section is fatal.
fn join(mut segments: Vec<Vec<Coord>>) -> Vec<Vec<Coord>> {
    segments.retain(|s| s.len() > 1);

    let mut sections = Vec::new();
    while let Some(mut current) = segments.pop() {
        while !segments.is_empty() && current.first() != current.last() {
            let first = current[0];
            let last = current[current.len() - 1];

            let mut found = None;
            for (i, seg) in segments.iter().enumerate() {
                let seg_first = seg[0];
                let seg_last = seg[seg.len() - 1];
                let fit = if last == seg_first {
                    Fit::Append
                } else if last == seg_last {
                    Fit::AppendReversed
                } else if first == seg_last {
                    Fit::Prepend
                } else if first == seg_first {
                    Fit::PrependReversed
                } else {
                    continue;
                };
                found = Some((i, fit));
                break;
            }

            // Dangling section: no segment connects to either endpoint.
            let Some((i, fit)) = found else {
                break;
            };

            let mut seg = segments.remove(i);
            match fit {
                Fit::Append => current.extend(seg.into_iter().skip(1)),
                Fit::AppendReversed => {
                    seg.reverse();
                    current.extend(seg.into_iter().skip(1));
                }
                Fit::Prepend => {
                    let mut merged = seg;
                    merged.extend(current.into_iter().skip(1));
                    current = merged;
                }
                Fit::PrependReversed => {
                    seg.reverse();
                    let mut merged = seg;
                    merged.extend(current.into_iter().skip(1));
                    current = merged;
                }
            }
        }

        sections.push(current);
    }

    sections
}

fn ring_is_valid(ring: &[Coord]) -> bool {
    ring.len() >= 4 && ring.first() == ring.last()
}

/// Reverses the ring when its winding disagrees with the requested one.
fn orient_ring(mut ring: Vec<Coord>, ccw: bool) -> Vec<Coord> {
    if ring.len() >= 3 && ring_is_ccw(&ring) != ccw {
        ring.reverse();
    }
    ring
}

pub fn ring_is_ccw(ring: &[Coord]) -> bool {
    signed_area(ring) > 0.0
}

/// Twice the shoelace area, signed; positive for counterclockwise winding.
/// Coordinates are shifted to the first point to limit roundoff.
pub fn signed_area(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let origin = ring[0];
    let mut area = 0.0;
    let mut prev = ring[ring.len() - 1];
    for &p in ring {
        area += (prev.x - origin.x) * (p.y - origin.y) - (p.x - origin.x) * (prev.y - origin.y);
        prev = p;
    }
    area
}

/// Classic even-odd ray cast against one ring.
pub fn ring_contains_coords(ring: &[Coord], c: Coord) -> bool {
    let mut inside = false;
    let mut j = ring.len().wrapping_sub(1);
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[j];
        if ((a.y > c.y) != (b.y > c.y))
            && (c.x < (b.x - a.x) * (c.y - a.y) / (b.y - a.y) + a.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn ring_contains(ring: &LineString, c: Coord) -> bool {
    ring_contains_coords(&ring.0, c)
}

pub fn polygon_contains(poly: &Polygon, c: Coord) -> bool {
    if !ring_contains(poly.exterior(), c) {
        return false;
    }
    !poly.interiors().iter().any(|hole| ring_contains(hole, c))
}

pub fn multi_polygon_contains(mp: &MultiPolygon, c: Coord) -> bool {
    mp.0.iter().any(|poly| polygon_contains(poly, c))
}

/// Area-weighted centroid of a ring; degenerate (zero area) rings fall back
/// to the vertex average.
pub fn ring_centroid(ring: &LineString) -> Option<Coord> {
    let pts = &ring.0;
    if pts.is_empty() {
        return None;
    }

    let origin = pts[0];
    let mut area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    let mut prev = pts[pts.len() - 1];
    for &p in pts {
        let ax = prev.x - origin.x;
        let ay = prev.y - origin.y;
        let bx = p.x - origin.x;
        let by = p.y - origin.y;
        let f = ax * by - bx * ay;
        cx += (ax + bx) * f;
        cy += (ay + by) * f;
        area += f;
        prev = p;
    }

    if area.abs() < f64::EPSILON {
        let n = pts.len() as f64;
        let sx: f64 = pts.iter().map(|p| p.x).sum();
        let sy: f64 = pts.iter().map(|p| p.y).sum();
        return Some(Coord { x: sx / n, y: sy / n });
    }

    Some(Coord {
        x: origin.x + cx / (3.0 * area),
        y: origin.y + cy / (3.0 * area),
    })
}

/// Bounding rectangle over every coordinate of the multipolygon, `None` for
/// an empty one.
pub fn bounding_rect(mp: &MultiPolygon) -> Option<Rect> {
    let mut min = Coord {
        x: f64::INFINITY,
        y: f64::INFINITY,
    };
    let mut max = Coord {
        x: f64::NEG_INFINITY,
        y: f64::NEG_INFINITY,
    };
    let mut any = false;

    for poly in &mp.0 {
        for ring in std::iter::once(poly.exterior()).chain(poly.interiors()) {
            for c in &ring.0 {
                any = true;
                min.x = min.x.min(c.x);
                min.y = min.y.min(c.y);
                max.x = max.x.max(c.x);
                max.y = max.y.max(c.y);
            }
        }
    }

    any.then(|| Rect::new(min, max))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::osm::Member;

    struct MapSource(HashMap<i64, Vec<(f64, f64)>>);

    impl LineSource for MapSource {
        fn way_line(&self, way_id: i64) -> Option<LineString> {
            self.0.get(&way_id).map(|pts| {
                LineString(pts.iter().map(|&(x, y)| Coord { x, y }).collect())
            })
        }
    }

    fn way_member(id: i64, role: &str) -> Member {
        Member {
            id,
            kind: MemberKind::Way,
            role: role.to_owned(),
        }
    }

    fn source(ways: &[(i64, &[(f64, f64)])]) -> MapSource {
        MapSource(
            ways.iter()
                .map(|&(id, pts)| (id, pts.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn joins_two_half_rings() {
        let src = source(&[
            (1, &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0)]),
            (2, &[(4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]),
        ]);
        let members = vec![way_member(1, "outer"), way_member(2, "outer")];

        let mp = assemble(&src, &members).expect("square");
        assert_eq!(mp.0.len(), 1);
        let outer = mp.0[0].exterior();
        assert!(ring_is_valid(&outer.0));
        assert!(ring_is_ccw(&outer.0));
    }

    #[test]
    fn joins_reversed_segment() {
        // Second way runs the "wrong" direction and must be flipped.
        let src = source(&[
            (1, &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0)]),
            (2, &[(0.0, 0.0), (0.0, 4.0), (4.0, 4.0)]),
        ]);
        let members = vec![way_member(1, "outer"), way_member(2, "outer")];

        let mp = assemble(&src, &members).expect("square");
        assert_eq!(mp.0.len(), 1);
        assert!(ring_is_valid(&mp.0[0].exterior().0));
    }

    #[test]
    fn old_style_hole_attachment() {
        let src = source(&[
            (
                1,
                &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)],
            ),
            (
                2,
                &[(2.0, 2.0), (4.0, 2.0), (4.0, 4.0), (2.0, 4.0), (2.0, 2.0)],
            ),
        ]);
        let members = vec![way_member(1, "outer"), way_member(2, "inner")];

        let mp = assemble(&src, &members).expect("polygon with hole");
        assert_eq!(mp.0.len(), 1);
        let poly = &mp.0[0];
        assert_eq!(poly.interiors().len(), 1);
        assert!(ring_is_ccw(&poly.exterior().0));
        assert!(!ring_is_ccw(&poly.interiors()[0].0));

        assert!(polygon_contains(poly, Coord { x: 5.0, y: 5.0 }));
        assert!(!polygon_contains(poly, Coord { x: 3.0, y: 3.0 }));
        assert!(!polygon_contains(poly, Coord { x: 11.0, y: 5.0 }));
    }

    #[test]
    fn hole_lands_on_containing_outer() {
        let src = source(&[
            (
                1,
                &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)],
            ),
            (
                2,
                &[
                    (20.0, 0.0),
                    (30.0, 0.0),
                    (30.0, 10.0),
                    (20.0, 10.0),
                    (20.0, 0.0),
                ],
            ),
            (
                3,
                &[
                    (22.0, 2.0),
                    (24.0, 2.0),
                    (24.0, 4.0),
                    (22.0, 4.0),
                    (22.0, 2.0),
                ],
            ),
        ]);
        let members = vec![
            way_member(1, "outer"),
            way_member(2, "outer"),
            way_member(3, "inner"),
        ];

        let mp = assemble(&src, &members).expect("two polygons");
        assert_eq!(mp.0.len(), 2);
        let with_hole: Vec<_> = mp.0.iter().filter(|p| !p.interiors().is_empty()).collect();
        assert_eq!(with_hole.len(), 1);
        assert!(ring_contains(
            with_hole[0].exterior(),
            Coord { x: 23.0, y: 3.0 }
        ));
    }

    #[test]
    fn dangling_outer_is_rejected() {
        let src = source(&[(1, &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0)])]);
        let members = vec![way_member(1, "outer")];
        assert!(matches!(
            assemble(&src, &members),
            Err(AssembleError::NoValidOuter)
        ));
    }

    #[test]
    fn missing_member_way_is_skipped() {
        let src = source(&[(
            1,
            &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)],
        )]);
        let members = vec![way_member(1, "outer"), way_member(99, "outer")];

        let mp = assemble(&src, &members).expect("closed ring from present way");
        assert_eq!(mp.0.len(), 1);
    }

    #[test]
    fn non_way_and_unroled_members_are_ignored() {
        let src = source(&[(
            1,
            &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)],
        )]);
        let members = vec![
            way_member(1, "outer"),
            Member {
                id: 5,
                kind: MemberKind::Node,
                role: "admin_centre".to_owned(),
            },
            way_member(1, "label"),
        ];

        let mp = assemble(&src, &members).expect("single outer");
        assert_eq!(mp.0.len(), 1);
    }

    #[test]
    fn centroid_of_square_is_center() {
        let ring = LineString(
            [(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0), (0.0, 0.0)]
                .iter()
                .map(|&(x, y)| Coord { x, y })
                .collect(),
        );
        let c = ring_centroid(&ring).expect("centroid");
        assert!((c.x - 1.0).abs() < 1e-12);
        assert!((c.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn signed_area_orientation() {
        let ccw = [
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 1.0, y: 1.0 },
            Coord { x: 0.0, y: 0.0 },
        ];
        assert!(ring_is_ccw(&ccw));
        let mut cw = ccw;
        cw.reverse();
        assert!(!ring_is_ccw(&cw));
    }
}
