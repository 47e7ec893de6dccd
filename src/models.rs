use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Source priority used at query tie-break: a building beats a road point,
/// a road point beats an area fill point.
pub const WEIGHT_BUILDING: u8 = 10;
pub const WEIGHT_ROAD: u8 = 5;
pub const WEIGHT_AREA: u8 = 3;

/// One reverse-geocoding answer. All strings may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    pub street: String,
    pub house_number: String,
    pub city: String,
    pub region: String,
    #[serde(skip)]
    pub weight: u8,
}

/// A generated address point. `x` is longitude and `y` is latitude; the
/// query engine swaps its `(lat, lon)` arguments to match.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPoint {
    pub x: f64,
    pub y: f64,
    pub info: Info,
}

impl GeoPoint {
    /// Total order used to canonicalize the point list before it is written
    /// out; exact duplicates become adjacent and are dropped.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        self.x
            .total_cmp(&other.x)
            .then_with(|| self.y.total_cmp(&other.y))
            .then_with(|| self.info.name.cmp(&other.info.name))
            .then_with(|| self.info.street.cmp(&other.info.street))
            .then_with(|| self.info.house_number.cmp(&other.info.house_number))
            .then_with(|| self.info.city.cmp(&other.info.city))
            .then_with(|| self.info.region.cmp(&other.info.region))
            .then_with(|| self.info.weight.cmp(&other.info.weight))
    }
}

/// Sorts by the canonical key and drops exact `(x, y, info)` duplicates.
pub fn dedup_points(points: &mut Vec<GeoPoint>) {
    points.sort_by(GeoPoint::cmp_canonical);
    points.dedup_by(|a, b| a.x == b.x && a.y == b.y && a.info == b.info);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f64, y: f64, name: &str) -> GeoPoint {
        GeoPoint {
            x,
            y,
            info: Info {
                name: name.to_owned(),
                ..Info::default()
            },
        }
    }

    #[test]
    fn dedup_drops_exact_duplicates_only() {
        let mut points = vec![
            point(1.0, 2.0, "a"),
            point(1.0, 2.0, "a"),
            point(1.0, 2.0, "b"),
            point(0.5, 2.0, "a"),
        ];
        dedup_points(&mut points);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].x, 0.5);
    }

    #[test]
    fn weight_is_not_serialized_to_json() {
        let info = Info {
            name: "x".to_owned(),
            weight: WEIGHT_BUILDING,
            ..Info::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("weight").is_none());
        assert_eq!(json.get("name").and_then(|v| v.as_str()), Some("x"));
    }
}
