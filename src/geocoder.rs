//! Serving-side query engine: loads an artifact and answers nearest-address
//! lookups.

use std::path::Path;

use crate::artifact::{self, ArtifactError, Metadata};
use crate::kdbush::{KdBush, Point, DEFAULT_NODE_SIZE};
use crate::models::{GeoPoint, Info};

/// Search radius in decimal degrees, roughly one kilometer at mid latitudes.
const MAX_RADIUS: f64 = 0.01;

/// A tighter cut-off exists as a tunable but stays disabled: stopping the
/// scan at the first "close enough" candidate would make results depend on
/// traversal order.
#[allow(dead_code)]
const THRESHOLD_RADIUS: f64 = 1e-7;

#[derive(Debug, thiserror::Error)]
pub enum GeocoderError {
    #[error("failed to load points file: {0}")]
    Artifact(#[from] ArtifactError),
}

pub struct RGeocoder {
    tree: KdBush<Info>,
    metadata: Metadata,
}

impl RGeocoder {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, GeocoderError> {
        let (points, metadata) = artifact::load_from_path(path)?;
        tracing::info!(
            count = points.len(),
            locale = %metadata.locale,
            version = metadata.version,
            "loaded points file"
        );
        Ok(Self::from_points_with_metadata(points, metadata))
    }

    pub fn from_points(points: Vec<GeoPoint>) -> Self {
        Self::from_points_with_metadata(points, Metadata::default())
    }

    fn from_points_with_metadata(points: Vec<GeoPoint>, metadata: Metadata) -> Self {
        let points = points
            .into_iter()
            .map(|p| Point {
                x: p.x,
                y: p.y,
                data: p.info,
            })
            .collect();
        Self {
            tree: KdBush::new(points, DEFAULT_NODE_SIZE),
            metadata,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The most plausible address near `(lat, lon)`, or `None` when nothing
    /// lies within the search radius. Internally points are `(x=lon,
    /// y=lat)`, so the arguments swap on entry.
    pub fn find(&self, lat: f64, lon: f64) -> Option<Info> {
        let mut best: Option<(f64, Info)> = None;

        self.tree.within(lon, lat, MAX_RADIUS, |p| {
            let dist = sq_dist(lon, lat, p.x, p.y);
            best = match best.take() {
                None => Some((dist, p.data.clone())),
                Some((best_dist, best_info)) => {
                    if dist < best_dist || p.data.weight > best_info.weight {
                        Some((dist, p.data.clone()))
                    } else {
                        Some((best_dist, best_info))
                    }
                }
            };
            true
        });

        best.map(|(_, info)| info)
    }
}

fn sq_dist(x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    let dx = x1 - x2;
    let dy = y1 - y2;
    dx * dx + dy * dy
}
