//! Two-stage parallel pipeline turning a PBF block database into the
//! deduplicated address-point list.
//!
//! Stage one walks relations and fills the place/region border indices plus
//! the name-localization cache. Stage two classifies every object into
//! buildings, highways and protected areas and projects each onto one or
//! more address-bearing points. Relations run before the way feed so member
//! ways are marked as consumed before the top-level pass reaches them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use geo_types::{Coord, LineString, MultiPolygon};
use rand::Rng;
use rayon::iter::{ParallelBridge, ParallelIterator};

use crate::artifact::{self, ArtifactError, Metadata};
use crate::border::BorderTree;
use crate::database::{Database, DbError};
use crate::models::{GeoPoint, Info, WEIGHT_AREA, WEIGHT_BUILDING, WEIGHT_ROAD};
use crate::osm::{MemberKind, Node, ObjectId, Relation, Tags, Way};
use crate::polygon::{
    self, bounding_rect, multi_polygon_contains, ring_centroid, LineSource,
};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Minimum separation, in decimal degrees, between interior fill points of
/// a protected area.
const AREA_FILL_DISTANCE: f64 = 0.01;
const POISSON_ATTEMPTS: usize = 10;

const CACHEABLE_PLACES: [&str; 6] = [
    "city",
    "town",
    "village",
    "hamlet",
    "isolated_dwelling",
    "farm",
];
const REGION_ADMIN_LEVEL: &str = "4";
const HIGHWAY_CLASSES: [&str; 5] = ["motorway", "trunk", "primary", "secondary", "tertiary"];

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("failed to write points file: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub threads: usize,
    /// Language code preferred for names, e.g. `"en"`; empty keeps the
    /// canonical `name` tags.
    pub preferred_localization: String,
    /// Spacing between resampled highway points, meters of great-circle
    /// distance.
    pub highway_spacing_m: f64,
    /// Version stamped into the artifact metadata.
    pub version: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            preferred_localization: String::new(),
            highway_spacing_m: 100.0,
            version: 1,
        }
    }
}

/// Receives coarse progress events from the pipeline. The CLI plugs in a
/// progress bar; everything else uses the silent default.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _stage: &str, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn finish(&self) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Cooperative cancellation flag; workers observe it between items.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Test-and-insert set over feature ids, shared between workers.
#[derive(Default)]
struct IdSet(RwLock<HashSet<ObjectId>>);

impl IdSet {
    /// True when the id was not present before.
    fn insert_new(&self, id: ObjectId) -> bool {
        self.0.write().unwrap().insert(id)
    }
}

#[derive(Default)]
struct LocalizationCache(RwLock<HashMap<String, String>>);

impl LocalizationCache {
    fn get(&self, name: &str) -> Option<String> {
        self.0.read().unwrap().get(name).cloned()
    }

    fn insert(&self, name: String, localized: String) {
        self.0.write().unwrap().insert(name, localized);
    }
}

/// The polygon indices and localization cache built in stage one and
/// consulted while points are emitted. Dropped wholesale by
/// [`Generator::reset_caches`].
struct Caches {
    preferred: String,
    place_index: BorderTree<String>,
    region_index: BorderTree<String>,
    localizations: LocalizationCache,
}

impl Caches {
    fn new(preferred: String) -> Self {
        Self {
            preferred,
            place_index: BorderTree::new(),
            region_index: BorderTree::new(),
            localizations: LocalizationCache::default(),
        }
    }

    /// Records `name -> name:<loc>` when both are present and differ.
    fn cache_localization(&self, tags: &Tags) {
        if self.preferred.is_empty() {
            return;
        }
        let official = tags.find("name");
        let localized = tags.find(&format!("name:{}", self.preferred));
        if !official.is_empty() && !localized.is_empty() && official != localized {
            self.localizations
                .insert(official.to_owned(), localized.to_owned());
        }
    }

    /// Localization cascade for a plain tag key: explicit `<key>:<loc>` tag,
    /// then the cross-object cache, then the canonical value.
    fn localized(&self, tags: &Tags, key: &str) -> String {
        let name = tags.find(key);
        if self.preferred.is_empty() {
            return name.to_owned();
        }

        if let Some(localized) = tags.get(&format!("{key}:{}", self.preferred)) {
            if !localized.is_empty() {
                return localized.to_owned();
            }
        }
        if let Some(localized) = self.localizations.get(name) {
            return localized;
        }
        name.to_owned()
    }

    /// Like [`Caches::localized`] for `addr:city`, with one extra rung: an
    /// object without the tag borrows the enclosing place polygon's label,
    /// re-localized through the cache.
    fn localized_city(&self, tags: &Tags, point: Coord) -> String {
        let name = tags.find("addr:city");

        if self.preferred.is_empty() {
            if !name.is_empty() {
                return name.to_owned();
            }
            return self.place_index.query(point).unwrap_or_default();
        }

        if let Some(localized) = tags.get(&format!("addr:city:{}", self.preferred)) {
            if !localized.is_empty() {
                return localized.to_owned();
            }
        }
        if let Some(localized) = self.localizations.get(name) {
            return localized;
        }
        if let Some(place) = self.place_index.query(point) {
            return self.localizations.get(&place).unwrap_or(place);
        }
        name.to_owned()
    }

    fn localized_region(&self, point: Coord) -> String {
        match self.region_index.query(point) {
            Some(region) => self.localizations.get(&region).unwrap_or(region),
            None => String::new(),
        }
    }
}

pub struct Generator {
    db: Database,
    config: GeneratorConfig,
    caches: Caches,
    parsed_ways: IdSet,
    parsed_relations: IdSet,
    points: Mutex<Vec<GeoPoint>>,
    cancel: CancelToken,
    progress: Arc<dyn ProgressSink>,
    pool: rayon::ThreadPool,
}

impl Generator {
    pub fn new(db: Database, config: GeneratorConfig) -> Result<Self, GeneratorError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()?;
        Ok(Self {
            db,
            caches: Caches::new(config.preferred_localization.clone()),
            config,
            parsed_ways: IdSet::default(),
            parsed_relations: IdSet::default(),
            points: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            progress: Arc::new(NoProgress),
            pool,
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs both stages. Idempotent for unchanged inputs: rerunning appends
    /// only duplicates, which the canonical dedup removes at save time.
    pub fn parse(&self) -> Result<(), GeneratorError> {
        let counts = self.db.counts();
        {
            let mut points = self.points.lock().unwrap();
            let estimate = counts.ways as usize / 4;
            if points.capacity() < estimate {
                points.reserve(estimate);
            }
        }

        self.progress
            .begin("1/2 filling relation caches", counts.relations);
        self.pool.install(|| {
            self.db
                .iter_relations()
                .par_bridge()
                .try_for_each(|relation| {
                    if self.cancel.is_cancelled() {
                        return Err(GeneratorError::Cancelled);
                    }
                    self.cache_relation(&relation?);
                    self.progress.inc(1);
                    Ok(())
                })
        })?;
        self.progress.finish();

        tracing::info!(
            places = self.caches.place_index.len(),
            regions = self.caches.region_index.len(),
            "relation caches filled"
        );

        self.progress.begin(
            "2/2 generating points",
            counts.relations + counts.ways + counts.nodes,
        );
        self.pool.install(|| {
            self.db
                .iter_relations()
                .par_bridge()
                .try_for_each(|relation| {
                    if self.cancel.is_cancelled() {
                        return Err(GeneratorError::Cancelled);
                    }
                    self.parse_relation(&relation?);
                    self.progress.inc(1);
                    Ok(())
                })
        })?;
        self.pool.install(|| {
            self.db.iter_ways().par_bridge().try_for_each(|way| {
                if self.cancel.is_cancelled() {
                    return Err(GeneratorError::Cancelled);
                }
                self.parse_way(&way?);
                self.progress.inc(1);
                Ok(())
            })
        })?;
        self.pool.install(|| {
            self.db.iter_nodes().par_bridge().try_for_each(|node| {
                if self.cancel.is_cancelled() {
                    return Err(GeneratorError::Cancelled);
                }
                self.parse_node(&node?);
                self.progress.inc(1);
                Ok(())
            })
        })?;
        self.progress.finish();

        tracing::info!(points = self.points.lock().unwrap().len(), "generation done");
        Ok(())
    }

    /// Drops the polygon indices, localization cache and parsed-id sets.
    /// The point list survives.
    pub fn reset_caches(&mut self) {
        self.caches = Caches::new(self.config.preferred_localization.clone());
        self.parsed_ways = IdSet::default();
        self.parsed_relations = IdSet::default();
    }

    /// Canonicalizes the point list and writes the artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GeneratorError> {
        let meta = Metadata {
            version: self.config.version,
            locale: self.config.preferred_localization.clone(),
            date_created: chrono::Utc::now().to_rfc3339(),
        };
        let mut points = self.points.lock().unwrap();
        artifact::save_to_path(path, &mut points, &meta)?;
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    // Stage 1.

    fn cache_relation(&self, relation: &Relation) {
        let tags = &relation.tags;
        let kind = tags.find("type");
        let poly_type = kind == "multipolygon" || kind == "boundary";

        if poly_type && CACHEABLE_PLACES.contains(&tags.find("place")) {
            self.cache_area(relation, AreaIndex::Place);
        }
        if kind == "boundary" && tags.find("admin_level") == REGION_ADMIN_LEVEL {
            self.cache_area(relation, AreaIndex::Region);
        }
        if kind == "associatedStreet" || kind == "route" {
            self.caches.cache_localization(tags);
        }
    }

    fn cache_area(&self, relation: &Relation, target: AreaIndex) {
        let name = relation.tags.find("name");
        if name.is_empty() {
            return;
        }

        let mpoly = match polygon::assemble(&self.db, &relation.members) {
            Ok(mpoly) => mpoly,
            Err(err) => {
                tracing::error!(id = relation.id, name, %err, "failed to build boundary");
                return;
            }
        };
        let Some(rect) = bounding_rect(&mpoly) else {
            tracing::warn!(id = relation.id, name, "empty boundary polygon");
            return;
        };
        if rect.min() == rect.max() {
            tracing::warn!(id = relation.id, name, "zero-bound boundary polygon");
            return;
        }

        self.caches.cache_localization(&relation.tags);
        let label = self.caches.localized(&relation.tags, "name");
        match target {
            AreaIndex::Place => self.caches.place_index.insert(label, mpoly),
            AreaIndex::Region => self.caches.region_index.insert(label, mpoly),
        }
    }

    // Stage 2.

    fn parse_node(&self, node: &Node) {
        if !is_building(&node.tags) {
            return;
        }
        let point = Coord {
            x: node.lon,
            y: node.lat,
        };
        self.push_points([GeoPoint {
            x: point.x,
            y: point.y,
            info: self.info_for(&node.tags, point, WEIGHT_BUILDING),
        }]);
    }

    fn parse_way(&self, way: &Way) {
        if !self.parsed_ways.insert_new(ObjectId::way(way.id).feature()) {
            return;
        }

        if is_building(&way.tags) {
            let line = self.db.line_of(way);
            let Some(center) = ring_centroid(&line) else {
                tracing::warn!(id = way.id, "no center for building way");
                return;
            };
            self.push_points([GeoPoint {
                x: center.x,
                y: center.y,
                info: self.info_for(&way.tags, center, WEIGHT_BUILDING),
            }]);
        } else if HIGHWAY_CLASSES.contains(&way.tags.find("highway")) {
            let line = self.db.line_of(way);
            self.push_road_points(&way.tags, &line);
        }
    }

    fn parse_relation(&self, relation: &Relation) {
        if !self
            .parsed_relations
            .insert_new(ObjectId::relation(relation.id).feature())
        {
            return;
        }

        let tags = &relation.tags;
        if is_building(tags) {
            if tags.find("type") == "multipolygon" {
                self.parse_relation_building(relation);
            }
        } else if is_national_road(tags) {
            self.parse_relation_road(relation);
        } else if is_protected_area(tags) {
            self.parse_relation_area(relation);
        }
    }

    /// One point per polygon of the building's multipolygon outline.
    fn parse_relation_building(&self, relation: &Relation) {
        let mpoly = match polygon::assemble(&self.db, &relation.members) {
            Ok(mpoly) => mpoly,
            Err(err) => {
                tracing::error!(id = relation.id, %err, "failed to build building outline");
                return;
            }
        };

        let mut points = Vec::with_capacity(mpoly.0.len());
        for poly in &mpoly.0 {
            let Some(center) = ring_centroid(poly.exterior()) else {
                continue;
            };
            points.push(GeoPoint {
                x: center.x,
                y: center.y,
                info: self.info_for(&relation.tags, center, WEIGHT_BUILDING),
            });
        }
        self.push_points(points);
    }

    fn parse_relation_road(&self, relation: &Relation) {
        for member in &relation.members {
            if member.kind != MemberKind::Way {
                continue;
            }
            // Mark the member consumed before the top-level way feed can
            // emit it a second time.
            self.parsed_ways.insert_new(ObjectId::way(member.id).feature());

            if let Some(line) = self.db.way_line(member.id) {
                self.push_road_points(&relation.tags, &line);
            }
        }
    }

    fn parse_relation_area(&self, relation: &Relation) {
        let mpoly = match polygon::assemble(&self.db, &relation.members) {
            Ok(mpoly) => mpoly,
            Err(err) => {
                tracing::error!(id = relation.id, %err, "failed to build protected area");
                return;
            }
        };

        let fill = poisson_fill(&mpoly, AREA_FILL_DISTANCE);
        let points: Vec<GeoPoint> = fill
            .into_iter()
            .map(|p| GeoPoint {
                x: p.x,
                y: p.y,
                info: self.info_for(&relation.tags, p, WEIGHT_AREA),
            })
            .collect();
        self.push_points(points);
    }

    fn push_road_points(&self, tags: &Tags, line: &LineString) {
        let name = self.highway_name(tags);
        let points: Vec<GeoPoint> = resample_line(line, self.config.highway_spacing_m)
            .into_iter()
            .map(|p| {
                let mut info = self.info_for(tags, p, WEIGHT_ROAD);
                info.name = name.clone();
                GeoPoint {
                    x: p.x,
                    y: p.y,
                    info,
                }
            })
            .collect();
        self.push_points(points);
    }

    fn info_for(&self, tags: &Tags, point: Coord, weight: u8) -> Info {
        Info {
            name: self.caches.localized(tags, "name"),
            street: self.caches.localized(tags, "addr:street"),
            house_number: tags.find("addr:housenumber").to_owned(),
            city: self.caches.localized_city(tags, point),
            region: self.caches.localized_region(point),
            weight,
        }
    }

    /// Road names carry the route reference when present: `"M4 Great West
    /// Road"`.
    fn highway_name(&self, tags: &Tags) -> String {
        let reference = tags.find("ref");
        let name = self.caches.localized(tags, "name");
        match (reference.is_empty(), name.is_empty()) {
            (false, false) => format!("{reference} {name}"),
            (false, true) => reference.to_owned(),
            _ => name,
        }
    }

    fn push_points(&self, points: impl IntoIterator<Item = GeoPoint>) {
        let mut guard = self.points.lock().unwrap();
        guard.extend(points);
    }
}

enum AreaIndex {
    Place,
    Region,
}

fn is_building(tags: &Tags) -> bool {
    !tags.find("addr:housenumber").is_empty()
        && !tags.find("addr:street").is_empty()
        && !tags.find("building").is_empty()
}

fn is_national_road(tags: &Tags) -> bool {
    tags.find("route") == "road"
        && tags.find("type") == "route"
        && tags.find("network").contains("national")
}

fn is_protected_area(tags: &Tags) -> bool {
    tags.find("boundary") == "protected_area" && tags.find("type") == "boundary"
}

fn haversine_m(a: Coord, b: Coord) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let dlat = (b.y - a.y).to_radians();
    let dlon = (b.x - a.x).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();

    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    2.0 * EARTH_RADIUS_KM * 1000.0 * h.sqrt().asin()
}

/// Walks the polyline and emits a vertex every `spacing_m` meters of
/// great-circle distance, starting with the first point. Intermediate
/// positions interpolate linearly within a segment.
fn resample_line(line: &LineString, spacing_m: f64) -> Vec<Coord> {
    let pts = &line.0;
    if pts.is_empty() || spacing_m <= 0.0 {
        return Vec::new();
    }

    let mut out = vec![pts[0]];
    let mut carried = 0.0;
    for pair in pts.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let seg = haversine_m(a, b);
        if seg <= 0.0 {
            continue;
        }

        let mut along = spacing_m - carried;
        while along <= seg {
            let t = along / seg;
            out.push(Coord {
                x: a.x + (b.x - a.x) * t,
                y: a.y + (b.y - a.y) * t,
            });
            along += spacing_m;
        }
        carried = (carried + seg) % spacing_m;
    }
    out
}

/// Bridson Poisson-disc sampling over the shape's bounding box, keeping the
/// samples that land inside the multipolygon. `r` is the minimum pairwise
/// separation.
fn poisson_fill(shape: &MultiPolygon, r: f64) -> Vec<Coord> {
    let Some(rect) = bounding_rect(shape) else {
        return Vec::new();
    };
    let (min, max) = (rect.min(), rect.max());
    let width = max.x - min.x;
    let height = max.y - min.y;
    if width <= 0.0 || height <= 0.0 {
        return Vec::new();
    }

    let cell = r / std::f64::consts::SQRT_2;
    let cols = (width / cell).ceil() as usize + 1;
    let rows = (height / cell).ceil() as usize + 1;
    let mut grid: Vec<Option<Coord>> = vec![None; cols * rows];
    let grid_at = |p: Coord| -> (usize, usize) {
        let cx = (((p.x - min.x) / cell) as usize).min(cols - 1);
        let cy = (((p.y - min.y) / cell) as usize).min(rows - 1);
        (cx, cy)
    };

    let mut rng = rand::rng();
    let mut samples = Vec::new();
    let mut active = Vec::new();

    let seed = Coord {
        x: rng.random_range(min.x..=max.x),
        y: rng.random_range(min.y..=max.y),
    };
    let (cx, cy) = grid_at(seed);
    grid[cy * cols + cx] = Some(seed);
    samples.push(seed);
    active.push(seed);

    let far_enough = |grid: &[Option<Coord>], p: Coord| -> bool {
        let (cx, cy) = grid_at(p);
        let x0 = cx.saturating_sub(2);
        let y0 = cy.saturating_sub(2);
        let x1 = (cx + 2).min(cols - 1);
        let y1 = (cy + 2).min(rows - 1);
        for gy in y0..=y1 {
            for gx in x0..=x1 {
                if let Some(q) = grid[gy * cols + gx] {
                    let dx = q.x - p.x;
                    let dy = q.y - p.y;
                    if dx * dx + dy * dy < r * r {
                        return false;
                    }
                }
            }
        }
        true
    };

    while !active.is_empty() {
        let pick = rng.random_range(0..active.len());
        let base = active[pick];

        let mut placed = false;
        for _ in 0..POISSON_ATTEMPTS {
            let angle = rng.random_range(0.0..std::f64::consts::TAU);
            let dist = rng.random_range(r..2.0 * r);
            let candidate = Coord {
                x: base.x + angle.cos() * dist,
                y: base.y + angle.sin() * dist,
            };
            if candidate.x < min.x
                || candidate.x > max.x
                || candidate.y < min.y
                || candidate.y > max.y
            {
                continue;
            }
            if !far_enough(&grid, candidate) {
                continue;
            }

            let (cx, cy) = grid_at(candidate);
            grid[cy * cols + cx] = Some(candidate);
            samples.push(candidate);
            active.push(candidate);
            placed = true;
            break;
        }

        if !placed {
            active.swap_remove(pick);
        }
    }

    samples
        .into_iter()
        .filter(|&p| multi_polygon_contains(shape, p))
        .collect()
}

#[cfg(test)]
mod tests {
    use geo_types::Polygon;

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().copied().collect()
    }

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
    fn building_requires_all_three_tags() {
        assert!(is_building(&tags(&[
            ("addr:housenumber", "1"),
            ("addr:street", "High Street"),
            ("building", "yes"),
        ])));
        assert!(!is_building(&tags(&[
            ("addr:housenumber", "1"),
            ("building", "yes"),
        ])));
        assert!(!is_building(&tags(&[
            ("addr:housenumber", "1"),
            ("addr:street", "High Street"),
        ])));
    }

    #[test]
    fn national_road_needs_network_substring() {
        assert!(is_national_road(&tags(&[
            ("route", "road"),
            ("type", "route"),
            ("network", "ru:national"),
        ])));
        assert!(!is_national_road(&tags(&[
            ("route", "road"),
            ("type", "route"),
            ("network", "regional"),
        ])));
        assert!(!is_national_road(&tags(&[
            ("route", "bicycle"),
            ("type", "route"),
            ("network", "national"),
        ])));
    }

    #[test]
    fn protected_area_classification() {
        assert!(is_protected_area(&tags(&[
            ("boundary", "protected_area"),
            ("type", "boundary"),
        ])));
        assert!(!is_protected_area(&tags(&[
            ("boundary", "administrative"),
            ("type", "boundary"),
        ])));
    }

    #[test]
    fn localization_cascade_order() {
        let caches = Caches::new("en".to_owned());
        caches
            .localizations
            .insert("Москва".to_owned(), "Moscow".to_owned());

        // 1. Explicit localized tag wins.
        let t = tags(&[("name", "Москва"), ("name:en", "Moscow City")]);
        assert_eq!(caches.localized(&t, "name"), "Moscow City");

        // 2. Cache applies when the tag is missing.
        let t = tags(&[("name", "Москва")]);
        assert_eq!(caches.localized(&t, "name"), "Moscow");

        // 3. Fallback to the canonical value.
        let t = tags(&[("name", "Тверь")]);
        assert_eq!(caches.localized(&t, "name"), "Тверь");

        // 4. Empty preferred localization bypasses everything.
        let plain = Caches::new(String::new());
        let t = tags(&[("name", "Москва"), ("name:en", "Moscow")]);
        assert_eq!(plain.localized(&t, "name"), "Москва");
    }

    #[test]
    fn city_falls_back_to_place_index() {
        let caches = Caches::new("en".to_owned());
        caches.place_index.insert("Лондон".to_owned(), square(0.0, 10.0));
        caches
            .localizations
            .insert("Лондон".to_owned(), "London".to_owned());

        // No addr:city tag: the enclosing place label, re-localized.
        let t = tags(&[]);
        assert_eq!(
            caches.localized_city(&t, Coord { x: 5.0, y: 5.0 }),
            "London"
        );

        // Outside every place polygon: canonical tag value (empty here).
        assert_eq!(caches.localized_city(&t, Coord { x: 50.0, y: 5.0 }), "");

        // Tagged city wins over the polygon.
        let t = tags(&[("addr:city", "Париж"), ("addr:city:en", "Paris")]);
        assert_eq!(caches.localized_city(&t, Coord { x: 5.0, y: 5.0 }), "Paris");
    }

    #[test]
    fn city_without_localization_uses_place_polygon() {
        let caches = Caches::new(String::new());
        caches
            .place_index
            .insert("Village".to_owned(), square(0.0, 1.0));

        let t = tags(&[]);
        assert_eq!(
            caches.localized_city(&t, Coord { x: 0.5, y: 0.5 }),
            "Village"
        );
        let t = tags(&[("addr:city", "Elsewhere")]);
        assert_eq!(
            caches.localized_city(&t, Coord { x: 0.5, y: 0.5 }),
            "Elsewhere"
        );
    }

    #[test]
    fn region_label_is_localized_through_cache() {
        let caches = Caches::new("en".to_owned());
        caches
            .region_index
            .insert("Московская область".to_owned(), square(0.0, 10.0));
        caches
            .localizations
            .insert("Московская область".to_owned(), "Moscow Oblast".to_owned());

        assert_eq!(
            caches.localized_region(Coord { x: 3.0, y: 3.0 }),
            "Moscow Oblast"
        );
        assert_eq!(caches.localized_region(Coord { x: 30.0, y: 3.0 }), "");
    }

    #[test]
    fn localization_pairs_require_both_names() {
        let caches = Caches::new("en".to_owned());
        caches.cache_localization(&tags(&[("name", "Москва"), ("name:en", "Moscow")]));
        caches.cache_localization(&tags(&[("name", "Тверь")]));
        caches.cache_localization(&tags(&[("name:en", "Nowhere")]));
        caches.cache_localization(&tags(&[("name", "Same"), ("name:en", "Same")]));

        assert_eq!(caches.localizations.get("Москва").as_deref(), Some("Moscow"));
        assert_eq!(caches.localizations.get("Тверь"), None);
        assert_eq!(caches.localizations.get("Same"), None);
    }

    #[test]
    fn resample_spaces_points_by_great_circle_distance() {
        // A meridian arc: one degree of latitude is ~111 km.
        let line = LineString(vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 0.0, y: 0.009 },
        ]);
        let total = haversine_m(line.0[0], line.0[1]);
        let points = resample_line(&line, 100.0);

        assert_eq!(points.len(), 1 + (total / 100.0).floor() as usize);
        assert_eq!(points[0], line.0[0]);
        for pair in points.windows(2) {
            let d = haversine_m(pair[0], pair[1]);
            assert!((d - 100.0).abs() < 1.0, "spacing was {d}");
        }
    }

    #[test]
    fn resample_carries_distance_across_vertices() {
        // Two short segments that only together reach the spacing.
        let line = LineString(vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 0.0, y: 0.0004 },
            Coord { x: 0.0, y: 0.0012 },
        ]);
        let points = resample_line(&line, 100.0);
        // ~133 m of line: the start point plus one sample at ~100 m.
        assert_eq!(points.len(), 2);
        let d = haversine_m(points[0], points[1]);
        assert!((d - 100.0).abs() < 1.0, "spacing was {d}");
    }

    #[test]
    fn poisson_fill_respects_separation_and_containment() {
        let shape = square(0.0, 1.0);
        let r = 0.05;
        let fill = poisson_fill(&shape, r);

        assert!(!fill.is_empty());
        for p in &fill {
            assert!(multi_polygon_contains(&shape, *p));
        }
        for (i, a) in fill.iter().enumerate() {
            for b in &fill[i + 1..] {
                let dx = a.x - b.x;
                let dy = a.y - b.y;
                assert!(
                    dx * dx + dy * dy >= r * r * 0.999,
                    "samples closer than r"
                );
            }
        }
    }

    #[test]
    fn poisson_fill_skips_hole_interiors() {
        let outer = LineString(vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 1.0, y: 1.0 },
            Coord { x: 0.0, y: 1.0 },
            Coord { x: 0.0, y: 0.0 },
        ]);
        let hole = LineString(vec![
            Coord { x: 0.3, y: 0.3 },
            Coord { x: 0.3, y: 0.7 },
            Coord { x: 0.7, y: 0.7 },
            Coord { x: 0.7, y: 0.3 },
            Coord { x: 0.3, y: 0.3 },
        ]);
        let shape = MultiPolygon(vec![Polygon::new(outer, vec![hole])]);

        for p in poisson_fill(&shape, 0.04) {
            assert!(
                !(p.x > 0.3 && p.x < 0.7 && p.y > 0.3 && p.y < 0.7),
                "sample inside the hole"
            );
        }
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
