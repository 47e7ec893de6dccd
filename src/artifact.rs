//! The on-disk artifact: a framed, versioned container for generated
//! address points.
//!
//! Layout: 8-byte magic, little-endian compatibility level, length-prefixed
//! protobuf header listing the sizes of every following section, then
//! metadata, three deduplicated string tables, and point chunks of at most
//! [`POINTS_CHUNK`] entries each. Streams that do not start with the magic
//! are read through the legacy decoder (one self-delimited blob with all
//! strings inline); writers never produce that form.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use prost::Message;

use crate::models::{dedup_points, GeoPoint, Info};

const MAGIC: &[u8; 8] = b"RGEOCACH";
pub const COMPAT_LEVEL: u32 = 2;
/// Level 1 files used an incompatible chunk framing; they are rejected, not
/// migrated.
const TOMBSTONE_LEVEL: u32 = 1;
const POINTS_CHUNK: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("unsupported compatibility level {0}")]
    UnsupportedLevel(u32),
    #[error("artifact truncated while reading {0}")]
    Truncated(&'static str),
    #[error("point references string index {index} outside the {table} table")]
    BadStringIndex { table: &'static str, index: u32 },
}

/// Artifact-level metadata, exposed to callers after load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub version: u32,
    pub locale: String,
    /// RFC3339 creation timestamp.
    pub date_created: String,
}

mod wire {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Header {
        #[prost(uint32, tag = "1")]
        pub metadata_size: u32,
        #[prost(uint32, tag = "2")]
        pub strings_cache_size: u32,
        #[prost(uint32, repeated, tag = "3")]
        pub points_blob_sizes: Vec<u32>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Metadata {
        #[prost(uint32, tag = "1")]
        pub version: u32,
        #[prost(string, tag = "2")]
        pub locale: String,
        #[prost(string, tag = "3")]
        pub date_created: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct StringsCache {
        #[prost(string, repeated, tag = "1")]
        pub streets: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub cities: Vec<String>,
        #[prost(string, repeated, tag = "3")]
        pub regions: Vec<String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Point {
        #[prost(double, tag = "1")]
        pub latitude: f64,
        #[prost(double, tag = "2")]
        pub longitude: f64,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(uint32, tag = "4")]
        pub street: u32,
        #[prost(string, tag = "5")]
        pub house_number: String,
        #[prost(uint32, tag = "6")]
        pub city: u32,
        #[prost(uint32, tag = "7")]
        pub region: u32,
        #[prost(uint32, tag = "8")]
        pub weight: u32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PointsBlob {
        #[prost(message, repeated, tag = "1")]
        pub points: Vec<Point>,
    }

    /// Pre-magic stream layout: every string inline, no weight.
    #[derive(Clone, PartialEq, Message)]
    pub struct LegacyPoint {
        #[prost(double, tag = "1")]
        pub latitude: f64,
        #[prost(double, tag = "2")]
        pub longitude: f64,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, tag = "4")]
        pub street: String,
        #[prost(string, tag = "5")]
        pub house_number: String,
        #[prost(string, tag = "6")]
        pub city: String,
        #[prost(string, tag = "7")]
        pub region: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct LegacyPoints {
        #[prost(message, repeated, tag = "1")]
        pub points: Vec<LegacyPoint>,
    }
}

/// Insertion-ordered string interner backing one string table.
#[derive(Default)]
struct Intern {
    map: HashMap<String, u32>,
    list: Vec<String>,
}

impl Intern {
    fn add(&mut self, value: &str) -> u32 {
        if let Some(&i) = self.map.get(value) {
            return i;
        }
        let i = self.list.len() as u32;
        self.map.insert(value.to_owned(), i);
        self.list.push(value.to_owned());
        i
    }
}

/// Canonicalizes (sort + dedup) and writes the points.
pub fn write_points(
    w: &mut impl Write,
    points: &mut Vec<GeoPoint>,
    meta: &Metadata,
) -> Result<(), ArtifactError> {
    dedup_points(points);

    let mut streets = Intern::default();
    let mut cities = Intern::default();
    let mut regions = Intern::default();

    let mut wire_points = Vec::with_capacity(points.len());
    for p in points.iter() {
        wire_points.push(wire::Point {
            latitude: p.y,
            longitude: p.x,
            name: p.info.name.clone(),
            street: streets.add(&p.info.street),
            house_number: p.info.house_number.clone(),
            city: cities.add(&p.info.city),
            region: regions.add(&p.info.region),
            weight: u32::from(p.info.weight),
        });
    }

    let strings = wire::StringsCache {
        streets: streets.list,
        cities: cities.list,
        regions: regions.list,
    };
    let strings_bytes = strings.encode_to_vec();

    let metadata = wire::Metadata {
        version: meta.version,
        locale: meta.locale.clone(),
        date_created: meta.date_created.clone(),
    };
    let metadata_bytes = metadata.encode_to_vec();

    let mut blobs = Vec::new();
    for chunk in wire_points.chunks(POINTS_CHUNK) {
        let blob = wire::PointsBlob {
            points: chunk.to_vec(),
        };
        blobs.push(blob.encode_to_vec());
    }

    let header = wire::Header {
        metadata_size: metadata_bytes.len() as u32,
        strings_cache_size: strings_bytes.len() as u32,
        points_blob_sizes: blobs.iter().map(|b| b.len() as u32).collect(),
    };
    let header_bytes = header.encode_to_vec();

    w.write_all(MAGIC)?;
    w.write_all(&COMPAT_LEVEL.to_le_bytes())?;
    w.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    w.write_all(&header_bytes)?;
    w.write_all(&metadata_bytes)?;
    w.write_all(&strings_bytes)?;
    for blob in &blobs {
        w.write_all(blob)?;
    }
    Ok(())
}

pub fn read_points(r: &mut impl Read) -> Result<(Vec<GeoPoint>, Metadata), ArtifactError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| ArtifactError::Truncated("magic"))?;

    if &magic != MAGIC {
        return read_legacy(&magic, r);
    }

    let level = read_u32(r, "compatibility level")?;
    if level == TOMBSTONE_LEVEL || level != COMPAT_LEVEL {
        return Err(ArtifactError::UnsupportedLevel(level));
    }

    let header_len = read_u32(r, "header length")?;
    let header = wire::Header::decode(read_section(r, header_len, "header")?.as_slice())?;
    let metadata =
        wire::Metadata::decode(read_section(r, header.metadata_size, "metadata")?.as_slice())?;
    let strings = wire::StringsCache::decode(
        read_section(r, header.strings_cache_size, "strings cache")?.as_slice(),
    )?;

    let mut points = Vec::new();
    for &size in &header.points_blob_sizes {
        let blob = wire::PointsBlob::decode(read_section(r, size, "points blob")?.as_slice())?;
        for p in blob.points {
            points.push(GeoPoint {
                x: p.longitude,
                y: p.latitude,
                info: Info {
                    name: p.name,
                    street: table_get(&strings.streets, p.street, "streets")?,
                    house_number: p.house_number,
                    city: table_get(&strings.cities, p.city, "cities")?,
                    region: table_get(&strings.regions, p.region, "regions")?,
                    weight: p.weight.min(u32::from(u8::MAX)) as u8,
                },
            });
        }
    }

    Ok((
        points,
        Metadata {
            version: metadata.version,
            locale: metadata.locale,
            date_created: metadata.date_created,
        },
    ))
}

/// Decodes a stream that predates the magic-prefixed container: the bytes
/// already consumed while sniffing the magic are prepended back.
fn read_legacy(
    consumed: &[u8],
    r: &mut impl Read,
) -> Result<(Vec<GeoPoint>, Metadata), ArtifactError> {
    let mut data = consumed.to_vec();
    r.read_to_end(&mut data)?;

    let blob = wire::LegacyPoints::decode(data.as_slice())?;
    let points = blob
        .points
        .into_iter()
        .map(|p| GeoPoint {
            x: p.longitude,
            y: p.latitude,
            info: Info {
                name: p.name,
                street: p.street,
                house_number: p.house_number,
                city: p.city,
                region: p.region,
                weight: 0,
            },
        })
        .collect();

    Ok((points, Metadata::default()))
}

pub fn save_to_path(
    path: impl AsRef<Path>,
    points: &mut Vec<GeoPoint>,
    meta: &Metadata,
) -> Result<(), ArtifactError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);
    write_points(&mut writer, points, meta)?;
    writer.flush()?;
    Ok(())
}

/// Opens an artifact file; a `.zst` suffix selects transparent
/// decompression, the codec itself is compression-agnostic.
pub fn load_from_path(
    path: impl AsRef<Path>,
) -> Result<(Vec<GeoPoint>, Metadata), ArtifactError> {
    let path = path.as_ref();
    let file = File::open(path)?;

    if path.extension().is_some_and(|ext| ext == "zst") {
        let mut reader = BufReader::new(zstd::stream::read::Decoder::new(file)?);
        read_points(&mut reader)
    } else {
        let mut reader = BufReader::new(file);
        read_points(&mut reader)
    }
}

fn read_u32(r: &mut impl Read, what: &'static str) -> Result<u32, ArtifactError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| ArtifactError::Truncated(what))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_section(
    r: &mut impl Read,
    size: u32,
    what: &'static str,
) -> Result<Vec<u8>, ArtifactError> {
    let mut buf = vec![0u8; size as usize];
    r.read_exact(&mut buf)
        .map_err(|_| ArtifactError::Truncated(what))?;
    Ok(buf)
}

fn table_get(table: &[String], index: u32, name: &'static str) -> Result<String, ArtifactError> {
    table
        .get(index as usize)
        .cloned()
        .ok_or(ArtifactError::BadStringIndex { table: name, index })
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::models::WEIGHT_BUILDING;

    fn sample_points(n: usize) -> Vec<GeoPoint> {
        (0..n)
            .map(|i| GeoPoint {
                x: i as f64 * 0.001,
                y: 50.0 + i as f64 * 0.001,
                info: Info {
                    name: format!("building {i}"),
                    street: format!("street {}", i % 7),
                    house_number: format!("{i}"),
                    city: format!("city {}", i % 3),
                    region: "region".to_owned(),
                    weight: WEIGHT_BUILDING,
                },
            })
            .collect()
    }

    #[test]
    fn round_trip_preserves_points_and_metadata() {
        let mut points = sample_points(2345);
        let meta = Metadata {
            version: 7,
            locale: "en".to_owned(),
            date_created: "2024-01-02T03:04:05Z".to_owned(),
        };

        let mut buf = Vec::new();
        write_points(&mut buf, &mut points, &meta).unwrap();

        let (loaded, loaded_meta) = read_points(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded.len(), 2345);
        assert_eq!(loaded, points);
    }

    #[test]
    fn duplicates_are_compacted_before_write() {
        let mut points = sample_points(10);
        points.extend(sample_points(10));

        let mut buf = Vec::new();
        write_points(&mut buf, &mut points, &Metadata::default()).unwrap();

        let (loaded, _) = read_points(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.len(), 10);
    }

    #[test]
    fn string_tables_are_deduplicated() {
        let mut points = sample_points(1000);
        let mut buf = Vec::new();
        write_points(&mut buf, &mut points, &Metadata::default()).unwrap();

        // Decode the raw strings section and check table sizes.
        let mut r = buf.as_slice();
        let mut skip = [0u8; 12];
        r.read_exact(&mut skip).unwrap();
        let header_len = read_u32(&mut r, "header length").unwrap();
        let header =
            wire::Header::decode(read_section(&mut r, header_len, "header").unwrap().as_slice())
                .unwrap();
        read_section(&mut r, header.metadata_size, "metadata").unwrap();
        let strings = wire::StringsCache::decode(
            read_section(&mut r, header.strings_cache_size, "strings")
                .unwrap()
                .as_slice(),
        )
        .unwrap();

        assert_eq!(strings.streets.len(), 7);
        assert_eq!(strings.cities.len(), 3);
        assert_eq!(strings.regions.len(), 1);
        // 1000 points fit exactly one chunk.
        assert_eq!(header.points_blob_sizes.len(), 1);
    }

    #[test]
    fn chunking_splits_every_thousand_points() {
        let mut points = sample_points(2001);
        let mut buf = Vec::new();
        write_points(&mut buf, &mut points, &Metadata::default()).unwrap();

        let mut r = buf.as_slice();
        let mut skip = [0u8; 12];
        r.read_exact(&mut skip).unwrap();
        let header_len = read_u32(&mut r, "header length").unwrap();
        let header =
            wire::Header::decode(read_section(&mut r, header_len, "header").unwrap().as_slice())
                .unwrap();
        assert_eq!(header.points_blob_sizes.len(), 3);
    }

    #[test]
    fn tombstone_level_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        let err = read_points(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedLevel(1)));
    }

    #[test]
    fn unknown_level_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&9u32.to_le_bytes());
        let err = read_points(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedLevel(9)));
    }

    #[test]
    fn legacy_stream_without_magic_is_accepted() {
        let legacy = wire::LegacyPoints {
            points: vec![wire::LegacyPoint {
                latitude: 51.5,
                longitude: -0.12,
                name: "old".to_owned(),
                street: "Fleet Street".to_owned(),
                house_number: "1".to_owned(),
                city: "London".to_owned(),
                region: "Greater London".to_owned(),
            }],
        };
        let bytes = legacy.encode_to_vec();

        let (points, meta) = read_points(&mut bytes.as_slice()).unwrap();
        assert_eq!(meta, Metadata::default());
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].x, -0.12);
        assert_eq!(points[0].y, 51.5);
        assert_eq!(points[0].info.street, "Fleet Street");
        assert_eq!(points[0].info.weight, 0);
    }

    #[test]
    fn truncated_artifact_reports_section() {
        let mut points = sample_points(5);
        let mut buf = Vec::new();
        write_points(&mut buf, &mut points, &Metadata::default()).unwrap();
        buf.truncate(buf.len() - 3);

        let err = read_points(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ArtifactError::Truncated("points blob")));
    }

    #[test]
    fn zst_suffix_selects_decompression() {
        let mut points = sample_points(50);
        let meta = Metadata {
            version: 1,
            locale: String::new(),
            date_created: String::new(),
        };
        let mut raw = Vec::new();
        write_points(&mut raw, &mut points, &meta).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.rgc.zst");
        let compressed = zstd::stream::encode_all(raw.as_slice(), 3).unwrap();
        std::fs::write(&path, compressed).unwrap();

        let (loaded, loaded_meta) = load_from_path(&path).unwrap();
        assert_eq!(loaded, points);
        assert_eq!(loaded_meta, meta);
    }
}
