//! Random access over OSM PBF files by object id.
//!
//! A single streaming pass indexes which file block every node, way and
//! relation lives in. Ids inside a block are grouped and monotone, so
//! consecutive `(id, offset)` pairs collapse into `(min_id, max_id, offset)`
//! windows; on realistic extracts this shrinks the index by about three
//! orders of magnitude versus one entry per object. Lookups binary-search
//! the windows, then decode the block through an LRU cache. Concurrent
//! misses on one block are coalesced so it is decoded exactly once.

use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use geo_types::{Coord, LineString};
use lru::LruCache;
use memmap2::Mmap;
use osmpbf::{BlobDecode, BlobReader, ByteOffset, PrimitiveBlock, RelMemberType};

use crate::osm::{Member, MemberKind, Node, Relation, Way};
use crate::polygon::LineSource;

const BLOCK_CACHE_SIZE: usize = 1024;

const SUPPORTED_FEATURES: [&str; 3] =
    ["OsmSchema-V0.6", "DenseNodes", "HistoricalInformation"];

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pbf decode error: {0}")]
    Pbf(#[from] osmpbf::Error),
    #[error("file requires unsupported feature {0:?}")]
    Capability(String),
    #[error("unexpected file block of type {0:?}")]
    UnknownBlockType(String),
    #[error("blob stream did not report a block offset")]
    UntrackedBlob,
    #[error("block offset {0} points past the end of the file")]
    TruncatedBlock(u32),
    #[error("object not found")]
    NotFound,
}

/// Exact object counts recorded while the index is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    min_id: i64,
    max_id: i64,
    offset: u32,
}

/// Sorted array of id windows; a plain binary search, no tree.
struct WinIndex {
    windows: Vec<Window>,
}

impl WinIndex {
    fn get(&self, id: i64) -> Option<u32> {
        let i = self.windows.partition_point(|w| w.max_id < id);
        let w = self.windows.get(i)?;
        (id >= w.min_id && id <= w.max_id).then_some(w.offset)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Default)]
struct WinIndexBuilder {
    current: Option<Window>,
    windows: Vec<Window>,
}

impl WinIndexBuilder {
    /// Ids must arrive in file order. A run of consecutive ids in one block
    /// extends the open window; anything else closes it.
    fn add(&mut self, id: i64, offset: u32) {
        match &mut self.current {
            Some(w) if w.max_id + 1 == id && w.offset == offset => w.max_id = id,
            _ => {
                if let Some(w) = self.current.take() {
                    self.windows.push(w);
                }
                self.current = Some(Window {
                    min_id: id,
                    max_id: id,
                    offset,
                });
            }
        }
    }

    fn build(mut self) -> WinIndex {
        if let Some(w) = self.current.take() {
            self.windows.push(w);
        }
        self.windows.sort_by_key(|w| w.min_id);
        WinIndex {
            windows: self.windows,
        }
    }
}

/// One decoded `OSMData` block, objects sorted by id for binary search.
#[derive(Default)]
pub(crate) struct DecodedBlock {
    nodes: Vec<Node>,
    ways: Vec<Way>,
    relations: Vec<Relation>,
}

/// Decoded-block LRU with a per-offset single-flight latch: under
/// contention only the thread holding the latch decodes, the rest wait and
/// then hit the cache.
struct BlockCache {
    lru: Mutex<LruCache<u32, Arc<DecodedBlock>>>,
    inflight: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_decode<F>(&self, offset: u32, decode: F) -> Result<Arc<DecodedBlock>, DbError>
    where
        F: FnOnce() -> Result<DecodedBlock, DbError>,
    {
        if let Some(block) = self.lru.lock().unwrap().get(&offset) {
            return Ok(block.clone());
        }

        let latch = self
            .inflight
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .clone();
        let _flight = latch.lock().unwrap();

        // Whoever held the latch before us may have published the block.
        if let Some(block) = self.lru.lock().unwrap().get(&offset) {
            return Ok(block.clone());
        }

        let result = decode();
        self.inflight.lock().unwrap().remove(&offset);
        let block = Arc::new(result?);
        self.lru.lock().unwrap().put(offset, block.clone());
        Ok(block)
    }
}

/// Block index over one memory-mapped PBF file.
pub struct FileDb {
    data: Mmap,
    node_index: WinIndex,
    way_index: WinIndex,
    relation_index: WinIndex,
    node_blocks: Vec<u32>,
    way_blocks: Vec<u32>,
    relation_blocks: Vec<u32>,
    counts: Counts,
    cache: BlockCache,
}

impl FileDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let file = File::open(path.as_ref())?;
        // Safety: the mapping is read-only and the file is treated as
        // immutable for the lifetime of the database.
        let data = unsafe { Mmap::map(&file)? };

        let mut node_builder = WinIndexBuilder::default();
        let mut way_builder = WinIndexBuilder::default();
        let mut relation_builder = WinIndexBuilder::default();
        let mut node_blocks = Vec::new();
        let mut way_blocks = Vec::new();
        let mut relation_blocks = Vec::new();
        let mut counts = Counts::default();

        let reader = BlobReader::new_seekable(Cursor::new(&data[..]))?;
        for blob in reader {
            let blob = blob?;
            let offset = blob.offset().map(|o| o.0 as u32).ok_or(DbError::UntrackedBlob)?;

            match blob.decode()? {
                BlobDecode::OsmHeader(header) => {
                    for feature in header.required_features() {
                        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
                            return Err(DbError::Capability(feature.clone()));
                        }
                    }
                }
                BlobDecode::OsmData(block) => {
                    for group in block.groups() {
                        for node in group.nodes() {
                            node_builder.add(node.id(), offset);
                            push_block(&mut node_blocks, offset);
                            counts.nodes += 1;
                        }
                        for node in group.dense_nodes() {
                            node_builder.add(node.id(), offset);
                            push_block(&mut node_blocks, offset);
                            counts.nodes += 1;
                        }
                        for way in group.ways() {
                            way_builder.add(way.id(), offset);
                            push_block(&mut way_blocks, offset);
                            counts.ways += 1;
                        }
                        for relation in group.relations() {
                            relation_builder.add(relation.id(), offset);
                            push_block(&mut relation_blocks, offset);
                            counts.relations += 1;
                        }
                    }
                }
                BlobDecode::Unknown(kind) => {
                    return Err(DbError::UnknownBlockType(kind.to_owned()));
                }
            }
        }

        tracing::debug!(
            nodes = counts.nodes,
            ways = counts.ways,
            relations = counts.relations,
            "indexed pbf file"
        );

        Ok(Self {
            data,
            node_index: node_builder.build(),
            way_index: way_builder.build(),
            relation_index: relation_builder.build(),
            node_blocks,
            way_blocks,
            relation_blocks,
            counts,
            cache: BlockCache::new(BLOCK_CACHE_SIZE),
        })
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    pub fn get_node(&self, id: i64) -> Result<Node, DbError> {
        let offset = self.node_index.get(id).ok_or(DbError::NotFound)?;
        let block = self.read_block(offset)?;
        match block.nodes.binary_search_by_key(&id, |n| n.id) {
            Ok(i) => Ok(block.nodes[i].clone()),
            Err(_) => Err(DbError::NotFound),
        }
    }

    pub fn get_way(&self, id: i64) -> Result<Way, DbError> {
        let offset = self.way_index.get(id).ok_or(DbError::NotFound)?;
        let block = self.read_block(offset)?;
        match block.ways.binary_search_by_key(&id, |w| w.id) {
            Ok(i) => Ok(block.ways[i].clone()),
            Err(_) => Err(DbError::NotFound),
        }
    }

    pub fn get_relation(&self, id: i64) -> Result<Relation, DbError> {
        let offset = self.relation_index.get(id).ok_or(DbError::NotFound)?;
        let block = self.read_block(offset)?;
        match block.relations.binary_search_by_key(&id, |r| r.id) {
            Ok(i) => Ok(block.relations[i].clone()),
            Err(_) => Err(DbError::NotFound),
        }
    }

    pub fn iter_nodes(&self) -> ObjectIter<'_, Node> {
        ObjectIter::new(self, &self.node_blocks, |b| &b.nodes)
    }

    pub fn iter_ways(&self) -> ObjectIter<'_, Way> {
        ObjectIter::new(self, &self.way_blocks, |b| &b.ways)
    }

    pub fn iter_relations(&self) -> ObjectIter<'_, Relation> {
        ObjectIter::new(self, &self.relation_blocks, |b| &b.relations)
    }

    fn read_block(&self, offset: u32) -> Result<Arc<DecodedBlock>, DbError> {
        self.cache
            .get_or_decode(offset, || self.decode_block_at(offset))
    }

    fn decode_block_at(&self, offset: u32) -> Result<DecodedBlock, DbError> {
        if offset as usize >= self.data.len() {
            return Err(DbError::TruncatedBlock(offset));
        }

        let mut reader = BlobReader::new_seekable(Cursor::new(&self.data[..]))?;
        reader.seek(ByteOffset(u64::from(offset)))?;
        let blob = reader
            .next()
            .ok_or(DbError::TruncatedBlock(offset))??;

        match blob.decode()? {
            BlobDecode::OsmData(block) => Ok(decode_block(&block)),
            BlobDecode::OsmHeader(_) => Ok(DecodedBlock::default()),
            BlobDecode::Unknown(kind) => Err(DbError::UnknownBlockType(kind.to_owned())),
        }
    }
}

fn push_block(blocks: &mut Vec<u32>, offset: u32) {
    if blocks.last() != Some(&offset) {
        blocks.push(offset);
    }
}

fn decode_block(block: &PrimitiveBlock) -> DecodedBlock {
    let mut out = DecodedBlock::default();

    for group in block.groups() {
        for node in group.nodes() {
            out.nodes.push(Node {
                id: node.id(),
                lat: node.lat(),
                lon: node.lon(),
                tags: node.tags().collect(),
            });
        }
        for node in group.dense_nodes() {
            out.nodes.push(Node {
                id: node.id(),
                lat: node.lat(),
                lon: node.lon(),
                tags: node.tags().collect(),
            });
        }
        for way in group.ways() {
            out.ways.push(Way {
                id: way.id(),
                refs: way.refs().collect(),
                tags: way.tags().collect(),
            });
        }
        for relation in group.relations() {
            let members = relation
                .members()
                .map(|m| Member {
                    id: m.member_id,
                    kind: match m.member_type {
                        RelMemberType::Node => MemberKind::Node,
                        RelMemberType::Way => MemberKind::Way,
                        RelMemberType::Relation => MemberKind::Relation,
                    },
                    role: m.role().unwrap_or_default().to_owned(),
                })
                .collect();
            out.relations.push(Relation {
                id: relation.id(),
                members,
                tags: relation.tags().collect(),
            });
        }
    }

    out.nodes.sort_by_key(|n| n.id);
    out.ways.sort_by_key(|w| w.id);
    out.relations.sort_by_key(|r| r.id);
    out
}

/// Streams every object of one kind in file order. Creating a fresh
/// iterator restarts from the beginning; decoding goes through the block
/// cache, so interleaved random lookups stay cheap.
pub struct ObjectIter<'a, T: Clone> {
    db: &'a FileDb,
    offsets: std::slice::Iter<'a, u32>,
    select: fn(&DecodedBlock) -> &[T],
    current: Option<(Arc<DecodedBlock>, usize)>,
}

impl<'a, T: Clone> ObjectIter<'a, T> {
    fn new(db: &'a FileDb, offsets: &'a [u32], select: fn(&DecodedBlock) -> &[T]) -> Self {
        Self {
            db,
            offsets: offsets.iter(),
            select,
            current: None,
        }
    }
}

impl<T: Clone> Iterator for ObjectIter<'_, T> {
    type Item = Result<T, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((block, pos)) = &mut self.current {
                let items = (self.select)(block);
                if *pos < items.len() {
                    let item = items[*pos].clone();
                    *pos += 1;
                    return Some(Ok(item));
                }
                self.current = None;
            }

            let offset = *self.offsets.next()?;
            match self.db.read_block(offset) {
                Ok(block) => self.current = Some((block, 0)),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// One or more PBF files presented as a single database. Lookups try files
/// in the order given; the first file containing an id wins.
pub struct Database {
    files: Vec<FileDb>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Ok(Self {
            files: vec![FileDb::open(path)?],
        })
    }

    pub fn open_many<P: AsRef<Path>>(paths: &[P]) -> Result<Self, DbError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(FileDb::open(path)?);
        }
        Ok(Self { files })
    }

    pub fn counts(&self) -> Counts {
        self.files.iter().fold(Counts::default(), |acc, f| Counts {
            nodes: acc.nodes + f.counts.nodes,
            ways: acc.ways + f.counts.ways,
            relations: acc.relations + f.counts.relations,
        })
    }

    pub fn get_node(&self, id: i64) -> Result<Node, DbError> {
        self.get_in_files(|f| f.get_node(id))
    }

    pub fn get_way(&self, id: i64) -> Result<Way, DbError> {
        self.get_in_files(|f| f.get_way(id))
    }

    pub fn get_relation(&self, id: i64) -> Result<Relation, DbError> {
        self.get_in_files(|f| f.get_relation(id))
    }

    fn get_in_files<T>(
        &self,
        get: impl Fn(&FileDb) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        for file in &self.files {
            match get(file) {
                Err(DbError::NotFound) => continue,
                other => return other,
            }
        }
        Err(DbError::NotFound)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = Result<Node, DbError>> + '_ {
        self.files.iter().flat_map(|f| f.iter_nodes())
    }

    pub fn iter_ways(&self) -> impl Iterator<Item = Result<Way, DbError>> + '_ {
        self.files.iter().flat_map(|f| f.iter_ways())
    }

    pub fn iter_relations(&self) -> impl Iterator<Item = Result<Relation, DbError>> + '_ {
        self.files.iter().flat_map(|f| f.iter_relations())
    }

    /// Resolves a way's node refs into a polyline, skipping refs whose nodes
    /// are absent from the extract or carry no coordinates.
    pub fn line_of(&self, way: &Way) -> LineString {
        let mut coords = Vec::with_capacity(way.refs.len());
        for &node_id in &way.refs {
            match self.get_node(node_id) {
                Ok(node) => {
                    if node.lat == 0.0 && node.lon == 0.0 {
                        tracing::debug!(node_id, "node has no coordinates");
                        continue;
                    }
                    coords.push(Coord {
                        x: node.lon,
                        y: node.lat,
                    });
                }
                Err(DbError::NotFound) => {
                    tracing::debug!(node_id, way_id = way.id, "way references missing node");
                }
                Err(err) => {
                    tracing::warn!(node_id, %err, "failed to resolve way node");
                }
            }
        }
        LineString(coords)
    }
}

impl LineSource for Database {
    fn way_line(&self, way_id: i64) -> Option<LineString> {
        let way = match self.get_way(way_id) {
            Ok(way) => way,
            Err(DbError::NotFound) => {
                tracing::debug!(way_id, "member way not in extract");
                return None;
            }
            Err(err) => {
                tracing::warn!(way_id, %err, "failed to resolve member way");
                return None;
            }
        };
        let line = self.line_of(&way);
        (!line.0.is_empty()).then_some(line)
    }
}
