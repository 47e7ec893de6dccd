//! Owned OSM element model, decoded once from PBF blocks and shared via the
//! block cache.

/// Tag list in file order. OSM objects rarely carry more than a handful of
/// tags, so a flat vector beats a map for both size and lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`Tags::get`] but returns the empty string for a missing key,
    /// which is how OSM tag predicates are usually written.
    pub fn find(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Tags {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: i64,
    pub kind: MemberKind,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
}

/// Packed object identifier: object kind in the top two bits, numeric id in
/// the middle 46, object version in the low 16. Masking the version off
/// yields the stable feature id that survives edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

const VERSION_BITS: u32 = 16;
const KIND_SHIFT: u32 = 62;
const ID_FIELD_MASK: u64 = ((1u64 << KIND_SHIFT) - 1) & !0xFFFF;
const FEATURE_MASK: u64 = !0xFFFF;

impl ObjectId {
    pub fn new(kind: MemberKind, id: i64, version: u16) -> Self {
        let kind_tag = match kind {
            MemberKind::Node => 1u64,
            MemberKind::Way => 2u64,
            MemberKind::Relation => 3u64,
        };
        let id_bits = ((id as u64) << VERSION_BITS) & ID_FIELD_MASK;
        Self((kind_tag << KIND_SHIFT) | id_bits | u64::from(version))
    }

    pub fn node(id: i64) -> Self {
        Self::new(MemberKind::Node, id, 0)
    }

    pub fn way(id: i64) -> Self {
        Self::new(MemberKind::Way, id, 0)
    }

    pub fn relation(id: i64) -> Self {
        Self::new(MemberKind::Relation, id, 0)
    }

    /// The id with the version bits masked away; equal for all versions of
    /// the same object.
    pub fn feature(self) -> Self {
        Self(self.0 & FEATURE_MASK)
    }

    pub fn version(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn kind(self) -> MemberKind {
        match self.0 >> KIND_SHIFT {
            1 => MemberKind::Node,
            2 => MemberKind::Way,
            _ => MemberKind::Relation,
        }
    }

    pub fn ref_id(self) -> i64 {
        ((self.0 & ID_FIELD_MASK) >> VERSION_BITS) as i64
    }
}
