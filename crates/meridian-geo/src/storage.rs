//! Host storage contracts and the in-memory reference implementation.
//!
//! The geo core never owns storage. It consumes three capabilities from
//! its host: an ordered B-tree over index keys ([`KeyTree`]), a document
//! store that materializes records ([`DocStore`]), and a residual
//! predicate matcher ([`Matcher`]). `MemCollection` implements all
//! three over plain vectors and backs the tests and diagnostics.

use bytes::{BufMut, Bytes, BytesMut};
use meridian_common::document::fields_dotted;
use meridian_common::Result;
use serde_json::Value;

use crate::hash::GeoHash;
use crate::index::Geo2dIndex;

/// Opaque handle to a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocRef(pub u64);

/// One index key: the geohash in leading position, then the projected
/// values of the index's other fields.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    pub hash: GeoHash,
    pub trailing: Vec<Value>,
}

impl IndexKey {
    /// A key with no trailing values, as used for prefix seeks.
    pub fn prefix(hash: GeoHash) -> Self {
        IndexKey {
            hash,
            trailing: Vec::new(),
        }
    }

    /// Canonical byte encoding. Sorting these bytes sorts keys in
    /// index order, and the bytes double as the dedup identity.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.hash.value());
        buf.put_u8(self.hash.bits() as u8);
        if !self.trailing.is_empty() {
            // serde_json sorts object keys, so this is deterministic.
            let tail = serde_json::to_string(&self.trailing).unwrap_or_default();
            buf.put_slice(tail.as_bytes());
        }
        buf.freeze()
    }
}

/// A key and the record it points at, as yielded by the B-tree.
#[derive(Debug, Clone)]
pub struct KeyNode {
    pub key: IndexKey,
    pub loc: DocRef,
}

/// A fully resolved result record.
///
/// Near cursors fill in the exact distance; region cursors leave it
/// negative, since membership is all they establish.
#[derive(Debug, Clone)]
pub struct GeoPoint {
    pub key: IndexKey,
    pub loc: DocRef,
    pub doc: Value,
    pub exact_distance: f64,
    pub exact_within: bool,
}

impl GeoPoint {
    pub fn unmeasured(node: KeyNode, doc: Value) -> Self {
        GeoPoint {
            key: node.key,
            loc: node.loc,
            doc,
            exact_distance: -1.0,
            exact_within: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Opaque position inside the host's B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreePos(pub u64);

/// Ordered-key lookup and directional advance over the index.
pub trait KeyTree {
    /// Positions at the first key at-or-after `key` (`Forward`) or the
    /// last key at-or-before it (`Reverse`).
    fn locate(&self, key: &IndexKey, direction: Direction) -> Option<TreePos>;

    /// Steps one entry in the given direction.
    fn advance(&self, pos: TreePos, direction: Direction) -> Option<TreePos>;

    /// Reads the entry at a position.
    fn key_node(&self, pos: TreePos) -> Option<KeyNode>;
}

/// Document materialization.
pub trait DocStore {
    fn document(&self, loc: DocRef) -> Option<&Value>;
}

/// Result of a residual predicate evaluation.
#[derive(Debug, Clone, Copy)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Whether the full document had to be loaded to decide.
    pub loaded_object: bool,
}

/// Residual (non-geo) predicate matcher.
pub trait Matcher {
    fn matches(&self, key: &IndexKey, loc: DocRef, store: &dyn DocStore) -> MatchOutcome;
}

/// Equality matcher over the non-geo fields of a query.
///
/// The geo clause itself is enforced by the cursor's geometry checks,
/// so it is stripped here; every remaining field must compare equal to
/// (or be an element of) the document's value at that path.
#[derive(Debug, Clone, Default)]
pub struct QueryMatcher {
    residual: Vec<(String, Value)>,
}

impl QueryMatcher {
    pub fn new(query: &Value, geo_field: &str) -> Self {
        let residual = match query {
            Value::Object(map) => map
                .iter()
                .filter(|(k, _)| k.as_str() != geo_field)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        };
        QueryMatcher { residual }
    }

    pub fn is_trivial(&self) -> bool {
        self.residual.is_empty()
    }
}

impl Matcher for QueryMatcher {
    fn matches(&self, _key: &IndexKey, loc: DocRef, store: &dyn DocStore) -> MatchOutcome {
        if self.residual.is_empty() {
            return MatchOutcome {
                matched: true,
                loaded_object: false,
            };
        }

        let Some(doc) = store.document(loc) else {
            return MatchOutcome {
                matched: false,
                loaded_object: false,
            };
        };

        let matched = self.residual.iter().all(|(field, expected)| {
            fields_dotted(doc, field).iter().any(|found| {
                *found == expected
                    || matches!(found, Value::Array(items) if items.contains(expected))
            })
        });

        MatchOutcome {
            matched,
            loaded_object: true,
        }
    }
}

/// Bidirectional walker over a [`KeyTree`], holding one position.
#[derive(Clone, Copy)]
pub struct TreeCursor<'a> {
    tree: &'a dyn KeyTree,
    pos: Option<TreePos>,
}

impl<'a> TreeCursor<'a> {
    pub fn locate(tree: &'a dyn KeyTree, key: &IndexKey, direction: Direction) -> Self {
        TreeCursor {
            tree,
            pos: tree.locate(key, direction),
        }
    }

    /// A cursor positioned nowhere.
    pub fn null(tree: &'a dyn KeyTree) -> Self {
        TreeCursor { tree, pos: None }
    }

    pub fn is_null(&self) -> bool {
        self.pos.is_none()
    }

    pub fn node(&self) -> Option<KeyNode> {
        self.pos.and_then(|p| self.tree.key_node(p))
    }

    /// Whether the current entry's hash starts with `prefix`. False
    /// once the cursor has run off the tree.
    pub fn has_prefix(&self, prefix: &GeoHash) -> bool {
        match self.node() {
            Some(node) => node.key.hash.has_prefix(prefix),
            None => false,
        }
    }

    /// Moves one entry; false once the tree is exhausted.
    pub fn advance(&mut self, direction: Direction) -> bool {
        self.pos = self.pos.and_then(|p| self.tree.advance(p, direction));
        self.pos.is_some()
    }
}

#[derive(Debug, Clone)]
struct MemEntry {
    encoded: Bytes,
    key: IndexKey,
    loc: DocRef,
}

/// In-memory collection: documents plus a sorted key list.
///
/// Insertion extracts keys through the index descriptor, so queries
/// against this collection see exactly what a real index would hold.
#[derive(Debug, Default)]
pub struct MemCollection {
    docs: Vec<Value>,
    entries: Vec<MemEntry>,
}

impl MemCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document and indexes every key it produces.
    pub fn insert(&mut self, index: &Geo2dIndex, doc: Value) -> Result<DocRef> {
        let loc = DocRef(self.docs.len() as u64);
        let keys = index.get_keys(&doc)?;
        for key in keys {
            self.entries.push(MemEntry {
                encoded: key.encode(),
                key,
                loc,
            });
        }
        self.docs.push(doc);
        self.entries
            .sort_by(|a, b| a.encoded.cmp(&b.encoded).then(a.loc.cmp(&b.loc)));
        Ok(loc)
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

impl KeyTree for MemCollection {
    fn locate(&self, key: &IndexKey, direction: Direction) -> Option<TreePos> {
        let target = key.encode();
        match direction {
            Direction::Forward => {
                let i = self.entries.partition_point(|e| e.encoded < target);
                (i < self.entries.len()).then(|| TreePos(i as u64))
            }
            Direction::Reverse => {
                let i = self.entries.partition_point(|e| e.encoded <= target);
                (i > 0).then(|| TreePos((i - 1) as u64))
            }
        }
    }

    fn advance(&self, pos: TreePos, direction: Direction) -> Option<TreePos> {
        let i = pos.0 as usize;
        match direction {
            Direction::Forward => (i + 1 < self.entries.len()).then(|| TreePos(pos.0 + 1)),
            Direction::Reverse => (i > 0).then(|| TreePos(pos.0 - 1)),
        }
    }

    fn key_node(&self, pos: TreePos) -> Option<KeyNode> {
        self.entries.get(pos.0 as usize).map(|e| KeyNode {
            key: e.key.clone(),
            loc: e.loc,
        })
    }
}

impl DocStore for MemCollection {
    fn document(&self, loc: DocRef) -> Option<&Value> {
        self.docs.get(loc.0 as usize)
    }
}
