//! Shared candidate screening for the search strategies.
//!
//! Every key visited by a cursor runs the same gauntlet: dedup on
//! (key bytes, record), a strategy-specific distance check, then the
//! cached residual predicate. Only survivors reach the strategy's
//! collector.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::storage::{DocRef, DocStore, KeyNode, Matcher};

/// Dedup, residual-match cache, and progress counters.
#[derive(Default)]
pub struct Accumulator {
    seen: HashSet<(Bytes, DocRef)>,
    matched: HashMap<DocRef, bool>,
    pub looked_at: u64,
    pub objects_loaded: u64,
    pub found: u64,
}

/// Verdict of the dedup + residual screen for one key.
pub enum Screen {
    /// Seen this (key, record) pair already, or the residual failed.
    Drop,
    /// Passed; true when this is the first key of its document.
    Keep { new_doc: bool },
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dedup step. Returns false when this exact (key, record) pair was
    /// visited before; otherwise records it and counts the visit.
    pub fn observe(&mut self, node: &KeyNode) -> bool {
        if !self.seen.insert((node.key.encode(), node.loc)) {
            return false;
        }
        self.looked_at += 1;
        true
    }

    /// Residual predicate with per-document caching: a document is
    /// evaluated at most once per query no matter how many of its keys
    /// are visited.
    pub fn residual(
        &mut self,
        node: &KeyNode,
        matcher: Option<&dyn Matcher>,
        store: &dyn DocStore,
    ) -> Screen {
        match self.matched.get(&node.loc) {
            Some(true) => Screen::Keep { new_doc: false },
            Some(false) => Screen::Drop,
            None => {
                let mut loaded = false;
                if let Some(m) = matcher {
                    let outcome = m.matches(&node.key, node.loc, store);
                    loaded = outcome.loaded_object;
                    if loaded {
                        self.objects_loaded += 1;
                    }
                    if !outcome.matched {
                        self.matched.insert(node.loc, false);
                        return Screen::Drop;
                    }
                }
                self.matched.insert(node.loc, true);
                if !loaded {
                    self.objects_loaded += 1;
                }
                Screen::Keep { new_doc: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::GeoHash;
    use crate::storage::{IndexKey, MatchOutcome};
    use serde_json::Value;

    struct NoDocs;
    impl DocStore for NoDocs {
        fn document(&self, _loc: DocRef) -> Option<&Value> {
            None
        }
    }

    struct CountingMatcher {
        answer: bool,
        calls: std::cell::Cell<u64>,
    }
    impl Matcher for CountingMatcher {
        fn matches(&self, _key: &IndexKey, _loc: DocRef, _store: &dyn DocStore) -> MatchOutcome {
            self.calls.set(self.calls.get() + 1);
            MatchOutcome {
                matched: self.answer,
                loaded_object: true,
            }
        }
    }

    fn node(hash_bits: u64, loc: u64) -> KeyNode {
        KeyNode {
            key: IndexKey::prefix(GeoHash::from_quantized(hash_bits as u32, 0, 32)),
            loc: DocRef(loc),
        }
    }

    #[test]
    fn test_observe_dedups_key_record_pairs() {
        let mut acc = Accumulator::new();
        let n = node(1, 1);
        assert!(acc.observe(&n));
        assert!(!acc.observe(&n));
        assert_eq!(acc.looked_at, 1);

        // Same key, different record: distinct.
        let other = node(1, 2);
        assert!(acc.observe(&other));
        // Different key, same record: distinct too.
        let other = node(2, 1);
        assert!(acc.observe(&other));
        assert_eq!(acc.looked_at, 3);
    }

    #[test]
    fn test_residual_is_cached_per_document() {
        let mut acc = Accumulator::new();
        let m = CountingMatcher {
            answer: true,
            calls: std::cell::Cell::new(0),
        };

        let first = acc.residual(&node(1, 7), Some(&m), &NoDocs);
        assert!(matches!(first, Screen::Keep { new_doc: true }));

        // Second key of the same document: cached, matcher not rerun.
        let second = acc.residual(&node(2, 7), Some(&m), &NoDocs);
        assert!(matches!(second, Screen::Keep { new_doc: false }));
        assert_eq!(m.calls.get(), 1);
        assert_eq!(acc.objects_loaded, 1);
    }

    #[test]
    fn test_residual_failure_is_cached() {
        let mut acc = Accumulator::new();
        let m = CountingMatcher {
            answer: false,
            calls: std::cell::Cell::new(0),
        };

        assert!(matches!(acc.residual(&node(1, 3), Some(&m), &NoDocs), Screen::Drop));
        assert!(matches!(acc.residual(&node(2, 3), Some(&m), &NoDocs), Screen::Drop));
        assert_eq!(m.calls.get(), 1);
    }

    #[test]
    fn test_no_matcher_counts_one_load_per_doc() {
        let mut acc = Accumulator::new();
        assert!(matches!(
            acc.residual(&node(1, 5), None, &NoDocs),
            Screen::Keep { new_doc: true }
        ));
        assert!(matches!(
            acc.residual(&node(2, 5), None, &NoDocs),
            Screen::Keep { new_doc: false }
        ));
        assert_eq!(acc.objects_loaded, 1);
    }
}
