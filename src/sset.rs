//! In-memory sorted-set index: every member is reachable both through a
//! by-key dictionary (lexicographic, for membership) and a by-score list
//! (ascending, for rank and range queries). One instance holds the members
//! of one logical key and is owned single-threaded by its worker.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;

const NIL: usize = usize::MAX;

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}

/// A sorted-set member: key bytes, the key's precomputed hash and its
/// score. Entries are owned by exactly one `SortedSet` at a time.
#[derive(Debug)]
pub struct SetEntry {
    key: Box<[u8]>,
    key_hash: u64,
    score: f64,
}

impl SetEntry {
    fn new(key: &[u8], score: f64) -> Self {
        SetEntry {
            key: key.into(),
            key_hash: hash_key(key),
            score,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    pub fn score(&self) -> f64 {
        self.score
    }
}

/// An owned (key, score) pair as returned by range queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SetMember {
    pub key: Vec<u8>,
    pub score: f64,
}

struct Node {
    entry: SetEntry,
    prev: usize,
    next: usize,
}

/// Dual-indexed set of (key, score) members. The dictionary maps each key
/// to the slab slot of its entry; the same slots are threaded into a
/// doubly linked list kept ascending by score, ties in insertion order.
/// The slab plays the role of the entry allocator: removal through either
/// index releases the slot exactly once, and dropping the set releases
/// everything.
pub struct SortedSet {
    dict: BTreeMap<Box<[u8]>, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Default for SortedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedSet {
    pub fn new() -> Self {
        SortedSet {
            dict: BTreeMap::new(),
            nodes: vec![],
            free: vec![],
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Removes every member.
    pub fn clear(&mut self) {
        self.dict.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Adds a new member. Returns true if the key did not exist; an
    /// existing member is left untouched.
    pub fn insert(&mut self, key: &[u8], score: f64) -> bool {
        if self.dict.contains_key(key) {
            return false;
        }
        let entry = SetEntry::new(key, score);
        let slot = self.alloc(entry);
        self.insert_ordered(slot);
        self.dict.insert(key.into(), slot);
        true
    }

    /// Bulk `insert`: adds the members whose keys are absent and returns
    /// how many were added.
    pub fn add_if_absent(&mut self, members: &[(Vec<u8>, f64)]) -> usize {
        let mut added = 0;
        for (key, score) in members {
            if self.insert(key, *score) {
                added += 1;
            }
        }
        added
    }

    /// For each member whose key exists, replaces the score and re-orders
    /// the entry. Returns how many were updated.
    pub fn update_if_present(&mut self, members: &[(Vec<u8>, f64)]) -> usize {
        let mut updated = 0;
        for (key, score) in members {
            if let Some(&slot) = self.dict.get(key.as_slice()) {
                self.reinsert_with_score(slot, *score);
                updated += 1;
            }
        }
        updated
    }

    /// Adds absent members and updates present ones. Returns the number of
    /// members touched.
    pub fn upsert(&mut self, members: &[(Vec<u8>, f64)]) -> usize {
        let mut touched = 0;
        for (key, score) in members {
            match self.dict.get(key.as_slice()) {
                Some(&slot) => self.reinsert_with_score(slot, *score),
                None => {
                    let slot = self.alloc(SetEntry::new(key, *score));
                    self.insert_ordered(slot);
                    self.dict.insert(key.as_slice().into(), slot);
                }
            }
            touched += 1;
        }
        touched
    }

    /// Adds `delta` to the member's score, creating it at `delta` if
    /// absent. Returns the resulting score.
    pub fn increment(&mut self, key: &[u8], delta: f64) -> f64 {
        match self.dict.get(key) {
            Some(&slot) => {
                let new_score = self.node(slot).entry.score + delta;
                self.reinsert_with_score(slot, new_score);
                new_score
            }
            None => {
                self.insert(key, delta);
                delta
            }
        }
    }

    pub fn remove_by_keys(&mut self, keys: &[Vec<u8>]) -> usize {
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = self.dict.remove(key.as_slice()) {
                self.detach(slot);
                self.release(slot);
                removed += 1;
            }
        }
        removed
    }

    /// Removes the members named by `entries` (as returned from a range
    /// query). Returns how many were present.
    pub fn remove_by_entries(&mut self, entries: &[SetMember]) -> usize {
        let mut removed = 0;
        for member in entries {
            if let Some(slot) = self.dict.remove(member.key.as_slice()) {
                self.detach(slot);
                self.release(slot);
                removed += 1;
            }
        }
        removed
    }

    /// Members with ranks in `[begin, end]`, both inclusive and 0-based.
    /// Negative indices count from the end (-1 is the last member); `end`
    /// is clamped to the last rank. An inverted or out-of-range window
    /// yields an empty result.
    pub fn range_by_rank(&self, begin: i64, end: i64) -> Vec<SetMember> {
        if self.is_empty() {
            return vec![];
        }
        let size = self.len() as i64;
        let mut begin = begin;
        let mut end = end;
        if begin < 0 {
            begin += size;
        }
        if end < 0 {
            end += size;
        }
        if begin < 0 {
            begin = 0;
        }
        if begin > end || begin >= size {
            return vec![];
        }
        if end >= size {
            end = size - 1;
        }

        let mut out = Vec::with_capacity((end - begin + 1) as usize);
        let mut rank = 0i64;
        let mut cur = self.head;
        while cur != NIL && rank <= end {
            if rank >= begin {
                out.push(self.member(cur));
            }
            rank += 1;
            cur = self.node(cur).next;
        }
        out
    }

    /// Members with scores in `[min, max]`, both inclusive, in score
    /// order. `limit == 0` means unlimited.
    pub fn range_by_score(&self, min: f64, max: f64, limit: usize) -> Vec<SetMember> {
        if self.is_empty() || self.score_out_of_range(min, max) {
            return vec![];
        }
        let limit = if limit == 0 { self.len() } else { limit };
        let mut out = vec![];
        let mut cur = self.head;
        while cur != NIL {
            let node = self.node(cur);
            let score = node.entry.score;
            if score > max {
                break;
            }
            if score >= min {
                out.push(self.member(cur));
                if out.len() >= limit {
                    break;
                }
            }
            cur = node.next;
        }
        out
    }

    /// Number of members with scores in `[min, max]`, inclusive.
    pub fn count_by_score(&self, min: f64, max: f64) -> usize {
        if self.is_empty() || self.score_out_of_range(min, max) {
            return 0;
        }
        let mut count = 0;
        let mut cur = self.head;
        while cur != NIL {
            let node = self.node(cur);
            let score = node.entry.score;
            if score > max {
                break;
            }
            if score >= min {
                count += 1;
            }
            cur = node.next;
        }
        count
    }

    /// 0-based ascending rank of `key`, by list traversal.
    pub fn rank(&self, key: &[u8]) -> Option<usize> {
        let &slot = self.dict.get(key)?;
        let mut rank = 0;
        let mut cur = self.head;
        while cur != slot {
            rank += 1;
            cur = self.node(cur).next;
        }
        Some(rank)
    }

    pub fn score(&self, key: &[u8]) -> Option<f64> {
        self.dict.get(key).map(|&slot| self.node(slot).entry.score)
    }

    pub fn entry(&self, key: &[u8]) -> Option<&SetEntry> {
        self.dict.get(key).map(|&slot| &self.node(slot).entry)
    }

    /// Iterates members in score order.
    pub fn iter(&self) -> impl Iterator<Item = &SetEntry> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let node = self.node(cur);
            cur = node.next;
            Some(&node.entry)
        })
    }

    fn node(&self, slot: usize) -> &Node {
        self.nodes[slot].as_ref().expect("slot must be occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.nodes[slot].as_mut().expect("slot must be occupied")
    }

    fn member(&self, slot: usize) -> SetMember {
        let entry = &self.node(slot).entry;
        SetMember {
            key: entry.key.to_vec(),
            score: entry.score,
        }
    }

    fn alloc(&mut self, entry: SetEntry) -> usize {
        let node = Node {
            entry,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.nodes[slot] = None;
        self.free.push(slot);
    }

    /// Score changes must detach, mutate, then re-insert; mutating a linked
    /// entry in place would break the list ordering.
    fn reinsert_with_score(&mut self, slot: usize, score: f64) {
        self.detach(slot);
        self.node_mut(slot).entry.score = score;
        self.insert_ordered(slot);
    }

    /// Threads `slot` into the list: an empty list takes it directly,
    /// otherwise it goes before the first member with a strictly greater
    /// score, so equal scores append after existing equals.
    fn insert_ordered(&mut self, slot: usize) {
        if self.head == NIL {
            self.head = slot;
            self.tail = slot;
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = NIL;
            return;
        }
        let score = self.node(slot).entry.score;
        let mut cur = self.head;
        while cur != NIL {
            if self.node(cur).entry.score > score {
                self.insert_before(slot, cur);
                return;
            }
            cur = self.node(cur).next;
        }
        self.push_back(slot);
    }

    fn insert_before(&mut self, slot: usize, at: usize) {
        let prev = self.node(at).prev;
        {
            let node = self.node_mut(slot);
            node.prev = prev;
            node.next = at;
        }
        self.node_mut(at).prev = slot;
        if prev == NIL {
            self.head = slot;
        } else {
            self.node_mut(prev).next = slot;
        }
    }

    fn push_back(&mut self, slot: usize) {
        let tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = tail;
            node.next = NIL;
        }
        if tail == NIL {
            self.head = slot;
        } else {
            self.node_mut(tail).next = slot;
        }
        self.tail = slot;
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        let node = self.node_mut(slot);
        node.prev = NIL;
        node.next = NIL;
    }

    /// The list is kept non-decreasing, so its ends are the true score
    /// extremes and an endpoint check suffices to reject a disjoint range.
    fn score_out_of_range(&self, min: f64, max: f64) -> bool {
        min > self.node(self.tail).entry.score || max < self.node(self.head).entry.score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn members(pairs: &[(&str, f64)]) -> Vec<(Vec<u8>, f64)> {
        pairs
            .iter()
            .map(|(k, s)| (k.as_bytes().to_vec(), *s))
            .collect()
    }

    fn keys_in_order(set: &SortedSet) -> Vec<String> {
        set.iter()
            .map(|e| String::from_utf8(e.key().to_vec()).unwrap())
            .collect()
    }

    /// dict and list must stay two views of the same entries, with list
    /// scores non-decreasing.
    fn check_invariants(set: &SortedSet) {
        let listed: Vec<&SetEntry> = set.iter().collect();
        assert_eq!(listed.len(), set.len());
        for window in listed.windows(2) {
            assert!(window[0].score() <= window[1].score());
        }
        for (i, entry) in listed.iter().enumerate() {
            assert_eq!(set.rank(entry.key()), Some(i));
            assert_eq!(set.score(entry.key()), Some(entry.score()));
        }
    }

    #[test]
    fn test_insert_and_increment() {
        let mut set = SortedSet::new();
        assert!(set.insert(b"x", 1.0));
        assert!(!set.insert(b"x", 9.0));
        assert_eq!(set.score(b"x"), Some(1.0));

        assert_eq!(set.increment(b"x", 2.5), 3.5);
        assert_eq!(set.score(b"x"), Some(3.5));
        assert_eq!(set.rank(b"x"), Some(0));

        // Incrementing an absent key creates it at the delta.
        assert_eq!(set.increment(b"y", -2.0), -2.0);
        assert_eq!(set.rank(b"y"), Some(0));
        assert_eq!(set.rank(b"x"), Some(1));
        check_invariants(&set);
    }

    #[test]
    fn test_add_if_absent_counts_only_new() {
        let mut set = SortedSet::new();
        set.insert(b"a", 1.0);
        let added = set.add_if_absent(&members(&[("a", 9.0), ("b", 2.0), ("c", 3.0)]));
        assert_eq!(added, 2);
        // The existing member kept its score.
        assert_eq!(set.score(b"a"), Some(1.0));
        assert_eq!(set.len(), 3);
        check_invariants(&set);
    }

    #[test]
    fn test_update_if_present_reorders() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
        let updated = set.update_if_present(&members(&[("a", 10.0), ("missing", 5.0)]));
        assert_eq!(updated, 1);
        assert_eq!(set.len(), 3);
        assert_eq!(set.rank(b"a"), Some(2));
        assert_eq!(keys_in_order(&set), ["b", "c", "a"]);
        check_invariants(&set);
    }

    #[test]
    fn test_upsert() {
        let mut set = SortedSet::new();
        set.insert(b"a", 1.0);
        let touched = set.upsert(&members(&[("a", 4.0), ("b", 2.0)]));
        assert_eq!(touched, 2);
        assert_eq!(set.score(b"a"), Some(4.0));
        assert_eq!(set.score(b"b"), Some(2.0));
        assert_eq!(keys_in_order(&set), ["b", "a"]);
        check_invariants(&set);
    }

    #[test]
    fn test_remove_by_keys() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
        let removed = set.remove_by_keys(&[b"b".to_vec(), b"nope".to_vec()]);
        assert_eq!(removed, 1);
        assert_eq!(set.len(), 2);
        assert_eq!(set.rank(b"c"), Some(1));
        assert!(set.score(b"b").is_none());
        check_invariants(&set);

        let removed = set.remove_by_keys(&[b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(removed, 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_by_entries() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]));
        let picked = set.range_by_rank(1, 2);
        let removed = set.remove_by_entries(&picked);
        assert_eq!(removed, 2);
        assert_eq!(keys_in_order(&set), ["a", "d"]);
        // Removing the same entries again finds nothing.
        assert_eq!(set.remove_by_entries(&picked), 0);
        check_invariants(&set);
    }

    #[test]
    fn test_range_by_rank_negative_indices() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));
        let got = set.range_by_rank(-2, -1);
        assert_eq!(
            got,
            vec![
                SetMember {
                    key: b"b".to_vec(),
                    score: 2.0
                },
                SetMember {
                    key: b"c".to_vec(),
                    score: 3.0
                },
            ]
        );
    }

    #[test]
    fn test_range_by_rank_bounds() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]));

        // Whole set, with the end clamped.
        let all = set.range_by_rank(0, 100);
        assert_eq!(all.len(), 3);
        assert_eq!(set.range_by_rank(0, -1).len(), 3);

        // Inverted or out-of-range windows are empty.
        assert!(set.range_by_rank(2, 1).is_empty());
        assert!(set.range_by_rank(3, 5).is_empty());
        assert!(set.range_by_rank(-1, -2).is_empty());

        // A begin far below zero clamps to the start.
        assert_eq!(set.range_by_rank(-100, 0).len(), 1);

        let empty = SortedSet::new();
        assert!(empty.range_by_rank(0, -1).is_empty());
    }

    #[test]
    fn test_range_by_score() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[
            ("a", 1.0),
            ("b", 2.0),
            ("c", 2.0),
            ("d", 3.0),
            ("e", 10.0),
        ]));

        // Inclusive on both ends.
        let got = set.range_by_score(2.0, 3.0, 0);
        assert_eq!(
            got.iter().map(|m| m.key.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        // Limit cuts the result off; zero means unlimited.
        assert_eq!(set.range_by_score(2.0, 3.0, 2).len(), 2);
        assert_eq!(set.range_by_score(f64::MIN, f64::MAX, 0).len(), 5);

        // Ranges outside the stored scores.
        assert!(set.range_by_score(11.0, 20.0, 0).is_empty());
        assert!(set.range_by_score(-5.0, 0.5, 0).is_empty());
        assert!(set.range_by_score(4.0, 9.0, 0).is_empty());
    }

    #[test]
    fn test_count_by_score() {
        let mut set = SortedSet::new();
        assert_eq!(set.count_by_score(0.0, 10.0), 0);
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0), ("c", 2.0), ("d", 3.0)]));
        assert_eq!(set.count_by_score(2.0, 2.0), 2);
        assert_eq!(set.count_by_score(0.0, 10.0), 4);
        assert_eq!(set.count_by_score(1.5, 2.5), 2);
        assert_eq!(set.count_by_score(4.0, 10.0), 0);
        assert_eq!(set.count_by_score(10.0, 0.0), 0);
    }

    #[test]
    fn test_equal_scores_keep_insertion_order() {
        let mut set = SortedSet::new();
        set.insert(b"a", 1.0);
        set.insert(b"b", 1.0);
        set.insert(b"c", 1.0);
        assert_eq!(keys_in_order(&set), ["a", "b", "c"]);

        // Re-setting a score detaches and re-inserts after existing equals.
        set.update_if_present(&members(&[("a", 1.0)]));
        assert_eq!(keys_in_order(&set), ["b", "c", "a"]);
        check_invariants(&set);
    }

    #[test]
    fn test_key_hash_is_precomputed_and_stable() {
        let mut set = SortedSet::new();
        set.insert(b"alpha", 1.0);
        set.increment(b"alpha", 1.0);
        let entry = set.entry(b"alpha").unwrap();
        assert_eq!(entry.key_hash(), {
            let mut h = DefaultHasher::new();
            h.write(b"alpha");
            h.finish()
        });
    }

    #[test]
    fn test_clear() {
        let mut set = SortedSet::new();
        set.add_if_absent(&members(&[("a", 1.0), ("b", 2.0)]));
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.rank(b"a"), None);
        assert!(set.insert(b"a", 5.0));
        check_invariants(&set);
    }

    #[test]
    fn test_slot_reuse_after_removal() {
        let mut set = SortedSet::new();
        set.insert(b"a", 1.0);
        set.insert(b"b", 2.0);
        set.remove_by_keys(&[b"a".to_vec()]);
        set.insert(b"c", 0.5);
        set.insert(b"d", 9.0);
        assert_eq!(keys_in_order(&set), ["c", "b", "d"]);
        check_invariants(&set);
    }

    #[test]
    fn test_randomized_mutations_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut set = SortedSet::new();
        let keys: Vec<Vec<u8>> = (0..24).map(|i| format!("m{:02}", i).into_bytes()).collect();

        for _ in 0..2000 {
            let key = keys.choose(&mut rng).unwrap().clone();
            let score = (rng.gen_range(-50..50) as f64) / 4.0;
            match rng.gen_range(0..5) {
                0 => {
                    set.insert(&key, score);
                }
                1 => {
                    set.upsert(&[(key, score)]);
                }
                2 => {
                    set.increment(&key, score);
                }
                3 => {
                    set.update_if_present(&[(key, score)]);
                }
                _ => {
                    set.remove_by_keys(&[key]);
                }
            }
        }
        check_invariants(&set);

        // Every surviving member is found where the ranks say it is.
        let all = set.range_by_rank(0, -1);
        assert_eq!(all.len(), set.len());
        for (i, member) in all.iter().enumerate() {
            assert_eq!(set.rank(&member.key), Some(i));
        }
    }
}
