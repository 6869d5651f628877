use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::{Candidate, Filter, Label};
use crate::Error;

/// Ordered multiset over the attributes of already-inserted labels.
///
/// The table answers the builder's window queries: given a center attribute
/// and a half-width expressed in *ranks*, which attribute values bound the
/// window, and which members can seed a traversal inside it. Every method
/// takes an internal lock, so a table reference can be shared freely between
/// inserting workers.
pub trait OrderTable: Send + Sync {
    fn insert(&self, label: Label);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attribute values at ranks `pos ± half_w` around where `center` would
    /// be inserted, clamped to the table. Appends up to 3 uniformly sampled
    /// member labels from the window to `entries` (skipping duplicates).
    ///
    /// When `2·half_w` reaches the table size the window is the whole table:
    /// the endpoints are the minimum and maximum, and the minimum is the
    /// sole entry point.
    fn window_endpoints(&self, center: Label, half_w: usize, entries: &mut Vec<Label>) -> Filter;

    /// The subset of `candidates` whose labels fall inside the window of
    /// rank half-width `half_w` around `center`.
    fn filter_candidates(
        &self,
        candidates: &[Candidate],
        center: Label,
        half_w: usize,
    ) -> Vec<Candidate>;

    /// Number of members with attribute in `[lower, upper]`.
    fn cardinality(&self, lower: Label, upper: Label) -> usize;

    fn serialize(&self, out: &mut dyn Write) -> Result<(), Error>;

    fn deserialize(&self, input: &mut dyn Read) -> Result<(), Error>;
}

const NIL: u32 = u32::MAX;

// Weight-balance parameters: neither child's weight may exceed DELTA times
// its sibling's, with GAMMA choosing between single and double rotations.
// Weight is subtree size plus one.
const DELTA: usize = 3;
const GAMMA: usize = 2;

struct Node {
    label: Label,
    left: u32,
    right: u32,
    size: u32,
}

/// Size-augmented weight-balanced tree over an index arena. Multiset
/// semantics: duplicates insert to the right.
struct WbTree {
    nodes: Vec<Node>,
    root: u32,
}

impl WbTree {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            root: NIL,
        }
    }

    fn len(&self) -> usize {
        self.size(self.root)
    }

    #[inline]
    fn size(&self, idx: u32) -> usize {
        match idx {
            NIL => 0,
            _ => self.nodes[idx as usize].size as usize,
        }
    }

    #[inline]
    fn weight(&self, idx: u32) -> usize {
        self.size(idx) + 1
    }

    fn insert(&mut self, label: Label) {
        let new = self.nodes.len() as u32;
        self.nodes.push(Node {
            label,
            left: NIL,
            right: NIL,
            size: 1,
        });
        self.root = self.insert_at(self.root, new);
    }

    fn insert_at(&mut self, root: u32, new: u32) -> u32 {
        if root == NIL {
            return new;
        }
        if self.nodes[new as usize].label < self.nodes[root as usize].label {
            let left = self.insert_at(self.nodes[root as usize].left, new);
            self.nodes[root as usize].left = left;
        } else {
            let right = self.insert_at(self.nodes[root as usize].right, new);
            self.nodes[root as usize].right = right;
        }
        self.refresh(root);
        self.rebalance(root)
    }

    fn refresh(&mut self, idx: u32) {
        let (left, right) = {
            let node = &self.nodes[idx as usize];
            (node.left, node.right)
        };
        self.nodes[idx as usize].size = (1 + self.size(left) + self.size(right)) as u32;
    }

    fn rebalance(&mut self, idx: u32) -> u32 {
        let (left, right) = {
            let node = &self.nodes[idx as usize];
            (node.left, node.right)
        };
        if self.weight(right) > DELTA * self.weight(left) {
            let r = &self.nodes[right as usize];
            let (rl, rr) = (r.left, r.right);
            if self.weight(rl) < GAMMA * self.weight(rr) {
                self.rotate_left(idx)
            } else {
                let new_right = self.rotate_right(right);
                self.nodes[idx as usize].right = new_right;
                self.rotate_left(idx)
            }
        } else if self.weight(left) > DELTA * self.weight(right) {
            let l = &self.nodes[left as usize];
            let (ll, lr) = (l.left, l.right);
            if self.weight(lr) < GAMMA * self.weight(ll) {
                self.rotate_right(idx)
            } else {
                let new_left = self.rotate_left(left);
                self.nodes[idx as usize].left = new_left;
                self.rotate_right(idx)
            }
        } else {
            idx
        }
    }

    fn rotate_left(&mut self, idx: u32) -> u32 {
        let right = self.nodes[idx as usize].right;
        self.nodes[idx as usize].right = self.nodes[right as usize].left;
        self.nodes[right as usize].left = idx;
        self.refresh(idx);
        self.refresh(right);
        right
    }

    fn rotate_right(&mut self, idx: u32) -> u32 {
        let left = self.nodes[idx as usize].left;
        self.nodes[idx as usize].left = self.nodes[left as usize].right;
        self.nodes[left as usize].right = idx;
        self.refresh(idx);
        self.refresh(left);
        left
    }

    /// The `k`-th smallest member, 0-indexed. `k` must be below `len`.
    fn select(&self, mut k: usize) -> Label {
        debug_assert!(k < self.len());
        let mut cur = self.root;
        loop {
            let node = &self.nodes[cur as usize];
            let left_size = self.size(node.left);
            if k < left_size {
                cur = node.left;
            } else if k == left_size {
                return node.label;
            } else {
                k -= left_size + 1;
                cur = node.right;
            }
        }
    }

    /// Number of members strictly below `label`; also the rank at which
    /// `label` would be inserted.
    fn rank(&self, label: Label) -> usize {
        let mut cur = self.root;
        let mut rank = 0;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if label <= node.label {
                cur = node.left;
            } else {
                rank += self.size(node.left) + 1;
                cur = node.right;
            }
        }
        rank
    }

    /// Number of members at or below `label`.
    fn rank_through(&self, label: Label) -> usize {
        let mut cur = self.root;
        let mut rank = 0;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if label < node.label {
                cur = node.left;
            } else {
                rank += self.size(node.left) + 1;
                cur = node.right;
            }
        }
        rank
    }

    fn for_each_in_order(&self, mut f: impl FnMut(Label)) {
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.nodes[cur as usize].left;
            }
            let idx = stack.pop().unwrap();
            f(self.nodes[idx as usize].label);
            cur = self.nodes[idx as usize].right;
        }
    }
}

struct WbInner {
    tree: WbTree,
    rng: SmallRng,
}

/// The default order table: a weight-balanced tree with subtree sizes, so
/// window endpoints and cardinalities cost O(log n) regardless of insertion
/// order.
pub struct WbTreeOrderTable {
    capacity: usize,
    inner: Mutex<WbInner>,
}

impl WbTreeOrderTable {
    pub fn new(capacity: usize) -> Self {
        Self::with_seed(capacity, rand::random())
    }

    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(WbInner {
                tree: WbTree::with_capacity(capacity),
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }
}

impl OrderTable for WbTreeOrderTable {
    fn insert(&self, label: Label) {
        let mut inner = self.inner.lock();
        assert!(inner.tree.len() < self.capacity, "order table is full");
        inner.tree.insert(label);
    }

    fn len(&self) -> usize {
        self.inner.lock().tree.len()
    }

    fn window_endpoints(&self, center: Label, half_w: usize, entries: &mut Vec<Label>) -> Filter {
        let mut inner = self.inner.lock();
        let size = inner.tree.len();
        if size == 0 {
            return Filter {
                lower: center,
                upper: center,
            };
        }
        if 2 * half_w >= size {
            let min = inner.tree.select(0);
            let max = inner.tree.select(size - 1);
            entries.push(min);
            return Filter {
                lower: min,
                upper: max,
            };
        }
        let pos = inner.tree.rank(center);
        let lo = pos.saturating_sub(half_w);
        let hi = (pos + half_w).min(size - 1);
        let filter = Filter {
            lower: inner.tree.select(lo),
            upper: inner.tree.select(hi),
        };
        for _ in 0..(hi - lo + 1).min(3) {
            let at = inner.rng.gen_range(lo..=hi);
            let pick = inner.tree.select(at);
            if !entries.contains(&pick) {
                entries.push(pick);
            }
        }
        filter
    }

    fn filter_candidates(
        &self,
        candidates: &[Candidate],
        center: Label,
        half_w: usize,
    ) -> Vec<Candidate> {
        let inner = self.inner.lock();
        let size = inner.tree.len();
        if 2 * half_w >= size {
            return candidates.to_vec();
        }
        let pos = inner.tree.rank(center);
        let lo = pos.saturating_sub(half_w);
        let hi = (pos + half_w).min(size - 1);
        let lower = inner.tree.select(lo);
        let upper = inner.tree.select(hi);
        candidates
            .iter()
            .filter(|c| lower <= c.label && c.label <= upper)
            .copied()
            .collect()
    }

    fn cardinality(&self, lower: Label, upper: Label) -> usize {
        let inner = self.inner.lock();
        let below = inner.tree.rank(lower);
        let through = inner.tree.rank_through(upper);
        through.saturating_sub(below)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<(), Error> {
        let inner = self.inner.lock();
        out.write_u64::<LittleEndian>(inner.tree.len() as u64)?;
        let mut result = Ok(());
        inner.tree.for_each_in_order(|label| {
            if result.is_ok() {
                result = out.write_u32::<LittleEndian>(label.0);
            }
        });
        result.map_err(Error::from)
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.tree.len() == 0);
        let size = input.read_u64::<LittleEndian>()? as usize;
        if size > self.capacity {
            return Err(Error::Corruption(format!(
                "order table holds {size} labels but the index capacity is {}",
                self.capacity
            )));
        }
        for _ in 0..size {
            let label = Label(input.read_u32::<LittleEndian>()?);
            inner.tree.insert(label);
        }
        Ok(())
    }
}

struct VecInner {
    order: Vec<Label>,
    rng: SmallRng,
}

/// Sorted-vector order table. Insertion shifts the tail, so this variant is
/// only appropriate when attributes arrive (mostly) in increasing order;
/// lookups match [`WbTreeOrderTable`] exactly.
pub struct SortedVecOrderTable {
    inner: Mutex<VecInner>,
}

impl SortedVecOrderTable {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new(VecInner {
                order: Vec::new(),
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }
}

impl Default for SortedVecOrderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderTable for SortedVecOrderTable {
    fn insert(&self, label: Label) {
        let mut inner = self.inner.lock();
        let pos = inner.order.partition_point(|&l| l < label);
        inner.order.insert(pos, label);
    }

    fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    fn window_endpoints(&self, center: Label, half_w: usize, entries: &mut Vec<Label>) -> Filter {
        let mut inner = self.inner.lock();
        let size = inner.order.len();
        if size == 0 {
            return Filter {
                lower: center,
                upper: center,
            };
        }
        if 2 * half_w >= size {
            let min = inner.order[0];
            let max = inner.order[size - 1];
            entries.push(min);
            return Filter {
                lower: min,
                upper: max,
            };
        }
        let pos = inner.order.partition_point(|&l| l < center);
        let lo = pos.saturating_sub(half_w);
        let hi = (pos + half_w).min(size - 1);
        let filter = Filter {
            lower: inner.order[lo],
            upper: inner.order[hi],
        };
        for _ in 0..(hi - lo + 1).min(3) {
            let at = inner.rng.gen_range(lo..=hi);
            let pick = inner.order[at];
            if !entries.contains(&pick) {
                entries.push(pick);
            }
        }
        filter
    }

    fn filter_candidates(
        &self,
        candidates: &[Candidate],
        center: Label,
        half_w: usize,
    ) -> Vec<Candidate> {
        let inner = self.inner.lock();
        let size = inner.order.len();
        if 2 * half_w >= size {
            return candidates.to_vec();
        }
        let pos = inner.order.partition_point(|&l| l < center);
        let lo = pos.saturating_sub(half_w);
        let hi = (pos + half_w).min(size - 1);
        let lower = inner.order[lo];
        let upper = inner.order[hi];
        candidates
            .iter()
            .filter(|c| lower <= c.label && c.label <= upper)
            .copied()
            .collect()
    }

    fn cardinality(&self, lower: Label, upper: Label) -> usize {
        let inner = self.inner.lock();
        let below = inner.order.partition_point(|&l| l < lower);
        let through = inner.order.partition_point(|&l| l <= upper);
        through.saturating_sub(below)
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<(), Error> {
        let inner = self.inner.lock();
        out.write_u64::<LittleEndian>(inner.order.len() as u64)?;
        for label in &inner.order {
            out.write_u32::<LittleEndian>(label.0)?;
        }
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.order.is_empty());
        let size = input.read_u64::<LittleEndian>()? as usize;
        for _ in 0..size {
            let label = Label(input.read_u32::<LittleEndian>()?);
            let pos = inner.order.partition_point(|&l| l < label);
            inner.order.insert(pos, label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;
    use crate::types::Candidate;

    fn filled(labels: &[u32]) -> WbTreeOrderTable {
        let table = WbTreeOrderTable::with_seed(labels.len().max(1), 7);
        for &l in labels {
            table.insert(Label(l));
        }
        table
    }

    #[test]
    fn tree_matches_sorted_vec_model() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut labels: Vec<u32> = (0..500).collect();
        labels.shuffle(&mut rng);

        let mut tree = WbTree::with_capacity(labels.len());
        let mut model: Vec<u32> = Vec::new();
        for &l in &labels {
            tree.insert(Label(l));
            let pos = model.partition_point(|&m| m < l);
            model.insert(pos, l);
        }

        assert_eq!(tree.len(), model.len());
        for (k, &m) in model.iter().enumerate() {
            assert_eq!(tree.select(k), Label(m));
        }
        for probe in [0u32, 1, 123, 250, 499, 500, 700] {
            assert_eq!(
                tree.rank(Label(probe)),
                model.partition_point(|&m| m < probe)
            );
            assert_eq!(
                tree.rank_through(Label(probe)),
                model.partition_point(|&m| m <= probe)
            );
        }
    }

    #[test]
    fn tree_stays_balanced_under_sorted_inserts() {
        let mut tree = WbTree::with_capacity(4096);
        for l in 0..4096u32 {
            tree.insert(Label(l));
        }
        // Depth of a weight-balanced tree is logarithmic; walk the leftmost
        // and rightmost spines as a proxy.
        for (k, expect) in [(0usize, 0u32), (4095, 4095)] {
            assert_eq!(tree.select(k), Label(expect));
        }
        let mut depth = 0;
        let mut cur = tree.root;
        while cur != NIL {
            cur = tree.nodes[cur as usize].right;
            depth += 1;
        }
        assert!(depth <= 40, "right spine too deep: {depth}");
    }

    #[test]
    fn window_endpoints_center_of_table() {
        let table = filled(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut entries = Vec::new();
        let filter = table.window_endpoints(Label(5), 2, &mut entries);
        assert_eq!(filter, Filter::new(3, 7));
        assert!(!entries.is_empty() && entries.len() <= 3);
        for ep in entries {
            assert!(filter.contains(ep));
        }
    }

    #[test]
    fn window_endpoints_clamp_at_table_edges() {
        let table = filled(&[10, 20, 30, 40, 50, 60, 70, 80]);
        let mut entries = Vec::new();
        let filter = table.window_endpoints(Label(10), 2, &mut entries);
        assert_eq!(filter, Filter::new(10, 30));

        entries.clear();
        let filter = table.window_endpoints(Label(80), 2, &mut entries);
        assert_eq!(filter, Filter::new(60, 80));
    }

    #[test]
    fn wide_window_returns_whole_table_with_min_entry() {
        let table = filled(&[4, 8, 15, 16]);
        let mut entries = Vec::new();
        let filter = table.window_endpoints(Label(15), 2, &mut entries);
        assert_eq!(filter, Filter::new(4, 16));
        assert_eq!(entries, vec![Label(4)]);
    }

    #[test]
    fn absent_center_uses_insertion_rank() {
        let table = filled(&[0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
        let mut entries = Vec::new();
        // 7 would insert at rank 4, so the window covers ranks 3..=5.
        let filter = table.window_endpoints(Label(7), 1, &mut entries);
        assert_eq!(filter, Filter::new(6, 10));
    }

    #[test]
    fn filter_candidates_keeps_in_window_only() {
        let table = filled(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let candidates = [
            Candidate::new(0.1, Label(1)),
            Candidate::new(0.2, Label(4)),
            Candidate::new(0.3, Label(6)),
            Candidate::new(0.4, Label(9)),
        ];
        let kept = table.filter_candidates(&candidates, Label(5), 2);
        let labels: Vec<Label> = kept.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec![Label(4), Label(6)]);
    }

    #[test]
    fn cardinality_counts_inclusive_range() {
        let table = filled(&[1, 3, 5, 7, 9, 11]);
        assert_eq!(table.cardinality(Label(3), Label(9)), 4);
        assert_eq!(table.cardinality(Label(0), Label(100)), 6);
        assert_eq!(table.cardinality(Label(4), Label(4)), 0);
        assert_eq!(table.cardinality(Label(9), Label(3)), 0);
    }

    #[test]
    fn serialize_round_trips_sorted() {
        let table = filled(&[9, 1, 7, 3, 5]);
        let mut bytes = Vec::new();
        table.serialize(&mut bytes).unwrap();

        let restored = WbTreeOrderTable::with_seed(5, 7);
        restored.deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.len(), 5);

        let mut again = Vec::new();
        restored.serialize(&mut again).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn deserialize_rejects_oversized_table() {
        let table = filled(&[1, 2, 3]);
        let mut bytes = Vec::new();
        table.serialize(&mut bytes).unwrap();

        let restored = WbTreeOrderTable::with_seed(2, 7);
        assert!(restored.deserialize(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn concurrent_inserts_keep_the_table_consistent() {
        let table = WbTreeOrderTable::with_seed(1000, 9);
        std::thread::scope(|scope| {
            for offset in 0..4u32 {
                let table = &table;
                scope.spawn(move || {
                    for label in (offset..1000).step_by(4) {
                        table.insert(Label(label));
                    }
                });
            }
        });
        assert_eq!(table.len(), 1000);

        let mut bytes = Vec::new();
        table.serialize(&mut bytes).unwrap();
        let mut cursor = bytes.as_slice();
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 1000);
        for expect in 0..1000u32 {
            assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), expect);
        }
    }

    #[test]
    fn sorted_vec_variant_agrees_with_tree() {
        let labels = [12u32, 7, 3, 30, 22, 18, 9, 15];
        let tree = filled(&labels);
        let vec = SortedVecOrderTable::with_seed(7);
        for &l in &labels {
            vec.insert(Label(l));
        }

        for center in [0u32, 9, 14, 31] {
            for half_w in [1usize, 2, 10] {
                let mut unused = Vec::new();
                assert_eq!(
                    tree.window_endpoints(Label(center), half_w, &mut unused),
                    vec.window_endpoints(Label(center), half_w, &mut Vec::new()),
                    "center {center} half_w {half_w}"
                );
            }
        }
        assert_eq!(
            tree.cardinality(Label(5), Label(20)),
            vec.cardinality(Label(5), Label(20))
        );
    }
}
