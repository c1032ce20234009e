//! In-memory B+ tree (spec §4.1): order *m* (default 7), doubly linked
//! leaves for range scans, cursor-carried traversal state.

mod node;

use node::{Arena, InternalNode, LeafNode, Node, NodeId};

pub const DEFAULT_ORDER: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekMode {
    Exact,
    Ge,
    Le,
}

/// Cursor state carried by the tree: `current_key`/`current_record` mirror
/// what the last seek/step landed on, `eof` means the traversal ran off
/// either end, `found` means the last `seek(_, Exact)` matched.
#[derive(Clone, Debug)]
pub struct Cursor<K, R> {
    pub current_key: Option<K>,
    pub current_record: Option<R>,
    pub eof: bool,
    pub found: bool,
    position: Option<(NodeId, usize)>,
}

impl<K, R> Cursor<K, R> {
    fn empty() -> Self {
        Self {
            current_key: None,
            current_record: None,
            eof: true,
            found: false,
            position: None,
        }
    }
}

#[derive(Clone)]
pub struct BPlusTree<K, R> {
    arena: Arena<K, R>,
    root: NodeId,
    order: usize,
    max_leaf_keys: usize,
    min_leaf_keys: usize,
    max_inner_keys: usize,
    min_inner_keys: usize,
    len: usize,
}

impl<K: Ord + Clone, R: Clone> Default for BPlusTree<K, R> {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl<K: Ord + Clone, R: Clone> BPlusTree<K, R> {
    pub fn new(order: usize) -> Self {
        assert!(order >= 3, "B+ tree order must be at least 3");
        let mut arena = Arena::new();
        let root = arena.alloc(Node::Leaf(LeafNode::new()));
        Self {
            arena,
            root,
            order,
            max_leaf_keys: order - 1,
            min_leaf_keys: order / 2,
            max_inner_keys: order - 1,
            min_inner_keys: (order - 1) / 2,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut node = self.root;
        loop {
            match self.arena.get(node) {
                Node::Leaf(_) => return node,
                Node::Internal(i) => node = i.children[0],
            }
        }
    }

    fn rightmost_leaf(&self) -> NodeId {
        let mut node = self.root;
        loop {
            match self.arena.get(node) {
                Node::Leaf(_) => return node,
                Node::Internal(i) => node = *i.children.last().expect("internal node has children"),
            }
        }
    }

    /// Descends to the leaf that would contain `key`, recording, for each
    /// internal node visited, the child index taken (used to locate true
    /// siblings during rebalancing).
    fn descend(&self, key: &K) -> (NodeId, Vec<(NodeId, usize)>) {
        let mut path = Vec::new();
        let mut node = self.root;
        loop {
            match self.arena.get(node) {
                Node::Leaf(_) => return (node, path),
                Node::Internal(internal) => {
                    let idx = internal.keys.partition_point(|k| k <= key);
                    path.push((node, idx));
                    node = internal.children[idx];
                }
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&R> {
        let (leaf_id, _) = self.descend(key);
        let leaf = self.arena.get(leaf_id).as_leaf();
        let pos = leaf.keys.binary_search(key).ok()?;
        Some(&leaf.records[pos])
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut R> {
        let (leaf_id, _) = self.descend(key);
        let leaf = self.arena.get_mut(leaf_id).as_leaf_mut();
        let pos = leaf.keys.binary_search(key).ok()?;
        Some(&mut leaf.records[pos])
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts `(key, record)`. No-op (returns `false`) if `key` is already
    /// present, per spec §4.1.
    pub fn insert(&mut self, key: K, record: R) -> bool {
        let (leaf_id, path) = self.descend(&key);
        let leaf = self.arena.get_mut(leaf_id).as_leaf_mut();
        let pos = leaf.keys.partition_point(|k| *k < key);
        if pos < leaf.keys.len() && leaf.keys[pos] == key {
            return false;
        }
        leaf.keys.insert(pos, key);
        leaf.records.insert(pos, record);
        self.len += 1;

        if leaf.keys.len() <= self.max_leaf_keys {
            return true;
        }
        self.split_leaf(leaf_id, path);
        true
    }

    /// Inserts or overwrites `(key, record)` without the insert no-op rule;
    /// used by [`crate::index`] to update a non-unique index's per-key
    /// record set in place.
    pub fn replace(&mut self, key: K, record: R) -> Option<R> {
        if let Some(slot) = self.get_mut(&key) {
            return Some(std::mem::replace(slot, record));
        }
        self.insert(key, record);
        None
    }

    fn split_leaf(&mut self, leaf_id: NodeId, path: Vec<(NodeId, usize)>) {
        let (right_keys, right_records, old_next, sep_key) = {
            let leaf = self.arena.get_mut(leaf_id).as_leaf_mut();
            let mid = leaf.keys.len() / 2;
            let right_keys = leaf.keys.split_off(mid);
            let right_records = leaf.records.split_off(mid);
            let sep_key = right_keys[0].clone();
            (right_keys, right_records, leaf.next, sep_key)
        };
        let right_id = self.arena.alloc(Node::Leaf(LeafNode {
            keys: right_keys,
            records: right_records,
            prev: Some(leaf_id),
            next: old_next,
        }));
        if let Some(next_id) = old_next {
            self.arena.get_mut(next_id).as_leaf_mut().prev = Some(right_id);
        }
        self.arena.get_mut(leaf_id).as_leaf_mut().next = Some(right_id);

        self.propagate_split(path, sep_key, right_id);
    }

    fn propagate_split(&mut self, mut path: Vec<(NodeId, usize)>, mut sep: K, mut right: NodeId) {
        loop {
            let Some((parent_id, child_idx)) = path.pop() else {
                let new_root = self.arena.alloc(Node::Internal(InternalNode {
                    keys: vec![sep],
                    children: vec![self.root, right],
                }));
                self.root = new_root;
                return;
            };
            let parent = self.arena.get_mut(parent_id).as_internal_mut();
            parent.keys.insert(child_idx, sep);
            parent.children.insert(child_idx + 1, right);
            if parent.keys.len() <= self.max_inner_keys {
                return;
            }
            let mid = parent.keys.len() / 2;
            let right_keys = parent.keys.split_off(mid + 1);
            let promoted = parent.keys.pop().expect("split always leaves a middle key");
            let right_children = parent.children.split_off(mid + 1);
            right = self.arena.alloc(Node::Internal(InternalNode {
                keys: right_keys,
                children: right_children,
            }));
            sep = promoted;
        }
    }

    /// Removes `key`, returning its record. Steals from a sibling first;
    /// merges otherwise; shrinks the root if it becomes a childless
    /// internal node (spec §4.1).
    pub fn remove(&mut self, key: &K) -> Option<R> {
        let (leaf_id, path) = self.descend(key);
        let leaf = self.arena.get_mut(leaf_id).as_leaf_mut();
        let pos = leaf.keys.binary_search(key).ok()?;
        leaf.keys.remove(pos);
        let removed = leaf.records.remove(pos);
        self.len -= 1;

        if path.is_empty() {
            return Some(removed);
        }
        if self.arena.get(leaf_id).as_leaf().keys.len() >= self.min_leaf_keys {
            return Some(removed);
        }
        self.rebalance(leaf_id, path);
        Some(removed)
    }

    /// Walks up from an underfull node, borrowing from a sibling or merging
    /// and repeating one level up, until the tree is back in shape.
    fn rebalance(&mut self, mut node_id: NodeId, mut path: Vec<(NodeId, usize)>) {
        loop {
            let Some((parent_id, child_idx)) = path.pop() else {
                return;
            };
            let is_leaf = self.arena.get(node_id).is_leaf();
            let merged = if is_leaf {
                self.rebalance_leaf_level(node_id, parent_id, child_idx)
            } else {
                self.rebalance_internal_level(node_id, parent_id, child_idx)
            };
            if !merged {
                return;
            }
            let parent_keys_len = self.arena.get(parent_id).as_internal().keys.len();
            if path.is_empty() {
                if parent_keys_len == 0 {
                    let only_child = self.arena.get(parent_id).as_internal().children[0];
                    self.root = only_child;
                    self.arena.free(parent_id);
                }
                return;
            }
            if parent_keys_len < self.min_inner_keys {
                node_id = parent_id;
                continue;
            }
            return;
        }
    }

    /// Returns `true` if this level merged into a sibling (so the parent
    /// must itself be checked for underflow), `false` if a borrow resolved
    /// it locally.
    fn rebalance_leaf_level(&mut self, node_id: NodeId, parent_id: NodeId, child_idx: usize) -> bool {
        let left_id = if child_idx > 0 {
            Some(self.arena.get(parent_id).as_internal().children[child_idx - 1])
        } else {
            None
        };
        let right_id = {
            let parent = self.arena.get(parent_id).as_internal();
            if child_idx + 1 < parent.children.len() {
                Some(parent.children[child_idx + 1])
            } else {
                None
            }
        };

        if let Some(left_id) = left_id {
            if self.arena.get(left_id).as_leaf().keys.len() > self.min_leaf_keys {
                #[allow(clippy::unwrap_used)]
                let (k, r) = {
                    let left = self.arena.get_mut(left_id).as_leaf_mut();
                    (left.keys.pop().unwrap(), left.records.pop().unwrap())
                };
                let node = self.arena.get_mut(node_id).as_leaf_mut();
                node.keys.insert(0, k.clone());
                node.records.insert(0, r);
                self.arena.get_mut(parent_id).as_internal_mut().keys[child_idx - 1] = k;
                return false;
            }
        }
        if let Some(right_id) = right_id {
            if self.arena.get(right_id).as_leaf().keys.len() > self.min_leaf_keys {
                #[allow(clippy::unwrap_used)]
                let (k, r) = {
                    let right = self.arena.get_mut(right_id).as_leaf_mut();
                    (right.keys.remove(0), right.records.remove(0))
                };
                let node = self.arena.get_mut(node_id).as_leaf_mut();
                node.keys.push(k);
                node.records.push(r);
                let new_sep = self.arena.get(right_id).as_leaf().keys[0].clone();
                self.arena.get_mut(parent_id).as_internal_mut().keys[child_idx] = new_sep;
                return false;
            }
        }

        if let Some(left_id) = left_id {
            // Merge node into left sibling.
            let (keys, records, next) = {
                let node = self.arena.get_mut(node_id).as_leaf_mut();
                (
                    std::mem::take(&mut node.keys),
                    std::mem::take(&mut node.records),
                    node.next,
                )
            };
            {
                let left = self.arena.get_mut(left_id).as_leaf_mut();
                left.keys.extend(keys);
                left.records.extend(records);
                left.next = next;
            }
            if let Some(next_id) = next {
                self.arena.get_mut(next_id).as_leaf_mut().prev = Some(left_id);
            }
            self.arena.free(node_id);
            let parent = self.arena.get_mut(parent_id).as_internal_mut();
            parent.keys.remove(child_idx - 1);
            parent.children.remove(child_idx);
        } else {
            let right_id = right_id.expect("a node with no left sibling must have a right one");
            // Merge right sibling into node.
            let (keys, records, next) = {
                let right = self.arena.get_mut(right_id).as_leaf_mut();
                (
                    std::mem::take(&mut right.keys),
                    std::mem::take(&mut right.records),
                    right.next,
                )
            };
            {
                let node = self.arena.get_mut(node_id).as_leaf_mut();
                node.keys.extend(keys);
                node.records.extend(records);
                node.next = next;
            }
            if let Some(next_id) = next {
                self.arena.get_mut(next_id).as_leaf_mut().prev = Some(node_id);
            }
            self.arena.free(right_id);
            let parent = self.arena.get_mut(parent_id).as_internal_mut();
            parent.keys.remove(child_idx);
            parent.children.remove(child_idx + 1);
        }
        true
    }

    fn rebalance_internal_level(&mut self, node_id: NodeId, parent_id: NodeId, child_idx: usize) -> bool {
        let left_id = if child_idx > 0 {
            Some(self.arena.get(parent_id).as_internal().children[child_idx - 1])
        } else {
            None
        };
        let right_id = {
            let parent = self.arena.get(parent_id).as_internal();
            if child_idx + 1 < parent.children.len() {
                Some(parent.children[child_idx + 1])
            } else {
                None
            }
        };

        if let Some(left_id) = left_id {
            if self.arena.get(left_id).as_internal().keys.len() > self.min_inner_keys {
                #[allow(clippy::unwrap_used)]
                let (borrowed_key, borrowed_child) = {
                    let left = self.arena.get_mut(left_id).as_internal_mut();
                    (left.keys.pop().unwrap(), left.children.pop().unwrap())
                };
                let sep = self.arena.get(parent_id).as_internal().keys[child_idx - 1].clone();
                let node = self.arena.get_mut(node_id).as_internal_mut();
                node.keys.insert(0, sep);
                node.children.insert(0, borrowed_child);
                self.arena.get_mut(parent_id).as_internal_mut().keys[child_idx - 1] = borrowed_key;
                return false;
            }
        }
        if let Some(right_id) = right_id {
            if self.arena.get(right_id).as_internal().keys.len() > self.min_inner_keys {
                #[allow(clippy::unwrap_used)]
                let (borrowed_key, borrowed_child) = {
                    let right = self.arena.get_mut(right_id).as_internal_mut();
                    (right.keys.remove(0), right.children.remove(0))
                };
                let sep = self.arena.get(parent_id).as_internal().keys[child_idx].clone();
                let node = self.arena.get_mut(node_id).as_internal_mut();
                node.keys.push(sep);
                node.children.push(borrowed_child);
                self.arena.get_mut(parent_id).as_internal_mut().keys[child_idx] = borrowed_key;
                return false;
            }
        }

        if let Some(left_id) = left_id {
            let sep = self.arena.get(parent_id).as_internal().keys[child_idx - 1].clone();
            let (keys, children) = {
                let node = self.arena.get_mut(node_id).as_internal_mut();
                (std::mem::take(&mut node.keys), std::mem::take(&mut node.children))
            };
            {
                let left = self.arena.get_mut(left_id).as_internal_mut();
                left.keys.push(sep);
                left.keys.extend(keys);
                left.children.extend(children);
            }
            self.arena.free(node_id);
            let parent = self.arena.get_mut(parent_id).as_internal_mut();
            parent.keys.remove(child_idx - 1);
            parent.children.remove(child_idx);
        } else {
            let right_id = right_id.expect("a node with no left sibling must have a right one");
            let sep = self.arena.get(parent_id).as_internal().keys[child_idx].clone();
            let (keys, children) = {
                let right = self.arena.get_mut(right_id).as_internal_mut();
                (std::mem::take(&mut right.keys), std::mem::take(&mut right.children))
            };
            {
                let node = self.arena.get_mut(node_id).as_internal_mut();
                node.keys.push(sep);
                node.keys.extend(keys);
                node.children.extend(children);
            }
            self.arena.free(right_id);
            let parent = self.arena.get_mut(parent_id).as_internal_mut();
            parent.keys.remove(child_idx);
            parent.children.remove(child_idx + 1);
        }
        true
    }

    fn cursor_at(&self, leaf_id: NodeId, slot: usize) -> Cursor<K, R> {
        let leaf = self.arena.get(leaf_id).as_leaf();
        Cursor {
            current_key: Some(leaf.keys[slot].clone()),
            current_record: Some(leaf.records[slot].clone()),
            eof: false,
            found: true,
            position: Some((leaf_id, slot)),
        }
    }

    pub fn go_top(&self) -> Cursor<K, R> {
        if self.is_empty() {
            return Cursor::empty();
        }
        self.cursor_at(self.leftmost_leaf(), 0)
    }

    pub fn go_bottom(&self) -> Cursor<K, R> {
        if self.is_empty() {
            return Cursor::empty();
        }
        let leaf_id = self.rightmost_leaf();
        let n = self.arena.get(leaf_id).as_leaf().keys.len();
        self.cursor_at(leaf_id, n - 1)
    }

    pub fn seek(&self, key: &K, mode: SeekMode) -> Cursor<K, R> {
        if self.is_empty() {
            return Cursor::empty();
        }
        let (leaf_id, _) = self.descend(key);
        match mode {
            SeekMode::Exact => {
                let leaf = self.arena.get(leaf_id).as_leaf();
                match leaf.keys.binary_search(key) {
                    Ok(pos) => self.cursor_at(leaf_id, pos),
                    Err(_) => Cursor::empty(),
                }
            }
            SeekMode::Ge => {
                let leaf = self.arena.get(leaf_id).as_leaf();
                let pos = leaf.keys.partition_point(|k| k < key);
                if pos < leaf.keys.len() {
                    self.cursor_at(leaf_id, pos)
                } else {
                    match leaf.next {
                        Some(next_id) if !self.arena.get(next_id).as_leaf().keys.is_empty() => {
                            self.cursor_at(next_id, 0)
                        }
                        _ => Cursor::empty(),
                    }
                }
            }
            SeekMode::Le => {
                let leaf = self.arena.get(leaf_id).as_leaf();
                let pos = leaf.keys.partition_point(|k| k <= key);
                if pos > 0 {
                    self.cursor_at(leaf_id, pos - 1)
                } else {
                    match leaf.prev {
                        Some(prev_id) => {
                            let plen = self.arena.get(prev_id).as_leaf().keys.len();
                            if plen > 0 {
                                self.cursor_at(prev_id, plen - 1)
                            } else {
                                Cursor::empty()
                            }
                        }
                        None => Cursor::empty(),
                    }
                }
            }
        }
    }

    /// First entry with key `>= k` (`> k` if `open`).
    pub fn go_to_lower_bound(&self, k: &K, open: bool) -> Cursor<K, R> {
        let cur = self.seek(k, SeekMode::Ge);
        if open {
            if let Some(ck) = &cur.current_key {
                if ck == k {
                    return self.next(&cur);
                }
            }
        }
        cur
    }

    /// Last entry with key `<= k` (`< k` if `open`).
    pub fn go_to_upper_bound(&self, k: &K, open: bool) -> Cursor<K, R> {
        let cur = self.seek(k, SeekMode::Le);
        if open {
            if let Some(ck) = &cur.current_key {
                if ck == k {
                    return self.prev(&cur);
                }
            }
        }
        cur
    }

    pub fn next(&self, cursor: &Cursor<K, R>) -> Cursor<K, R> {
        let Some((leaf_id, slot)) = cursor.position else {
            return Cursor::empty();
        };
        let leaf = self.arena.get(leaf_id).as_leaf();
        if slot + 1 < leaf.keys.len() {
            return self.cursor_at(leaf_id, slot + 1);
        }
        match leaf.next {
            Some(next_id) if !self.arena.get(next_id).as_leaf().keys.is_empty() => {
                self.cursor_at(next_id, 0)
            }
            _ => Cursor::empty(),
        }
    }

    pub fn prev(&self, cursor: &Cursor<K, R>) -> Cursor<K, R> {
        let Some((leaf_id, slot)) = cursor.position else {
            return Cursor::empty();
        };
        if slot > 0 {
            return self.cursor_at(leaf_id, slot - 1);
        }
        let leaf = self.arena.get(leaf_id).as_leaf();
        match leaf.prev {
            Some(prev_id) => {
                let plen = self.arena.get(prev_id).as_leaf().keys.len();
                if plen > 0 {
                    self.cursor_at(prev_id, plen - 1)
                } else {
                    Cursor::empty()
                }
            }
            None => Cursor::empty(),
        }
    }

    /// Advances (or, for negative `n`, retreats) the cursor by `n` entries.
    pub fn skip(&self, cursor: &Cursor<K, R>, n: i64) -> Cursor<K, R> {
        let mut cur = cursor.clone();
        let mut remaining = n;
        while remaining > 0 && !cur.eof {
            cur = self.next(&cur);
            remaining -= 1;
        }
        while remaining < 0 && !cur.eof {
            cur = self.prev(&cur);
            remaining += 1;
        }
        cur
    }

    /// Rebuilds the tree into a maximally filled one (spec §4.1 `pack`).
    pub fn pack(&mut self) {
        let entries: Vec<(K, R)> = self.iter_all();
        *self = Self::bulk_load(entries, self.order);
    }

    fn iter_all(&self) -> Vec<(K, R)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.go_top();
        while let (Some(k), Some(r)) = (cur.current_key.clone(), cur.current_record.clone()) {
            out.push((k, r));
            cur = self.next(&cur);
        }
        out
    }

    fn bulk_load(entries: Vec<(K, R)>, order: usize) -> Self {
        let mut tree = Self::new(order);
        if entries.is_empty() {
            return tree;
        }
        let mut arena = Arena::new();
        let max_leaf = order - 1;
        let mut leaf_ids = Vec::new();
        let mut chunks: Vec<&[(K, R)]> = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let remaining = entries.len() - i;
            // Avoid leaving a dangling tail smaller than the minimum fill.
            let take = if remaining > max_leaf && remaining < max_leaf + tree.min_leaf_keys {
                remaining / 2
            } else {
                remaining.min(max_leaf)
            };
            chunks.push(&entries[i..i + take]);
            i += take;
        }
        for chunk in &chunks {
            let keys = chunk.iter().map(|(k, _)| k.clone()).collect();
            let records = chunk.iter().map(|(_, r)| r.clone()).collect();
            let id = arena.alloc(Node::Leaf(LeafNode {
                keys,
                records,
                prev: None,
                next: None,
            }));
            leaf_ids.push(id);
        }
        for w in 0..leaf_ids.len() {
            let prev = if w == 0 { None } else { Some(leaf_ids[w - 1]) };
            let next = leaf_ids.get(w + 1).copied();
            let leaf = arena.get_mut(leaf_ids[w]).as_leaf_mut();
            leaf.prev = prev;
            leaf.next = next;
        }

        let mut level: Vec<NodeId> = leaf_ids.clone();
        let mut level_first_keys: Vec<K> = chunks.iter().map(|c| c[0].0.clone()).collect();
        while level.len() > 1 {
            let max_children = order;
            let mut next_level = Vec::new();
            let mut next_first_keys = Vec::new();
            let mut idx = 0;
            while idx < level.len() {
                let end = (idx + max_children).min(level.len());
                let children = level[idx..end].to_vec();
                let keys = level_first_keys[idx + 1..end].to_vec();
                next_first_keys.push(level_first_keys[idx].clone());
                let id = arena.alloc(Node::Internal(InternalNode { keys, children }));
                next_level.push(id);
                idx = end;
            }
            level = next_level;
            level_first_keys = next_first_keys;
        }
        tree.root = level[0];
        tree.arena = arena;
        tree.len = entries.len();
        tree
    }

    /// Entries whose key falls within `range`, in ascending or descending
    /// order, up to `limit` (`None` for unbounded).
    pub fn range(&self, range: &crate::keyrange::KeyRange, ascending: bool, limit: Option<usize>) -> Vec<(K, R)>
    where
        K: Into<crate::key::SecondaryKey> + Clone,
    {
        let mut out = Vec::new();
        let mut cur = match (&range.lower, &range.upper, ascending) {
            (Some(l), _, true) => self.go_to_lower_bound(l, range.lower_open),
            (None, _, true) => self.go_top(),
            (_, Some(u), false) => self.go_to_upper_bound(u, range.upper_open),
            (_, None, false) => self.go_bottom(),
        };
        while let (Some(k), Some(r)) = (cur.current_key.clone(), cur.current_record.clone()) {
            let sk: crate::key::SecondaryKey = k.clone().into();
            if !range.includes(&sk) {
                break;
            }
            out.push((k, r));
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
            cur = if ascending { self.next(&cur) } else { self.prev(&cur) };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(n: u32, order: usize) -> BPlusTree<u32, u32> {
        let mut t = BPlusTree::new(order);
        for i in 0..n {
            assert!(t.insert(i, i * 10));
        }
        t
    }

    #[test]
    fn insert_is_a_no_op_for_existing_key() {
        let mut t = BPlusTree::new(DEFAULT_ORDER);
        assert!(t.insert(1, 100));
        assert!(!t.insert(1, 999));
        assert_eq!(t.get(&1), Some(&100));
    }

    #[test]
    fn ascending_traversal_after_many_splits() {
        let t = tree_with(500, 3);
        let mut cur = t.go_top();
        let mut count = 0;
        let mut last = None;
        while let Some(k) = cur.current_key {
            if let Some(l) = last {
                assert!(k > l);
            }
            last = Some(k);
            count += 1;
            cur = t.next(&Cursor {
                current_key: Some(k),
                current_record: cur.current_record.clone(),
                eof: cur.eof,
                found: cur.found,
                position: cur.position,
            });
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn remove_all_leaves_empty_tree() {
        let mut t = tree_with(200, 3);
        for i in 0..200 {
            assert!(t.remove(&i).is_some());
        }
        assert!(t.is_empty());
        assert!(t.go_top().eof);
    }

    #[test]
    fn interleaved_insert_remove_stays_consistent() {
        let mut t = BPlusTree::new(3);
        let mut present = std::collections::BTreeSet::new();
        let mut seed = 7u32;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let key = seed % 100;
            if present.contains(&key) {
                assert!(t.remove(&key).is_some());
                present.remove(&key);
            } else {
                assert!(t.insert(key, key));
                present.insert(key);
            }
            assert_eq!(t.len(), present.len());
        }
        for k in &present {
            assert_eq!(t.get(k), Some(k));
        }
    }

    #[test]
    fn seek_modes_find_nearest_keys() {
        let mut t = BPlusTree::new(4);
        for k in [10, 20, 30, 40, 50] {
            t.insert(k, k);
        }
        assert_eq!(t.seek(&25, SeekMode::Ge).current_key, Some(30));
        assert_eq!(t.seek(&25, SeekMode::Le).current_key, Some(20));
        assert_eq!(t.seek(&30, SeekMode::Exact).current_key, Some(30));
        assert!(t.seek(&5, SeekMode::Le).eof);
        assert!(t.seek(&55, SeekMode::Ge).eof);
    }

    #[test]
    fn pack_preserves_order_and_contents() {
        let mut t = tree_with(100, 3);
        t.pack();
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(&i), Some(&(i * 10)));
        }
    }

    #[test]
    fn skip_moves_forward_and_backward() {
        let t = tree_with(50, 4);
        let top = t.go_top();
        let fwd = t.skip(&top, 10);
        assert_eq!(fwd.current_key, Some(10));
        let back = t.skip(&fwd, -5);
        assert_eq!(back.current_key, Some(5));
    }
}
