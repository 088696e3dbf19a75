//! Concurrent B-link tree
//!
//! Every node carries a `high_key` (exclusive upper bound, `None` = +∞) and a
//! link to its right sibling. A node that splits keeps its lock until the new
//! right node, its own high key and its right link are installed, so a reader
//! that arrives late simply follows the link. Readers therefore never hold
//! more than one node lock.
//!
//! Structural deletes (merges) are rare and run under an exclusive
//! restructure lock; every other operation holds it shared. A node emptied by
//! a merge becomes a forwarding node whose right link points at the survivor,
//! so a lazy range scan parked on it still makes progress.
//!
//! Nodes live in an arena. A detached node is retired and its slot is only
//! handed out again once a merge finds no range scan registered, since a
//! parked scan may still name it.

use crate::index::IndexEntry;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::Key;
use parking_lot::{ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub type NodeId = usize;

type NodeRef = Arc<RwLock<Node>>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Node>;

#[derive(Debug)]
pub struct LeafNode {
    keys: Vec<Key>,
    entries: Vec<IndexEntry>,
    high_key: Option<Key>,
    right: Option<NodeId>,
    detached: bool,
}

#[derive(Debug)]
pub struct InternalNode {
    /// Height above the leaves (leaves are level 0)
    level: u32,
    /// `children[i]` covers `[keys[i-1], keys[i])`
    keys: Vec<Key>,
    children: Vec<NodeId>,
    high_key: Option<Key>,
    right: Option<NodeId>,
    detached: bool,
}

impl InternalNode {
    fn child_for(&self, key: &str) -> (usize, NodeId) {
        let idx = self.keys.partition_point(|k| k.as_str() <= key);
        (idx, self.children[idx])
    }
}

#[derive(Debug)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf(LeafNode {
            keys: Vec::new(),
            entries: Vec::new(),
            high_key: None,
            right: None,
            detached: false,
        })
    }

    fn level(&self) -> u32 {
        match self {
            Node::Internal(n) => n.level,
            Node::Leaf(_) => 0,
        }
    }

    fn high_key(&self) -> Option<&Key> {
        match self {
            Node::Internal(n) => n.high_key.as_ref(),
            Node::Leaf(n) => n.high_key.as_ref(),
        }
    }

    fn right(&self) -> Option<NodeId> {
        match self {
            Node::Internal(n) => n.right,
            Node::Leaf(n) => n.right,
        }
    }

    fn is_detached(&self) -> bool {
        match self {
            Node::Internal(n) => n.detached,
            Node::Leaf(n) => n.detached,
        }
    }

    fn keys(&self) -> &[Key] {
        match self {
            Node::Internal(n) => &n.keys,
            Node::Leaf(n) => &n.keys,
        }
    }

    fn set_link(&mut self, high_key: Option<Key>, right: Option<NodeId>) {
        match self {
            Node::Internal(n) => {
                n.high_key = high_key;
                n.right = right;
            }
            Node::Leaf(n) => {
                n.high_key = high_key;
                n.right = right;
            }
        }
    }

    /// Right sibling to move to when `key` is at or past this node's range
    fn must_move_right(&self, key: &str) -> Option<NodeId> {
        match self.high_key() {
            Some(high) if key >= high.as_str() => self.right(),
            _ => None,
        }
    }

    fn size(&self) -> usize {
        self.keys().len()
    }

    /// Move the upper half into a new node. Returns the separator (first key
    /// covered by the new node) and the node itself, not yet linked.
    fn split_off(&mut self) -> (Key, Node) {
        match self {
            Node::Leaf(leaf) => {
                let mid = leaf.keys.len() / 2;
                let keys = leaf.keys.split_off(mid);
                let entries = leaf.entries.split_off(mid);
                let separator = keys[0].clone();
                (
                    separator,
                    Node::Leaf(LeafNode {
                        keys,
                        entries,
                        high_key: None,
                        right: None,
                        detached: false,
                    }),
                )
            }
            Node::Internal(inner) => {
                let mid = inner.keys.len() / 2;
                let mut keys = inner.keys.split_off(mid);
                let separator = keys.remove(0);
                let children = inner.children.split_off(mid + 1);
                (
                    separator,
                    Node::Internal(InternalNode {
                        level: inner.level,
                        keys,
                        children,
                        high_key: None,
                        right: None,
                        detached: false,
                    }),
                )
            }
        }
    }

    fn leaf_upsert(&mut self, key: Key, entry: IndexEntry) -> StoreResult<Option<IndexEntry>> {
        let Node::Leaf(leaf) = self else {
            return Err(StoreError::Corruption(
                "index descent ended on an internal node".to_string(),
            ));
        };
        match leaf.keys.binary_search(&key) {
            Ok(idx) => Ok(Some(std::mem::replace(&mut leaf.entries[idx], entry))),
            Err(idx) => {
                leaf.keys.insert(idx, key);
                leaf.entries.insert(idx, entry);
                Ok(None)
            }
        }
    }

    fn leaf_get(&self, key: &str) -> StoreResult<Option<IndexEntry>> {
        let Node::Leaf(leaf) = self else {
            return Err(StoreError::Corruption(
                "index descent ended on an internal node".to_string(),
            ));
        };
        Ok(leaf
            .keys
            .binary_search_by(|k| k.as_str().cmp(key))
            .ok()
            .map(|idx| leaf.entries[idx].clone()))
    }

    fn leaf_remove(&mut self, key: &Key) -> StoreResult<Option<IndexEntry>> {
        let Node::Leaf(leaf) = self else {
            return Err(StoreError::Corruption(
                "index descent ended on an internal node".to_string(),
            ));
        };
        Ok(leaf.keys.binary_search(key).ok().map(|idx| {
            leaf.keys.remove(idx);
            leaf.entries.remove(idx)
        }))
    }

    fn insert_child(&mut self, separator: Key, child: NodeId) -> StoreResult<()> {
        let Node::Internal(inner) = self else {
            return Err(StoreError::Corruption(
                "split propagated into a leaf".to_string(),
            ));
        };
        let idx = inner.keys.partition_point(|k| k < &separator);
        inner.keys.insert(idx, separator);
        inner.children.insert(idx + 1, child);
        Ok(())
    }

    fn can_absorb(&self, other: &Node, fanout: usize) -> bool {
        match (self, other) {
            (Node::Leaf(a), Node::Leaf(b)) => a.keys.len() + b.keys.len() <= fanout,
            (Node::Internal(a), Node::Internal(b)) => {
                a.children.len() + b.children.len() <= fanout + 1
            }
            _ => false,
        }
    }

    /// Append the right neighbour's contents. `separator` is the parent key
    /// that divided the two nodes.
    fn absorb(&mut self, other: &mut Node, separator: Key) -> StoreResult<()> {
        match (self, other) {
            (Node::Leaf(a), Node::Leaf(b)) => {
                a.keys.append(&mut b.keys);
                a.entries.append(&mut b.entries);
                a.high_key = b.high_key.take();
                a.right = b.right;
            }
            (Node::Internal(a), Node::Internal(b)) => {
                a.keys.push(separator);
                a.keys.append(&mut b.keys);
                a.children.append(&mut b.children);
                a.high_key = b.high_key.take();
                a.right = b.right;
            }
            _ => {
                return Err(StoreError::Corruption(
                    "siblings at the same level differ in kind".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Turn into a forwarding node
    fn detach(&mut self, forward_to: NodeId) {
        match self {
            Node::Leaf(n) => {
                n.keys.clear();
                n.entries.clear();
                n.detached = true;
                n.high_key = None;
                n.right = Some(forward_to);
            }
            Node::Internal(n) => {
                n.keys.clear();
                n.children.clear();
                n.detached = true;
                n.high_key = None;
                n.right = Some(forward_to);
            }
        }
    }
}

/// Counters exposed through store statistics
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub entries: usize,
    pub height: u32,
    pub nodes: usize,
    pub splits: u64,
    pub merges: u64,
}

/// Shape reported by a successful invariant check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub height: u32,
    pub leaves: usize,
    pub internals: usize,
    pub entries: usize,
}

/// Slots of detached nodes
#[derive(Debug, Default)]
struct Reclaim {
    /// Detached, possibly still named by a live scan
    retired: Vec<NodeId>,
    /// Unreachable, ready for reuse
    free: Vec<NodeId>,
}

/// Concurrent B-link tree from keys to index entries
pub struct BLinkTree {
    fanout: usize,
    arena: RwLock<Vec<NodeRef>>,
    root: RwLock<NodeId>,
    restructure: RwLock<()>,
    reclaim: Mutex<Reclaim>,
    /// Range scans alive; they hold node ids outside the restructure lock
    scans: AtomicUsize,
    len: AtomicUsize,
    splits: AtomicU64,
    merges: AtomicU64,
}

impl BLinkTree {
    pub fn new(fanout: usize) -> Self {
        Self {
            fanout: fanout.max(3),
            arena: RwLock::new(vec![Arc::new(RwLock::new(Node::empty_leaf()))]),
            root: RwLock::new(0),
            restructure: RwLock::new(()),
            reclaim: Mutex::new(Reclaim::default()),
            scans: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn min_fill(&self) -> usize {
        (self.fanout / 2).max(1)
    }

    fn min_children(&self) -> usize {
        (self.fanout / 2).max(2)
    }

    fn node(&self, id: NodeId) -> NodeRef {
        self.arena.read()[id].clone()
    }

    fn alloc(&self, node: Node) -> NodeId {
        let node = Arc::new(RwLock::new(node));
        let reused = self.reclaim.lock().free.pop();
        let mut arena = self.arena.write();
        match reused {
            Some(id) => {
                arena[id] = node;
                id
            }
            None => {
                arena.push(node);
                arena.len() - 1
            }
        }
    }

    /// Make retired slots reusable when no scan can still reach them.
    /// Caller holds the restructure lock exclusively, so no new scan can
    /// register meanwhile.
    fn reclaim_detached(&self) {
        if self.scans.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut reclaim = self.reclaim.lock();
        let retired = std::mem::take(&mut reclaim.retired);
        reclaim.free.extend(retired);
    }

    fn root_id(&self) -> NodeId {
        *self.root.read()
    }

    /// Walk to the leaf covering `key`, recording the internal node visited
    /// at each level.
    fn descend(&self, key: &str, path: &mut Vec<NodeId>) -> NodeId {
        let mut id = self.root_id();
        loop {
            let node = self.node(id);
            let guard = node.read();
            if let Some(right) = guard.must_move_right(key) {
                id = right;
                continue;
            }
            match &*guard {
                Node::Internal(inner) => {
                    path.push(id);
                    id = inner.child_for(key).1;
                }
                Node::Leaf(_) => return id,
            }
        }
    }

    /// Write-lock the node at `id`'s level whose range covers `key`,
    /// coupling locks while moving right.
    fn lock_covering(&self, mut id: NodeId, key: &str) -> (NodeId, WriteGuard) {
        let mut guard = self.node(id).write_arc();
        while let Some(right) = guard.must_move_right(key) {
            guard = self.node(right).write_arc();
            id = right;
        }
        (id, guard)
    }

    fn find_at_level(&self, key: &str, level: u32) -> StoreResult<NodeId> {
        let mut id = self.root_id();
        loop {
            let node = self.node(id);
            let guard = node.read();
            if let Some(right) = guard.must_move_right(key) {
                id = right;
                continue;
            }
            if guard.level() == level {
                return Ok(id);
            }
            match &*guard {
                Node::Internal(inner) if inner.level > level => id = inner.child_for(key).1,
                _ => {
                    return Err(StoreError::Corruption(format!(
                        "no index node at level {} covers {}",
                        level, key
                    )))
                }
            }
        }
    }

    /// Point lookup
    pub fn lookup(&self, key: &Key) -> StoreResult<Option<IndexEntry>> {
        let _shared = self.restructure.read();
        let leaf_id = self.descend(key.as_str(), &mut Vec::new());
        let mut id = leaf_id;
        loop {
            let node = self.node(id);
            let guard = node.read();
            match guard.must_move_right(key.as_str()) {
                Some(right) => id = right,
                None => return guard.leaf_get(key.as_str()),
            }
        }
    }

    /// Insert or replace; returns the replaced entry
    pub fn insert(&self, key: Key, entry: IndexEntry) -> StoreResult<Option<IndexEntry>> {
        let _shared = self.restructure.read();
        let mut path = Vec::new();
        let leaf_id = self.descend(key.as_str(), &mut path);
        let (leaf_id, mut guard) = self.lock_covering(leaf_id, key.as_str());

        let previous = guard.leaf_upsert(key, entry)?;
        if previous.is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
            if guard.size() > self.fanout {
                self.split(leaf_id, guard, path)?;
            }
        }
        Ok(previous)
    }

    fn split(&self, mut id: NodeId, mut guard: WriteGuard, mut path: Vec<NodeId>) -> StoreResult<()> {
        while guard.size() > self.fanout {
            let level = guard.level();
            let (separator, mut right) = guard.split_off();
            right.set_link(guard.high_key().cloned(), guard.right());
            let right_id = self.alloc(right);
            guard.set_link(Some(separator.clone()), Some(right_id));
            self.splits.fetch_add(1, Ordering::Relaxed);

            let parent_id = match path.pop() {
                Some(parent) => parent,
                None => {
                    let mut root = self.root.write();
                    if *root == id {
                        let new_root = self.alloc(Node::Internal(InternalNode {
                            level: level + 1,
                            keys: vec![separator],
                            children: vec![id, right_id],
                            high_key: None,
                            right: None,
                            detached: false,
                        }));
                        *root = new_root;
                        tracing::debug!("Index grew to height {}", level + 2);
                        return Ok(());
                    }
                    // Another split raised the root since we descended
                    drop(root);
                    self.find_at_level(separator.as_str(), level + 1)?
                }
            };

            let (parent_id, mut parent) = self.lock_covering(parent_id, separator.as_str());
            parent.insert_child(separator, right_id)?;
            guard = parent;
            id = parent_id;
        }
        Ok(())
    }

    /// Remove a key; returns the removed entry
    pub fn delete(&self, key: &Key) -> StoreResult<Option<IndexEntry>> {
        let (removed, underflow) = {
            let _shared = self.restructure.read();
            let mut path = Vec::new();
            let leaf_id = self.descend(key.as_str(), &mut path);
            let (_, mut guard) = self.lock_covering(leaf_id, key.as_str());
            let removed = guard.leaf_remove(key)?;
            let underflow =
                removed.is_some() && !path.is_empty() && guard.size() < self.min_fill();
            (removed, underflow)
        };

        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        if underflow {
            let _exclusive = self.restructure.write();
            self.rebalance(key.as_str())?;
        }
        Ok(removed)
    }

    fn underflows(&self, id: NodeId) -> bool {
        match &*self.node(id).read() {
            Node::Leaf(leaf) => leaf.keys.len() < self.min_fill(),
            Node::Internal(inner) => inner.children.len() < self.min_children(),
        }
    }

    /// Merge underfull nodes on the path to `key`, bottom up. Caller holds
    /// the restructure lock exclusively.
    fn rebalance(&self, key: &str) -> StoreResult<()> {
        let mut path: Vec<(NodeId, usize)> = Vec::new();
        let mut id = self.root_id();
        loop {
            let node = self.node(id);
            let guard = node.read();
            if let Some(right) = guard.must_move_right(key) {
                id = right;
                continue;
            }
            match &*guard {
                Node::Internal(inner) => {
                    let (idx, child) = inner.child_for(key);
                    path.push((id, idx));
                    id = child;
                }
                Node::Leaf(_) => break,
            }
        }

        // A failed merge below can still leave an underfull parent, so every
        // level on the path gets a chance
        let mut child = id;
        while let Some((parent_id, idx)) = path.pop() {
            if self.underflows(child) {
                self.merge_children(parent_id, idx)?;
            }
            child = parent_id;
        }
        self.collapse_root();
        self.reclaim_detached();
        Ok(())
    }

    /// Merge child `idx` of `parent_id` with an adjacent sibling (the right
    /// one, or the left one for the last child). Returns false when the pair
    /// would not fit in one node.
    fn merge_children(&self, parent_id: NodeId, idx: usize) -> StoreResult<bool> {
        let parent_ref = self.node(parent_id);
        let mut parent = parent_ref.write();
        let Node::Internal(inner) = &mut *parent else {
            return Err(StoreError::Corruption(
                "merge parent is a leaf".to_string(),
            ));
        };
        if inner.children.len() < 2 {
            return Ok(false);
        }

        let li = if idx + 1 < inner.children.len() { idx } else { idx - 1 };
        let (left_id, right_id) = (inner.children[li], inner.children[li + 1]);
        let left_ref = self.node(left_id);
        let right_ref = self.node(right_id);
        let mut left = left_ref.write();
        let mut right = right_ref.write();
        if !left.can_absorb(&right, self.fanout) {
            return Ok(false);
        }

        left.absorb(&mut right, inner.keys[li].clone())?;
        right.detach(left_id);
        self.reclaim.lock().retired.push(right_id);
        inner.keys.remove(li);
        inner.children.remove(li + 1);
        self.merges.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drop internal roots that have a single child
    fn collapse_root(&self) {
        loop {
            let root_id = self.root_id();
            let root_ref = self.node(root_id);
            let mut root_node = root_ref.write();
            let only_child = match &*root_node {
                Node::Internal(inner) if inner.children.len() == 1 => inner.children[0],
                _ => return,
            };
            root_node.detach(only_child);
            self.reclaim.lock().retired.push(root_id);
            *self.root.write() = only_child;
            tracing::debug!("Index root collapsed into node {}", only_child);
        }
    }

    /// Lazy scan over keys starting with `prefix`, in key order
    pub fn range_scan(&self, prefix: &str) -> RangeScan<'_> {
        let start = {
            let _shared = self.restructure.read();
            self.scans.fetch_add(1, Ordering::AcqRel);
            self.descend(prefix, &mut Vec::new())
        };
        RangeScan {
            tree: self,
            prefix: prefix.to_string(),
            next_leaf: Some(start),
            last: None,
            buffer: VecDeque::new(),
            done: false,
            registered: true,
        }
    }

    /// Full leaf-level walk along sibling links
    pub fn scan(&self) -> RangeScan<'_> {
        self.range_scan("")
    }

    pub fn stats(&self) -> IndexStats {
        let height = self.node(self.root_id()).read().level() + 1;
        let detached = {
            let reclaim = self.reclaim.lock();
            reclaim.retired.len() + reclaim.free.len()
        };
        IndexStats {
            entries: self.len(),
            height,
            nodes: self.arena.read().len().saturating_sub(detached),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
        }
    }

    /// Verify ordering, high keys, sibling links, parent/child agreement and
    /// the entry count.
    pub fn check_invariants(&self) -> StoreResult<TreeShape> {
        let _exclusive = self.restructure.write();
        let fail = |msg: String| Err(StoreError::Corruption(format!("index invariant: {}", msg)));

        let root_id = self.root_id();
        let root_level = self.node(root_id).read().level();
        let mut shape = TreeShape {
            height: root_level + 1,
            ..Default::default()
        };

        // Expected node sequence of the level being walked, with the high key
        // each node's parent assigned to it
        let mut expected: Vec<(NodeId, Option<Key>)> = vec![(root_id, None)];

        for level in (0..=root_level).rev() {
            let mut next_level: Vec<(NodeId, Option<Key>)> = Vec::new();
            let mut low: Option<Key> = None;
            let mut cursor = expected.first().map(|(id, _)| *id);
            let mut walked = 0;

            while let Some(id) = cursor {
                let node_ref = self.node(id);
                let node = node_ref.read();
                let Some((expected_id, expected_high)) = expected.get(walked) else {
                    return fail(format!("level {} has more nodes than its parents list", level));
                };
                if *expected_id != id {
                    return fail(format!(
                        "level {} link leads to node {} but parent lists {}",
                        level, id, expected_id
                    ));
                }
                if node.is_detached() || node.level() != level {
                    return fail(format!("node {} detached or at wrong level", id));
                }
                if node.high_key() != expected_high.as_ref() {
                    return fail(format!("node {} high key disagrees with its parent", id));
                }
                if node.high_key().is_some() != node.right().is_some() {
                    return fail(format!("node {} has a high key without a right link", id));
                }

                let keys = node.keys();
                if keys.windows(2).any(|w| w[0] >= w[1]) {
                    return fail(format!("node {} keys out of order", id));
                }
                if let (Some(first), Some(low)) = (keys.first(), low.as_ref()) {
                    if first < low {
                        return fail(format!("node {} holds {} below its low bound", id, first));
                    }
                }
                if let (Some(last), Some(high)) = (keys.last(), node.high_key()) {
                    if last >= high {
                        return fail(format!("node {} holds {} at or past its high key", id, last));
                    }
                }
                if keys.len() > self.fanout {
                    return fail(format!("node {} overfull", id));
                }

                match &*node {
                    Node::Leaf(leaf) => {
                        if leaf.entries.len() != leaf.keys.len() {
                            return fail(format!("leaf {} key/entry count mismatch", id));
                        }
                        shape.leaves += 1;
                        shape.entries += leaf.keys.len();
                    }
                    Node::Internal(inner) => {
                        if inner.children.len() != inner.keys.len() + 1 {
                            return fail(format!("internal {} child count mismatch", id));
                        }
                        shape.internals += 1;
                        for (i, child) in inner.children.iter().enumerate() {
                            let high = inner.keys.get(i).cloned().or_else(|| inner.high_key.clone());
                            next_level.push((*child, high));
                        }
                    }
                }

                low = node.high_key().cloned();
                cursor = node.right();
                walked += 1;
            }

            if walked != expected.len() {
                return fail(format!(
                    "level {} walk saw {} nodes, parents list {}",
                    level,
                    walked,
                    expected.len()
                ));
            }
            expected = next_level;
        }

        if shape.entries != self.len() {
            return fail(format!(
                "leaves hold {} entries but len is {}",
                shape.entries,
                self.len()
            ));
        }
        Ok(shape)
    }
}

/// Lazy iterator over a key range, one leaf at a time
pub struct RangeScan<'a> {
    tree: &'a BLinkTree,
    prefix: String,
    next_leaf: Option<NodeId>,
    /// Last key handed out; forwarding may revisit earlier keys
    last: Option<Key>,
    buffer: VecDeque<(Key, IndexEntry)>,
    done: bool,
    /// Counted in the tree's live scans
    registered: bool,
}

impl RangeScan<'_> {
    fn release(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.tree.scans.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn fill(&mut self) {
        let Some(id) = self.next_leaf else {
            self.done = true;
            return;
        };
        let _shared = self.tree.restructure.read();
        let node_ref = self.tree.node(id);
        let node = node_ref.read();
        self.next_leaf = node.right();

        match &*node {
            Node::Leaf(leaf) if !leaf.detached => {
                for (key, entry) in leaf.keys.iter().zip(&leaf.entries) {
                    if key.as_str() < self.prefix.as_str() {
                        continue;
                    }
                    if self.last.as_ref().is_some_and(|last| key <= last) {
                        continue;
                    }
                    if !key.as_str().starts_with(&self.prefix) {
                        self.done = true;
                        break;
                    }
                    self.buffer.push_back((key.clone(), entry.clone()));
                }
                if let Some((key, _)) = self.buffer.back() {
                    self.last = Some(key.clone());
                }
            }
            // Forwarding node: follow its link
            Node::Leaf(_) => {}
            Node::Internal(_) => self.done = true,
        }
    }
}

impl Iterator for RangeScan<'_> {
    type Item = (Key, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.done {
                self.release();
                return None;
            }
            self.fill();
        }
    }
}

impl Drop for RangeScan<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
