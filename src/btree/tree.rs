//! # Disk-Resident B+Tree
//!
//! The tree never holds nodes by memory pointer: every traversal step
//! resolves a `(page_id, slot)` header through the page cache, and no
//! resolved reference survives a mutation that could relocate its target.
//!
//! [`TreeReader`] serves point search, range query, and ordered traversal
//! over shared references; [`BTree`] adds insertion and owns the split
//! machinery. Both derive the degree once at open time from page capacity
//! divided by the per-entry size estimate.
//!
//! ## Insert
//!
//! Inserts descend proactively: a full child (`2t - 1` keys) is split
//! before it is entered, and a full root is split first by growing the tree
//! upward, so the descent never lands in a full node. At the leaf, the
//! insertion slot comes from a binary search over the whole key sequence;
//! an equal key at that slot is a duplicate and a logic error.
//!
//! Leaf splits copy the median key up and keep it in the right sibling, so
//! a separator in an internal node always equals the first key of its right
//! subtree and descent sends equal keys right. Internal splits move the
//! median up.
//!
//! ## Two-Level Splitting
//!
//! A node split allocates a sibling node and persists it into an index page
//! with room (or a fresh one). A node *update* that overflows its page's
//! byte capacity triggers the second level: the page's node list is cut at
//! its midpoint and the tail half moved to another index page, after which
//! every moved node's self-header, and every header referencing a moved
//! node, is rewritten. Reference patching replaces fixed-width header
//! values only, so patch writes can never overflow a page and cascade.
//!
//! ## Clustered vs Non-Clustered
//!
//! A clustered leaf owns one whole data page; splitting the leaf physically
//! splits the page's rows at the same index as the keys. A leaf whose page
//! fills at a single key has no median, so it splits degenerately: the
//! incoming key gets a sibling leaf of its own, and rows wider than half a
//! page end up one per leaf. A non-clustered leaf stores one row locator
//! per key and splitting moves only locators.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::btree::key::Key;
use crate::btree::node::{Node, NodeHeader, NodePayload};
use crate::config::{MAX_DEGREE, MAX_TREE_DEPTH, MIN_DEGREE, PAGE_USABLE_SIZE};
use crate::database::table::IndexMeta;
use crate::row::{Row, RowLocator};
use crate::storage::alloc_page::PfsKind;
use crate::storage::engine::StorageEngine;
use crate::types::ColumnDef;

/// Space services a tree needs from its owning table: page allocation and
/// eager free-space accounting. The database implements this per table.
pub trait TreeSpace {
    fn engine(&self) -> &StorageEngine;
    fn columns(&self) -> &[ColumnDef];
    /// Fresh formatted index page, registered in the free-space map.
    fn allocate_index_page(&mut self) -> Result<u32>;
    /// An existing index page with at least `bytes` free, if any.
    fn find_index_page_with_room(&mut self, bytes: usize) -> Result<Option<u32>>;
    /// Fresh formatted data page for a clustered leaf.
    fn allocate_data_page(&mut self) -> Result<u32>;
    /// Eager free-space map update after an occupancy change.
    fn occupancy_changed(&mut self, page_id: u32, bytes_left: usize, kind: PfsKind) -> Result<()>;
    /// Another index's root moved during a page split; its catalog entry
    /// must follow.
    fn root_page_moved(&mut self, index_id: u32, new_page_id: u32) -> Result<()>;
}

/// What an insert places at the leaf.
#[derive(Debug, Clone)]
pub enum TreeInsert {
    /// Clustered index: the row itself, stored in the leaf's data page.
    Row(Row),
    /// Non-clustered index: a locator for a row stored elsewhere.
    Locator(RowLocator),
}

enum LeafOutcome {
    Done(RowLocator),
    NeedsSpace,
}

/// Relocation map produced by page-level splits; local header variables
/// must be resolved through it after any mutating call.
#[derive(Debug, Default)]
struct Relocations {
    moves: HashMap<NodeHeader, NodeHeader>,
}

impl Relocations {
    fn record(&mut self, old: NodeHeader, new: NodeHeader) {
        self.moves.insert(old, new);
    }

    fn resolve(&self, mut header: NodeHeader) -> NodeHeader {
        // A node moves at most once per split; chains stay short.
        for _ in 0..MAX_TREE_DEPTH * 4 {
            match self.moves.get(&header) {
                Some(&next) => header = next,
                None => return header,
            }
        }
        header
    }

    fn extend(&mut self, other: Relocations) {
        self.moves.extend(other.moves);
    }
}

/// Read-only tree access over an index's metadata.
pub struct TreeReader<'a> {
    engine: &'a StorageEngine,
    meta: &'a IndexMeta,
}

impl<'a> TreeReader<'a> {
    pub fn new(engine: &'a StorageEngine, meta: &'a IndexMeta) -> Self {
        Self { engine, meta }
    }

    pub fn is_empty(&self) -> bool {
        self.meta.root_page_id == 0
    }

    /// Resolves the root's current address by scanning its page for this
    /// index's parentless node.
    pub fn root_header(&self) -> Result<Option<NodeHeader>> {
        if self.meta.root_page_id == 0 {
            return Ok(None);
        }
        let guard = self.engine.index_page(self.meta.root_page_id)?;
        let page = guard.page().as_index()?;
        let slot = page.find_root_slot(self.meta.index_id).ok_or_else(|| {
            eyre::eyre!(
                "index {} has no root in page {}",
                self.meta.index_id,
                self.meta.root_page_id
            )
        })?;
        Ok(Some(NodeHeader::new(self.meta.root_page_id, slot)))
    }

    /// Clones a node out of the cache. Callers never hold the clone across
    /// a mutation without re-resolving its header.
    pub fn node(&self, header: NodeHeader) -> Result<Node> {
        let guard = self.engine.index_page(header.page_id)?;
        Ok(guard.page().as_index()?.node(header.slot)?.clone())
    }

    /// The current root node, if the tree is non-empty.
    pub fn root(&self) -> Result<Option<Node>> {
        match self.root_header()? {
            Some(header) => Ok(Some(self.node(header)?)),
            None => Ok(None),
        }
    }

    /// Descends to the leaf that would hold `key`.
    fn leaf_for(&self, key: &Key) -> Result<Option<NodeHeader>> {
        let Some(mut current) = self.root_header()? else {
            return Ok(None);
        };
        for _ in 0..=MAX_TREE_DEPTH {
            let node = self.node(current)?;
            if node.is_leaf() {
                return Ok(Some(current));
            }
            let idx = node.child_slot(key);
            current = node.child_headers()[idx];
        }
        bail!("tree deeper than {} levels; structure corrupt", MAX_TREE_DEPTH)
    }

    fn locator_at(&self, leaf: &Node, idx: usize) -> Result<RowLocator> {
        match &leaf.payload {
            NodePayload::ClusteredLeaf { data_page_id } => {
                Ok(RowLocator::new(*data_page_id, idx as u16))
            }
            NodePayload::SecondaryLeaf { locators } => Ok(locators[idx]),
            NodePayload::Internal { .. } => bail!("internal node has no row locators"),
        }
    }

    /// Point lookup: the locator stored for `key`, if present.
    pub fn search(&self, key: &Key) -> Result<Option<RowLocator>> {
        let Some(leaf_h) = self.leaf_for(key)? else {
            return Ok(None);
        };
        let leaf = self.node(leaf_h)?;
        let idx = leaf.lower_bound(key);
        if idx < leaf.keys.len() && leaf.keys[idx] == *key {
            Ok(Some(self.locator_at(&leaf, idx)?))
        } else {
            Ok(None)
        }
    }

    /// Ordered range query: walks the leaf chain from the lower bound and
    /// stops the moment a key exceeds `max`. No re-descent per key.
    pub fn range(&self, min: &Key, max: &Key) -> Result<Vec<(Key, RowLocator)>> {
        let mut results = Vec::new();
        if min > max {
            return Ok(results);
        }
        let Some(leaf_h) = self.leaf_for(min)? else {
            return Ok(results);
        };
        let mut leaf = self.node(leaf_h)?;
        let mut idx = leaf.lower_bound(min);
        loop {
            while idx < leaf.keys.len() {
                if leaf.keys[idx] > *max {
                    return Ok(results);
                }
                results.push((leaf.keys[idx].clone(), self.locator_at(&leaf, idx)?));
                idx += 1;
            }
            match leaf.next_leaf {
                Some(next) => {
                    leaf = self.node(next)?;
                    idx = 0;
                }
                None => return Ok(results),
            }
        }
    }

    /// The leftmost leaf of the tree, if any.
    pub fn first_leaf(&self) -> Result<Option<NodeHeader>> {
        let Some(mut current) = self.root_header()? else {
            return Ok(None);
        };
        for _ in 0..=MAX_TREE_DEPTH {
            let node = self.node(current)?;
            if node.is_leaf() {
                return Ok(Some(current));
            }
            current = node.child_headers()[0];
        }
        bail!("tree deeper than {} levels; structure corrupt", MAX_TREE_DEPTH)
    }

    /// All keys in leaf-chain order, from the leftmost leaf forward.
    pub fn leaf_keys(&self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let Some(first) = self.first_leaf()? else {
            return Ok(keys);
        };
        let mut leaf = self.node(first)?;
        loop {
            keys.extend(leaf.keys.iter().cloned());
            match leaf.next_leaf {
                Some(next) => leaf = self.node(next)?,
                None => return Ok(keys),
            }
        }
    }
}

pub struct BTree<'a, S: TreeSpace> {
    space: &'a mut S,
    meta: &'a mut IndexMeta,
    clustered: bool,
    degree: u16,
}

impl<'a, S: TreeSpace> BTree<'a, S> {
    /// Opens a tree over an index. The degree is derived once from page
    /// capacity divided by the per-entry size estimate (worst-case key size,
    /// or row size for clustered trees).
    pub fn new(
        space: &'a mut S,
        meta: &'a mut IndexMeta,
        clustered: bool,
        entry_size: usize,
    ) -> Self {
        let degree = derive_degree(entry_size);
        Self {
            space,
            meta,
            clustered,
            degree,
        }
    }

    /// Opens a tree with a forced degree. Small degrees make split behavior
    /// observable without thousands of keys.
    pub fn with_degree(
        space: &'a mut S,
        meta: &'a mut IndexMeta,
        clustered: bool,
        degree: u16,
    ) -> Result<Self> {
        ensure!(
            degree >= MIN_DEGREE,
            "degree {} below minimum {}",
            degree,
            MIN_DEGREE
        );
        Ok(Self {
            space,
            meta,
            clustered,
            degree,
        })
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    fn max_keys(&self) -> usize {
        2 * self.degree as usize - 1
    }

    pub fn reader(&self) -> TreeReader<'_> {
        TreeReader::new(self.space.engine(), self.meta)
    }

    fn node(&self, header: NodeHeader) -> Result<Node> {
        self.reader().node(header)
    }

    /// Inserts `key` with its payload, returning the row's locator.
    /// Duplicate keys are rejected as a logic error.
    pub fn insert(&mut self, key: Key, payload: TreeInsert) -> Result<RowLocator> {
        match (&payload, self.clustered) {
            (TreeInsert::Row(_), true) | (TreeInsert::Locator(_), false) => {}
            _ => bail!("insert payload does not match the index kind"),
        }

        if self.meta.root_page_id == 0 {
            self.create_root_leaf()?;
        }

        // A split either grows capacity on the search path or restructures
        // the root; a handful of retries always converges.
        for _ in 0..(MAX_TREE_DEPTH * 2) {
            let root_h = self
                .reader()
                .root_header()?
                .ok_or_else(|| eyre::eyre!("tree lost its root"))?;
            let root = self.node(root_h)?;
            if root.key_count() >= self.max_keys() {
                debug!(index_id = self.meta.index_id, "pre-emptive root split");
                self.split_root()?;
                continue;
            }

            let mut current = root_h;
            let mut descended = true;
            // Each level costs at most two iterations: one split, one step.
            for _ in 0..=MAX_TREE_DEPTH * 2 {
                let node = self.node(current)?;
                if node.is_leaf() {
                    match self.insert_into_leaf(current, &key, &payload)? {
                        LeafOutcome::Done(locator) => return Ok(locator),
                        LeafOutcome::NeedsSpace => {
                            self.split_leaf_for_space(current, &key)?;
                            descended = false;
                            break;
                        }
                    }
                }

                let idx = node.child_slot(&key);
                let child_h = node.child_headers()[idx];
                let child = self.node(child_h)?;
                if child.key_count() >= self.max_keys() {
                    let relocs = self.split_child(current, idx)?;
                    current = relocs.resolve(current);
                    continue;
                }
                current = child_h;
            }
            if descended {
                // Only reachable if the depth bound was exhausted mid-walk.
                bail!(
                    "tree deeper than {} levels; structure corrupt",
                    MAX_TREE_DEPTH
                );
            }
        }
        bail!("insert did not converge after repeated splits")
    }

    /// Creates the first leaf and roots the tree at it.
    fn create_root_leaf(&mut self) -> Result<()> {
        let node = if self.clustered {
            let data_page_id = self.space.allocate_data_page()?;
            Node::clustered_leaf(self.meta.index_id, data_page_id)
        } else {
            Node::secondary_leaf(self.meta.index_id)
        };
        let header = self.place_new_node(node)?;
        self.meta.root_page_id = header.page_id;
        debug!(
            index_id = self.meta.index_id,
            page_id = header.page_id,
            "tree rooted"
        );
        Ok(())
    }

    fn insert_into_leaf(
        &mut self,
        leaf_h: NodeHeader,
        key: &Key,
        payload: &TreeInsert,
    ) -> Result<LeafOutcome> {
        let mut leaf = self.node(leaf_h)?;
        let slot = leaf.lower_bound(key);
        // The true binary-search slot is checked, not just neighbours, so
        // duplicates cannot hide behind an earlier page-level split.
        if slot < leaf.keys.len() && leaf.keys[slot] == *key {
            bail!("duplicate key in index {}", self.meta.index_id);
        }

        match payload {
            TreeInsert::Row(row) => {
                let data_page_id = leaf.data_page_id()?;
                let fits = {
                    let guard = self
                        .space
                        .engine()
                        .data_page(data_page_id, Some(self.space.columns()))?;
                    row.total_size() <= guard.page().as_data()?.bytes_left()
                };
                if !fits {
                    return Ok(LeafOutcome::NeedsSpace);
                }
                let bytes_left = {
                    let mut guard = self
                        .space
                        .engine()
                        .data_page(data_page_id, Some(self.space.columns()))?;
                    let page = guard.page_mut().as_data_mut()?;
                    page.insert_row_at(slot, row.clone())?;
                    page.bytes_left()
                };
                self.space
                    .occupancy_changed(data_page_id, bytes_left, PfsKind::Data)?;

                leaf.keys.insert(slot, key.clone());
                self.store_node(&mut leaf)?;
                Ok(LeafOutcome::Done(RowLocator::new(data_page_id, slot as u16)))
            }
            TreeInsert::Locator(locator) => {
                leaf.keys.insert(slot, key.clone());
                match &mut leaf.payload {
                    NodePayload::SecondaryLeaf { locators } => locators.insert(slot, *locator),
                    _ => bail!("locator insert into a non-secondary leaf"),
                }
                self.store_node(&mut leaf)?;
                Ok(LeafOutcome::Done(*locator))
            }
        }
    }

    /// Splits a leaf whose data page ran out of bytes before its key count
    /// reached the degree bound. A leaf down to a single key has no median
    /// to cut at; rows that wide spread one per leaf instead.
    fn split_leaf_for_space(&mut self, leaf_h: NodeHeader, key: &Key) -> Result<()> {
        let leaf = self.node(leaf_h)?;
        ensure!(
            leaf.key_count() >= 1,
            "row does not fit in an empty data page"
        );
        let single = leaf.key_count() == 1;
        let (parent_h, idx) = match leaf.parent {
            Some(parent_h) => {
                let parent = self.node(parent_h)?;
                let idx = parent
                    .child_headers()
                    .iter()
                    .position(|&h| h == leaf_h)
                    .ok_or_else(|| {
                        eyre::eyre!("leaf {:?} missing from its parent's child list", leaf_h)
                    })?;
                (parent_h, idx)
            }
            None => (self.grow_root()?, 0),
        };
        if single {
            self.split_single_row_leaf(parent_h, idx, key)
        } else {
            self.split_child(parent_h, idx).map(|_| ())
        }
    }

    /// Grows the tree upward: a fresh internal root adopts the old root as
    /// its only child. Returns the new root's header.
    fn grow_root(&mut self) -> Result<NodeHeader> {
        let root_h = self
            .reader()
            .root_header()?
            .ok_or_else(|| eyre::eyre!("cannot split an empty tree"))?;
        let mut new_root = Node::internal(self.meta.index_id);
        new_root.payload = NodePayload::Internal {
            children: vec![root_h],
        };
        let new_root_h = self.place_new_node(new_root)?;

        let mut old_root = self.node(root_h)?;
        old_root.parent = Some(new_root_h);
        let relocs = self.store_node(&mut old_root)?;
        let new_root_h = relocs.resolve(new_root_h);

        self.meta.root_page_id = new_root_h.page_id;
        Ok(new_root_h)
    }

    /// Grows the tree upward and splits the old root as the new root's
    /// only child.
    fn split_root(&mut self) -> Result<()> {
        let new_root_h = self.grow_root()?;
        self.split_child(new_root_h, 0)?;
        Ok(())
    }

    /// Degenerate split for a clustered leaf that filled its data page with
    /// a single row. There is no median to cut at, so the incoming key gets
    /// a leaf of its own: rows wider than half a page live one per leaf.
    fn split_single_row_leaf(
        &mut self,
        parent_h: NodeHeader,
        child_idx: usize,
        key: &Key,
    ) -> Result<()> {
        let mut parent = self.node(parent_h)?;
        let child_h = *parent
            .child_headers()
            .get(child_idx)
            .ok_or_else(|| eyre::eyre!("parent {:?} has no child {}", parent_h, child_idx))?;
        let mut child = self.node(child_h)?;
        let resident = child.keys[0].clone();
        let new_page = self.space.allocate_data_page()?;

        // A key above the resident goes to an empty right sibling, with the
        // incoming key itself as separator. A key below keeps leaf order by
        // pushing the resident's row into the sibling and reusing the
        // emptied page for the newcomer.
        let (promote, sibling_keys) = if *key > resident {
            (key.clone(), Vec::new())
        } else {
            let source_page = child.data_page_id()?;
            let rows = {
                let mut guard = self
                    .space
                    .engine()
                    .data_page(source_page, Some(self.space.columns()))?;
                let page = guard.page_mut().as_data_mut()?;
                let rows = page.split_off(0);
                let left = page.bytes_left();
                drop(guard);
                self.space
                    .occupancy_changed(source_page, left, PfsKind::Data)?;
                rows
            };
            let left = {
                let mut guard = self
                    .space
                    .engine()
                    .data_page(new_page, Some(self.space.columns()))?;
                let page = guard.page_mut().as_data_mut()?;
                for row in rows {
                    page.insert_row(row)?;
                }
                page.bytes_left()
            };
            self.space
                .occupancy_changed(new_page, left, PfsKind::Data)?;
            child.keys.clear();
            (resident.clone(), vec![resident])
        };

        let old_next = child.next_leaf;
        let sibling = Node {
            index_id: self.meta.index_id,
            header: child_h, // placeholder; assigned at placement
            parent: Some(parent_h),
            prev_leaf: Some(child_h),
            next_leaf: old_next,
            keys: sibling_keys,
            payload: NodePayload::ClusteredLeaf {
                data_page_id: new_page,
            },
        };
        let sibling_h = self.place_new_node(sibling)?;
        trace!(
            index_id = self.meta.index_id,
            ?child_h,
            ?sibling_h,
            "single-row leaf split"
        );

        child.next_leaf = Some(sibling_h);
        if let Some(next_h) = old_next {
            let mut next = self.node(next_h)?;
            next.prev_leaf = Some(sibling_h);
            self.patch_store(next)?;
        }
        self.store_node(&mut child)?; // same size or smaller; never splits the page

        parent.keys.insert(child_idx, promote);
        parent.children_mut()?.insert(child_idx + 1, sibling_h);
        self.store_node(&mut parent)?;
        Ok(())
    }

    /// Splits `parent`'s `child_idx`-th child, promoting its median key.
    fn split_child(&mut self, parent_h: NodeHeader, child_idx: usize) -> Result<Relocations> {
        let mut parent = self.node(parent_h)?;
        let child_h = *parent
            .child_headers()
            .get(child_idx)
            .ok_or_else(|| eyre::eyre!("parent {:?} has no child {}", parent_h, child_idx))?;
        let mut child = self.node(child_h)?;
        ensure!(
            child.key_count() >= 2,
            "cannot split node {:?} with {} keys",
            child_h,
            child.key_count()
        );

        let mid = child.keys.len() / 2;
        let (promote, sibling_keys) = if child.is_leaf() {
            // Copy-up: the median stays with the right sibling so separators
            // always equal the first key of their right subtree.
            let upper = child.keys.split_off(mid);
            (upper[0].clone(), upper)
        } else {
            let mut upper = child.keys.split_off(mid);
            let median = upper.remove(0);
            (median, upper)
        };

        let sibling_payload = match &mut child.payload {
            NodePayload::Internal { children } => NodePayload::Internal {
                children: children.split_off(mid + 1),
            },
            NodePayload::ClusteredLeaf { data_page_id } => {
                let source_page = *data_page_id;
                let new_page = self.space.allocate_data_page()?;
                let rows = {
                    let mut guard = self
                        .space
                        .engine()
                        .data_page(source_page, Some(self.space.columns()))?;
                    let page = guard.page_mut().as_data_mut()?;
                    let rows = page.split_off(mid);
                    let left = page.bytes_left();
                    drop(guard);
                    self.space
                        .occupancy_changed(source_page, left, PfsKind::Data)?;
                    rows
                };
                let left = {
                    let mut guard = self
                        .space
                        .engine()
                        .data_page(new_page, Some(self.space.columns()))?;
                    let page = guard.page_mut().as_data_mut()?;
                    for row in rows {
                        page.insert_row(row)?;
                    }
                    page.bytes_left()
                };
                self.space
                    .occupancy_changed(new_page, left, PfsKind::Data)?;
                NodePayload::ClusteredLeaf {
                    data_page_id: new_page,
                }
            }
            NodePayload::SecondaryLeaf { locators } => NodePayload::SecondaryLeaf {
                locators: locators.split_off(mid),
            },
        };

        let mut sibling = Node {
            index_id: self.meta.index_id,
            header: child_h, // placeholder; assigned at placement
            parent: Some(parent_h),
            prev_leaf: None,
            next_leaf: None,
            keys: sibling_keys,
            payload: sibling_payload,
        };
        if child.is_leaf() {
            sibling.prev_leaf = Some(child_h);
            sibling.next_leaf = child.next_leaf;
        }

        let sibling_h = self.place_new_node(sibling.clone())?;
        sibling.header = sibling_h;
        trace!(
            index_id = self.meta.index_id,
            ?child_h,
            ?sibling_h,
            "node split"
        );

        // Re-link the leaf chain and reparent moved children; these patches
        // replace fixed-width headers only and cannot overflow a page.
        if child.is_leaf() {
            let old_next = child.next_leaf;
            child.next_leaf = Some(sibling_h);
            if let Some(next_h) = old_next {
                let mut next = self.node(next_h)?;
                next.prev_leaf = Some(sibling_h);
                self.patch_store(next)?;
            }
        } else {
            for &grandchild_h in sibling.child_headers() {
                let mut grandchild = self.node(grandchild_h)?;
                grandchild.parent = Some(sibling_h);
                self.patch_store(grandchild)?;
            }
        }
        self.store_node(&mut child)?; // shrank; never splits the page

        // The parent grows last: this is the one store that can overflow
        // its page and relocate nodes.
        parent.keys.insert(child_idx, promote);
        parent.children_mut()?.insert(child_idx + 1, sibling_h);
        let relocs = self.store_node(&mut parent)?;
        Ok(relocs)
    }

    /// Persists a new node into an index page with room, or a fresh page.
    /// Appending never relocates existing nodes.
    fn place_new_node(&mut self, node: Node) -> Result<NodeHeader> {
        let needed = node.serialized_size() + 2;
        let page_id = match self.space.find_index_page_with_room(needed)? {
            Some(page_id) => page_id,
            None => self.space.allocate_index_page()?,
        };
        let (header, bytes_left) = {
            let mut guard = self.space.engine().index_page(page_id)?;
            let page = guard.page_mut().as_index_mut()?;
            let header = page.insert_node(node)?;
            (header, page.bytes_left())
        };
        self.space
            .occupancy_changed(page_id, bytes_left, PfsKind::Index)?;
        Ok(header)
    }

    /// Writes a node back to its slot, splitting the page when the node no
    /// longer fits. The node's header is re-resolved across splits.
    fn store_node(&mut self, node: &mut Node) -> Result<Relocations> {
        let mut relocs = Relocations::default();
        loop {
            let header = node.header;
            let stored = {
                let mut guard = self.space.engine().index_page(header.page_id)?;
                let page = guard.page_mut().as_index_mut()?;
                if page.has_room_to_replace(header.slot, node)? {
                    page.replace_node(header.slot, node.clone())?;
                    Some(page.bytes_left())
                } else {
                    None
                }
            };
            if let Some(bytes_left) = stored {
                self.space
                    .occupancy_changed(header.page_id, bytes_left, PfsKind::Index)?;
                return Ok(relocs);
            }
            let split = self.split_index_page(header.page_id)?;
            node.header = split.resolve(node.header);
            relocs.extend(split);
        }
    }

    /// Size-neutral write of a node whose only change is header values.
    fn patch_store(&mut self, node: Node) -> Result<()> {
        let header = node.header;
        let mut guard = self.space.engine().index_page(header.page_id)?;
        guard
            .page_mut()
            .as_index_mut()?
            .replace_node(header.slot, node)?;
        Ok(())
    }

    /// Page-level split: cut the page's node list at its midpoint, move the
    /// tail half to a fresh index page, and rewrite every affected header.
    fn split_index_page(&mut self, page_id: u32) -> Result<Relocations> {
        let (moved, bytes_left) = {
            let mut guard = self.space.engine().index_page(page_id)?;
            let page = guard.page_mut().as_index_mut()?;
            ensure!(
                page.node_count() >= 2,
                "index page {} holds one oversized node and cannot split",
                page_id
            );
            let mid = page.node_count() / 2;
            let moved = page.split_off_nodes(mid);
            (moved, page.bytes_left())
        };
        self.space
            .occupancy_changed(page_id, bytes_left, PfsKind::Index)?;

        let new_page_id = self.space.allocate_index_page()?;
        debug!(page_id, new_page_id, moved = moved.len(), "index page split");

        // Destinations are knowable up front: the fresh page assigns slots
        // in insertion order.
        let mut relocs = Relocations::default();
        for (i, node) in moved.iter().enumerate() {
            relocs.record(node.header, NodeHeader::new(new_page_id, i as u16));
        }

        // Rewrite references among the moved nodes before placing them, then
        // patch every outside referencer.
        let mut placed: Vec<(NodeHeader, Node)> = Vec::with_capacity(moved.len());
        let bytes_left = {
            let mut guard = self.space.engine().index_page(new_page_id)?;
            let page = guard.page_mut().as_index_mut()?;
            for mut node in moved {
                let old_header = node.header;
                node.parent = node.parent.map(|h| relocs.resolve(h));
                node.prev_leaf = node.prev_leaf.map(|h| relocs.resolve(h));
                node.next_leaf = node.next_leaf.map(|h| relocs.resolve(h));
                if let NodePayload::Internal { children } = &mut node.payload {
                    for child in children.iter_mut() {
                        *child = relocs.resolve(*child);
                    }
                }
                let new_header = page.insert_node(node.clone())?;
                debug_assert_eq!(new_header, relocs.resolve(old_header));
                node.header = new_header;
                placed.push((old_header, node));
            }
            page.bytes_left()
        };
        self.space
            .occupancy_changed(new_page_id, bytes_left, PfsKind::Index)?;

        for (old_header, node) in &placed {
            let new_header = node.header;
            if let Some(parent_h) = node.parent {
                if parent_h.page_id != new_page_id {
                    let mut parent = self.node(parent_h)?;
                    for child in parent.children_mut()? {
                        if *child == *old_header {
                            *child = new_header;
                        }
                    }
                    self.patch_store(parent)?;
                }
            }
            for &child_h in node.child_headers() {
                if child_h.page_id != new_page_id {
                    let mut grandchild = self.node(child_h)?;
                    grandchild.parent = Some(new_header);
                    self.patch_store(grandchild)?;
                }
            }
            if let Some(prev_h) = node.prev_leaf {
                if prev_h.page_id != new_page_id {
                    let mut prev = self.node(prev_h)?;
                    prev.next_leaf = Some(new_header);
                    self.patch_store(prev)?;
                }
            }
            if let Some(next_h) = node.next_leaf {
                if next_h.page_id != new_page_id {
                    let mut next = self.node(next_h)?;
                    next.prev_leaf = Some(new_header);
                    self.patch_store(next)?;
                }
            }
            if node.parent.is_none() {
                if node.index_id == self.meta.index_id {
                    self.meta.root_page_id = new_page_id;
                } else {
                    self.space.root_page_moved(node.index_id, new_page_id)?;
                }
            }
        }

        Ok(relocs)
    }
}

fn derive_degree(entry_size: usize) -> u16 {
    let fit = PAGE_USABLE_SIZE / entry_size.max(1);
    let t = fit.div_ceil(2);
    t.clamp(MIN_DEGREE as usize, MAX_DEGREE as usize) as u16
}

/// Verifies that every header pair in the tree resolves mutually: parents
/// and children, and adjacent leaves, must point back at each other.
pub fn check_link_invariants(reader: &TreeReader<'_>) -> Result<()> {
    let Some(root) = reader.root()? else {
        return Ok(());
    };
    let mut stack: SmallVec<[NodeHeader; 16]> = SmallVec::new();
    stack.push(root.header);
    while let Some(header) = stack.pop() {
        let node = reader.node(header)?;
        ensure!(
            node.header == header,
            "node at {:?} carries self-header {:?}",
            header,
            node.header
        );
        for &child_h in node.child_headers() {
            let child = reader.node(child_h)?;
            ensure!(
                child.parent == Some(header),
                "child {:?} points at parent {:?}, expected {:?}",
                child_h,
                child.parent,
                header
            );
            stack.push(child_h);
        }
        if node.is_leaf() {
            if let Some(next_h) = node.next_leaf {
                let next = reader.node(next_h)?;
                ensure!(
                    next.prev_leaf == Some(header),
                    "leaf {:?} has prev {:?}, expected {:?}",
                    next_h,
                    next.prev_leaf,
                    header
                );
            }
            if let Some(prev_h) = node.prev_leaf {
                let prev = reader.node(prev_h)?;
                ensure!(
                    prev.next_leaf == Some(header),
                    "leaf {:?} has next {:?}, expected {:?}",
                    prev_h,
                    prev.next_leaf,
                    header
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degree_shrinks_with_entry_size() {
        assert_eq!(derive_degree(PAGE_USABLE_SIZE), MIN_DEGREE);
        assert_eq!(derive_degree(1), MAX_DEGREE);
        assert!(derive_degree(64) > derive_degree(512));
    }

    #[test]
    fn relocations_resolve_chains() {
        let mut relocs = Relocations::default();
        let a = NodeHeader::new(1, 0);
        let b = NodeHeader::new(2, 3);
        let c = NodeHeader::new(4, 1);
        relocs.record(a, b);

        assert_eq!(relocs.resolve(a), b);
        assert_eq!(relocs.resolve(c), c);

        let mut later = Relocations::default();
        later.record(b, c);
        relocs.extend(later);
        assert_eq!(relocs.resolve(a), c);
    }
}
