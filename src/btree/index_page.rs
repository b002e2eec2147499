//! # Index Pages
//!
//! An index page stores serialized B+Tree nodes back to back, each behind a
//! 2-byte length prefix. A node's slot is its position in the sequence;
//! together with the page id it forms the node's logical address.
//!
//! Slots are stable under in-place replacement and appends. The only
//! operation that moves nodes is the page-level split: when a node update
//! no longer fits, the page's node list is cut at its midpoint and the tail
//! half relocated to another index page. Every moved node's self-header,
//! and every header referencing it, is rewritten by the tree layer.

use eyre::{ensure, Result};

use crate::btree::node::{Node, NodeHeader};
use crate::config::{PAGE_HEADER_SIZE, PAGE_USABLE_SIZE};
use crate::storage::page::{PageHeader, PageKind};

const NODE_LENGTH_PREFIX: usize = 2;

#[derive(Debug, Clone)]
pub struct IndexPage {
    header: PageHeader,
    nodes: Vec<Node>,
}

impl IndexPage {
    pub fn new(page_id: u32) -> Self {
        Self {
            header: PageHeader::new(page_id, PageKind::Index),
            nodes: Vec::new(),
        }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> u32 {
        self.header.page_id()
    }

    pub fn bytes_left(&self) -> usize {
        self.header.bytes_left() as usize
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, slot: u16) -> Result<&Node> {
        self.nodes.get(slot as usize).ok_or_else(|| {
            eyre::eyre!(
                "index page {} has {} nodes, no slot {}",
                self.page_id(),
                self.nodes.len(),
                slot
            )
        })
    }

    /// Slot of this index's root node, if the root lives in this page.
    pub fn find_root_slot(&self, index_id: u32) -> Option<u16> {
        self.nodes
            .iter()
            .position(|n| n.index_id == index_id && n.is_root())
            .map(|slot| slot as u16)
    }

    pub fn has_room_for(&self, node: &Node) -> bool {
        NODE_LENGTH_PREFIX + node.serialized_size() <= self.bytes_left()
    }

    pub fn has_room_to_replace(&self, slot: u16, node: &Node) -> Result<bool> {
        let old = self.node(slot)?;
        Ok(node.serialized_size() <= old.serialized_size() + self.bytes_left())
    }

    /// Appends a node, assigning its self-header to this page and the new
    /// slot. Returns the header.
    pub fn insert_node(&mut self, mut node: Node) -> Result<NodeHeader> {
        ensure!(
            self.has_room_for(&node),
            "node of {} bytes does not fit in index page {} ({} bytes left)",
            node.serialized_size(),
            self.page_id(),
            self.bytes_left()
        );
        let header = NodeHeader::new(self.page_id(), self.nodes.len() as u16);
        node.header = header;
        let size = NODE_LENGTH_PREFIX + node.serialized_size();
        self.nodes.push(node);
        self.header.set_item_count(self.nodes.len() as u16);
        self.header
            .set_bytes_left((self.bytes_left() - size) as u16);
        Ok(header)
    }

    /// Replaces the node at `slot` in place. The caller has already checked
    /// `has_room_to_replace`; a node that shrank always fits.
    pub fn replace_node(&mut self, slot: u16, node: Node) -> Result<()> {
        ensure!(
            self.has_room_to_replace(slot, &node)?,
            "node of {} bytes does not fit in slot {} of index page {}",
            node.serialized_size(),
            slot,
            self.page_id()
        );
        ensure!(
            node.header == NodeHeader::new(self.page_id(), slot),
            "node addressed {:?} stored into page {} slot {}",
            node.header,
            self.page_id(),
            slot
        );
        let old_size = self.nodes[slot as usize].serialized_size();
        let new_size = node.serialized_size();
        self.nodes[slot as usize] = node;
        self.header
            .set_bytes_left((self.bytes_left() + old_size - new_size) as u16);
        Ok(())
    }

    /// Removes and returns the nodes from `at` onward for a page-level
    /// split. Remaining slots keep their positions.
    pub fn split_off_nodes(&mut self, at: usize) -> Vec<Node> {
        let tail = self.nodes.split_off(at);
        let freed: usize = tail
            .iter()
            .map(|n| NODE_LENGTH_PREFIX + n.serialized_size())
            .sum();
        self.header.set_item_count(self.nodes.len() as u16);
        self.header
            .set_bytes_left((self.bytes_left() + freed) as u16);
        tail
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        for node in &self.nodes {
            let size = node.serialized_size();
            ensure!(
                offset + NODE_LENGTH_PREFIX + size <= buf.len(),
                "node of {} bytes does not fit at offset {}",
                size,
                offset
            );
            buf[offset..offset + 2].copy_from_slice(&(size as u16).to_le_bytes());
            offset += 2;
            let node_start = offset;
            node.serialize_to(buf, &mut offset)?;
            ensure!(
                offset - node_start == size,
                "node serialized to {} bytes but sized itself at {}",
                offset - node_start,
                size
            );
        }
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::Index,
            "page {} is {:?}, expected Index",
            header.page_id(),
            header.kind()
        );

        let mut offset = PAGE_HEADER_SIZE;
        let mut nodes = Vec::with_capacity(header.item_count() as usize);
        for slot in 0..header.item_count() {
            ensure!(
                offset + 2 <= buf.len(),
                "node length prefix truncated at offset {}",
                offset
            );
            let size =
                u16::from_le_bytes(buf[offset..offset + 2].try_into().expect("length checked"))
                    as usize;
            offset += 2;
            let node_start = offset;
            let node = Node::deserialize_from(buf, &mut offset)?;
            ensure!(
                offset - node_start == size,
                "node at slot {} decoded to {} bytes but prefix claims {}",
                slot,
                offset - node_start,
                size
            );
            ensure!(
                node.header == NodeHeader::new(header.page_id(), slot),
                "node at page {} slot {} carries address {:?}",
                header.page_id(),
                slot,
                node.header
            );
            nodes.push(node);
        }

        let used: usize = nodes
            .iter()
            .map(|n| NODE_LENGTH_PREFIX + n.serialized_size())
            .sum();
        ensure!(
            header.bytes_left() as usize == PAGE_USABLE_SIZE - used,
            "index page {} header claims {} bytes left but nodes occupy {}",
            header.page_id(),
            header.bytes_left(),
            used
        );

        Ok(Self { header, nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::Key;
    use crate::config::PAGE_SIZE;
    use crate::row::RowLocator;

    fn leaf(index_id: u32, keys: &[i64]) -> Node {
        let mut node = Node::secondary_leaf(index_id);
        node.keys = keys.iter().copied().map(Key::from_int).collect();
        node.payload = crate::btree::node::NodePayload::SecondaryLeaf {
            locators: keys
                .iter()
                .enumerate()
                .map(|(i, _)| RowLocator::new(3, i as u16))
                .collect(),
        };
        node
    }

    #[test]
    fn insert_assigns_headers_in_slot_order() {
        let mut page = IndexPage::new(9);

        let first = page.insert_node(leaf(1, &[1])).unwrap();
        let second = page.insert_node(leaf(1, &[2])).unwrap();

        assert_eq!(first, NodeHeader::new(9, 0));
        assert_eq!(second, NodeHeader::new(9, 1));
        assert_eq!(page.node_count(), 2);
        assert_eq!(page.node(0).unwrap().header, first);
    }

    #[test]
    fn replace_adjusts_accounting() {
        let mut page = IndexPage::new(9);
        let header = page.insert_node(leaf(1, &[1])).unwrap();
        let before = page.bytes_left();

        let mut bigger = leaf(1, &[1, 2, 3]);
        bigger.header = header;
        let grown = bigger.serialized_size();
        let original = page.node(0).unwrap().serialized_size();
        page.replace_node(0, bigger).unwrap();

        assert_eq!(page.bytes_left(), before + original - grown);
    }

    #[test]
    fn replace_with_wrong_address_is_rejected() {
        let mut page = IndexPage::new(9);
        page.insert_node(leaf(1, &[1])).unwrap();

        let mut stray = leaf(1, &[5]);
        stray.header = NodeHeader::new(8, 0);

        assert!(page.replace_node(0, stray).is_err());
    }

    #[test]
    fn split_off_restores_capacity() {
        let mut page = IndexPage::new(9);
        for i in 0..4 {
            page.insert_node(leaf(1, &[i])).unwrap();
        }
        let before = page.bytes_left();

        let moved = page.split_off_nodes(2);

        assert_eq!(moved.len(), 2);
        assert_eq!(page.node_count(), 2);
        let freed: usize = moved
            .iter()
            .map(|n| NODE_LENGTH_PREFIX + n.serialized_size())
            .sum();
        assert_eq!(page.bytes_left(), before + freed);
        assert_eq!(moved[0].header, NodeHeader::new(9, 2));
    }

    #[test]
    fn find_root_slot_matches_index() {
        let mut page = IndexPage::new(9);
        let mut child = leaf(1, &[1]);
        child.parent = Some(NodeHeader::new(9, 1));
        page.insert_node(child).unwrap();
        page.insert_node(leaf(1, &[2])).unwrap();
        page.insert_node(leaf(2, &[3])).unwrap();

        assert_eq!(page.find_root_slot(1), Some(1));
        assert_eq!(page.find_root_slot(2), Some(2));
        assert_eq!(page.find_root_slot(3), None);
    }

    #[test]
    fn serialize_round_trip() {
        let mut page = IndexPage::new(9);
        page.insert_node(leaf(1, &[1, 2])).unwrap();
        let mut internal = Node::internal(1);
        internal.keys = vec![Key::from_int(10)];
        internal.payload = crate::btree::node::NodePayload::Internal {
            children: vec![NodeHeader::new(9, 0), NodeHeader::new(11, 0)],
        };
        page.insert_node(internal).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize_into(&mut buf).unwrap();
        let parsed = IndexPage::deserialize(&buf).unwrap();

        assert_eq!(parsed.header(), page.header());
        assert_eq!(parsed.nodes(), page.nodes());
    }
}
