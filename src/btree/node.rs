//! # B+Tree Nodes
//!
//! Tree nodes are not pointer-linked structures: every reference between
//! nodes is a [`NodeHeader`], a `(page_id, slot)` logical address resolved
//! through the page cache on each use. A header goes stale the instant the
//! node it names moves, so any split that relocates a node must patch the
//! parent's child entry, both leaf neighbors, and every child's parent
//! header.
//!
//! ## Node Layout (inside an index page)
//!
//! ```text
//! payload tag (1) | index_id (4)
//! self header (6) | parent (6) | prev leaf (6) | next leaf (6)
//! key_count (2) | keys...
//! payload:
//!   internal        child_count (2) + 6 bytes per child
//!   clustered leaf  data_page_id (4)
//!   secondary leaf  6 bytes per key (row locators)
//! ```
//!
//! Absent headers serialize with a page id of `u32::MAX`. A clustered leaf
//! owns one whole data page; row order in that page is key order. A
//! secondary leaf stores one row locator per key and never moves rows.

use eyre::{bail, ensure, Result};

use crate::btree::key::Key;
use crate::row::RowLocator;

const HEADER_NONE_PAGE: u32 = u32::MAX;
const TAG_INTERNAL: u8 = 0x01;
const TAG_CLUSTERED_LEAF: u8 = 0x02;
const TAG_SECONDARY_LEAF: u8 = 0x03;

/// Logical address of a node: index page id plus slot within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHeader {
    pub page_id: u32,
    pub slot: u16,
}

impl NodeHeader {
    pub fn new(page_id: u32, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

fn serialize_header(header: Option<NodeHeader>, buf: &mut [u8], offset: &mut usize) -> Result<()> {
    let (page_id, slot) = match header {
        Some(h) => (h.page_id, h.slot),
        None => (HEADER_NONE_PAGE, 0),
    };
    ensure!(
        *offset + 6 <= buf.len(),
        "node header does not fit at offset {}",
        *offset
    );
    buf[*offset..*offset + 4].copy_from_slice(&page_id.to_le_bytes());
    buf[*offset + 4..*offset + 6].copy_from_slice(&slot.to_le_bytes());
    *offset += 6;
    Ok(())
}

fn deserialize_header(buf: &[u8], offset: &mut usize) -> Result<Option<NodeHeader>> {
    ensure!(
        *offset + 6 <= buf.len(),
        "node header truncated at offset {}",
        *offset
    );
    let page_id = u32::from_le_bytes(buf[*offset..*offset + 4].try_into().expect("length checked"));
    let slot = u16::from_le_bytes(buf[*offset + 4..*offset + 6].try_into().expect("length checked"));
    *offset += 6;
    Ok(if page_id == HEADER_NONE_PAGE {
        None
    } else {
        Some(NodeHeader::new(page_id, slot))
    })
}

/// Leaf payloads differ by index kind; internal nodes hold children.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    Internal { children: Vec<NodeHeader> },
    ClusteredLeaf { data_page_id: u32 },
    SecondaryLeaf { locators: Vec<RowLocator> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub index_id: u32,
    pub header: NodeHeader,
    pub parent: Option<NodeHeader>,
    pub prev_leaf: Option<NodeHeader>,
    pub next_leaf: Option<NodeHeader>,
    pub keys: Vec<Key>,
    pub payload: NodePayload,
}

impl Node {
    pub fn internal(index_id: u32) -> Self {
        Self {
            index_id,
            header: NodeHeader::new(HEADER_NONE_PAGE, 0),
            parent: None,
            prev_leaf: None,
            next_leaf: None,
            keys: Vec::new(),
            payload: NodePayload::Internal {
                children: Vec::new(),
            },
        }
    }

    pub fn clustered_leaf(index_id: u32, data_page_id: u32) -> Self {
        Self {
            index_id,
            header: NodeHeader::new(HEADER_NONE_PAGE, 0),
            parent: None,
            prev_leaf: None,
            next_leaf: None,
            keys: Vec::new(),
            payload: NodePayload::ClusteredLeaf { data_page_id },
        }
    }

    pub fn secondary_leaf(index_id: u32) -> Self {
        Self {
            index_id,
            header: NodeHeader::new(HEADER_NONE_PAGE, 0),
            parent: None,
            prev_leaf: None,
            next_leaf: None,
            keys: Vec::new(),
            payload: NodePayload::SecondaryLeaf {
                locators: Vec::new(),
            },
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self.payload, NodePayload::Internal { .. })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Child headers of an internal node; empty for leaves.
    pub fn child_headers(&self) -> &[NodeHeader] {
        match &self.payload {
            NodePayload::Internal { children } => children,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> Result<&mut Vec<NodeHeader>> {
        match &mut self.payload {
            NodePayload::Internal { children } => Ok(children),
            _ => bail!("leaf node has no children"),
        }
    }

    pub fn locators(&self) -> Result<&[RowLocator]> {
        match &self.payload {
            NodePayload::SecondaryLeaf { locators } => Ok(locators),
            _ => bail!("node is not a secondary leaf"),
        }
    }

    pub fn data_page_id(&self) -> Result<u32> {
        match &self.payload {
            NodePayload::ClusteredLeaf { data_page_id } => Ok(*data_page_id),
            _ => bail!("node is not a clustered leaf"),
        }
    }

    /// First index whose key is `>= key` (the leaf insertion slot).
    pub fn lower_bound(&self, key: &Key) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// Child to descend into: the number of separators `<= key`. A key equal
    /// to a separator lives in the right subtree because leaf splits copy
    /// the median up while keeping it in the right sibling.
    pub fn child_slot(&self, key: &Key) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 1 + 4 + 6 * 4 + 2;
        size += self.keys.iter().map(Key::serialized_size).sum::<usize>();
        size += match &self.payload {
            NodePayload::Internal { children } => 2 + 6 * children.len(),
            NodePayload::ClusteredLeaf { .. } => 4,
            NodePayload::SecondaryLeaf { locators } => 6 * locators.len(),
        };
        size
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: &mut usize) -> Result<()> {
        let tag = match &self.payload {
            NodePayload::Internal { .. } => TAG_INTERNAL,
            NodePayload::ClusteredLeaf { .. } => TAG_CLUSTERED_LEAF,
            NodePayload::SecondaryLeaf { .. } => TAG_SECONDARY_LEAF,
        };
        ensure!(
            *offset + 5 <= buf.len(),
            "node prefix does not fit at offset {}",
            *offset
        );
        buf[*offset] = tag;
        buf[*offset + 1..*offset + 5].copy_from_slice(&self.index_id.to_le_bytes());
        *offset += 5;

        serialize_header(Some(self.header), buf, offset)?;
        serialize_header(self.parent, buf, offset)?;
        serialize_header(self.prev_leaf, buf, offset)?;
        serialize_header(self.next_leaf, buf, offset)?;

        ensure!(
            *offset + 2 <= buf.len(),
            "node key count does not fit at offset {}",
            *offset
        );
        buf[*offset..*offset + 2].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        *offset += 2;
        for key in &self.keys {
            key.serialize_to(buf, offset)?;
        }

        match &self.payload {
            NodePayload::Internal { children } => {
                ensure!(
                    *offset + 2 <= buf.len(),
                    "child count does not fit at offset {}",
                    *offset
                );
                buf[*offset..*offset + 2]
                    .copy_from_slice(&(children.len() as u16).to_le_bytes());
                *offset += 2;
                for &child in children {
                    serialize_header(Some(child), buf, offset)?;
                }
            }
            NodePayload::ClusteredLeaf { data_page_id } => {
                ensure!(
                    *offset + 4 <= buf.len(),
                    "data page id does not fit at offset {}",
                    *offset
                );
                buf[*offset..*offset + 4].copy_from_slice(&data_page_id.to_le_bytes());
                *offset += 4;
            }
            NodePayload::SecondaryLeaf { locators } => {
                ensure!(
                    locators.len() == self.keys.len(),
                    "secondary leaf has {} locators for {} keys",
                    locators.len(),
                    self.keys.len()
                );
                for locator in locators {
                    ensure!(
                        *offset + 6 <= buf.len(),
                        "row locator does not fit at offset {}",
                        *offset
                    );
                    buf[*offset..*offset + 4].copy_from_slice(&locator.page_id.to_le_bytes());
                    buf[*offset + 4..*offset + 6].copy_from_slice(&locator.slot.to_le_bytes());
                    *offset += 6;
                }
            }
        }
        Ok(())
    }

    pub fn deserialize_from(buf: &[u8], offset: &mut usize) -> Result<Self> {
        ensure!(
            *offset + 5 <= buf.len(),
            "node prefix truncated at offset {}",
            *offset
        );
        let tag = buf[*offset];
        let index_id =
            u32::from_le_bytes(buf[*offset + 1..*offset + 5].try_into().expect("length checked"));
        *offset += 5;

        let header = deserialize_header(buf, offset)?
            .ok_or_else(|| eyre::eyre!("node is missing its own header"))?;
        let parent = deserialize_header(buf, offset)?;
        let prev_leaf = deserialize_header(buf, offset)?;
        let next_leaf = deserialize_header(buf, offset)?;

        ensure!(
            *offset + 2 <= buf.len(),
            "node key count truncated at offset {}",
            *offset
        );
        let key_count =
            u16::from_le_bytes(buf[*offset..*offset + 2].try_into().expect("length checked"))
                as usize;
        *offset += 2;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(Key::deserialize_from(buf, offset)?);
        }

        let payload = match tag {
            TAG_INTERNAL => {
                ensure!(
                    *offset + 2 <= buf.len(),
                    "child count truncated at offset {}",
                    *offset
                );
                let child_count = u16::from_le_bytes(
                    buf[*offset..*offset + 2].try_into().expect("length checked"),
                ) as usize;
                *offset += 2;
                let mut children = Vec::with_capacity(child_count);
                for _ in 0..child_count {
                    children.push(
                        deserialize_header(buf, offset)?
                            .ok_or_else(|| eyre::eyre!("internal node has an absent child"))?,
                    );
                }
                NodePayload::Internal { children }
            }
            TAG_CLUSTERED_LEAF => {
                ensure!(
                    *offset + 4 <= buf.len(),
                    "data page id truncated at offset {}",
                    *offset
                );
                let data_page_id = u32::from_le_bytes(
                    buf[*offset..*offset + 4].try_into().expect("length checked"),
                );
                *offset += 4;
                NodePayload::ClusteredLeaf { data_page_id }
            }
            TAG_SECONDARY_LEAF => {
                let mut locators = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    ensure!(
                        *offset + 6 <= buf.len(),
                        "row locator truncated at offset {}",
                        *offset
                    );
                    let page_id = u32::from_le_bytes(
                        buf[*offset..*offset + 4].try_into().expect("length checked"),
                    );
                    let slot = u16::from_le_bytes(
                        buf[*offset + 4..*offset + 6].try_into().expect("length checked"),
                    );
                    *offset += 6;
                    locators.push(RowLocator::new(page_id, slot));
                }
                NodePayload::SecondaryLeaf { locators }
            }
            _ => bail!("unsupported node payload tag: {:#04x}", tag),
        };

        Ok(Self {
            index_id,
            header,
            parent,
            prev_leaf,
            next_leaf,
            keys,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with_keys(keys: &[i64]) -> Node {
        let mut node = Node::secondary_leaf(7);
        node.header = NodeHeader::new(10, 0);
        node.keys = keys.iter().copied().map(Key::from_int).collect();
        node.payload = NodePayload::SecondaryLeaf {
            locators: keys
                .iter()
                .enumerate()
                .map(|(i, _)| RowLocator::new(3, i as u16))
                .collect(),
        };
        node
    }

    #[test]
    fn lower_bound_finds_insertion_slot() {
        let node = leaf_with_keys(&[2, 4, 6]);

        assert_eq!(node.lower_bound(&Key::from_int(1)), 0);
        assert_eq!(node.lower_bound(&Key::from_int(4)), 1);
        assert_eq!(node.lower_bound(&Key::from_int(5)), 2);
        assert_eq!(node.lower_bound(&Key::from_int(9)), 3);
    }

    #[test]
    fn child_slot_sends_equal_keys_right() {
        let mut node = Node::internal(7);
        node.keys = vec![Key::from_int(10), Key::from_int(20)];

        assert_eq!(node.child_slot(&Key::from_int(5)), 0);
        assert_eq!(node.child_slot(&Key::from_int(10)), 1);
        assert_eq!(node.child_slot(&Key::from_int(15)), 1);
        assert_eq!(node.child_slot(&Key::from_int(20)), 2);
        assert_eq!(node.child_slot(&Key::from_int(99)), 2);
    }

    #[test]
    fn secondary_leaf_round_trip() {
        let mut node = leaf_with_keys(&[1, 3]);
        node.parent = Some(NodeHeader::new(9, 2));
        node.next_leaf = Some(NodeHeader::new(11, 0));

        let mut buf = vec![0u8; 256];
        let mut offset = 0;
        node.serialize_to(&mut buf, &mut offset).unwrap();
        assert_eq!(offset, node.serialized_size());

        let mut read_offset = 0;
        let parsed = Node::deserialize_from(&buf, &mut read_offset).unwrap();
        assert_eq!(parsed, node);
        assert_eq!(read_offset, offset);
    }

    #[test]
    fn internal_round_trip() {
        let mut node = Node::internal(3);
        node.header = NodeHeader::new(10, 4);
        node.keys = vec![Key::from_int(50)];
        node.payload = NodePayload::Internal {
            children: vec![NodeHeader::new(10, 0), NodeHeader::new(12, 1)],
        };

        let mut buf = vec![0u8; 256];
        let mut offset = 0;
        node.serialize_to(&mut buf, &mut offset).unwrap();

        let mut read_offset = 0;
        let parsed = Node::deserialize_from(&buf, &mut read_offset).unwrap();
        assert_eq!(parsed, node);
        assert!(!parsed.is_leaf());
        assert_eq!(parsed.child_headers().len(), 2);
    }

    #[test]
    fn clustered_leaf_round_trip() {
        let mut node = Node::clustered_leaf(0, 42);
        node.header = NodeHeader::new(8, 0);
        node.keys = vec![Key::from_int(1), Key::from_int(2)];
        node.prev_leaf = Some(NodeHeader::new(6, 1));

        let mut buf = vec![0u8; 256];
        let mut offset = 0;
        node.serialize_to(&mut buf, &mut offset).unwrap();

        let mut read_offset = 0;
        let parsed = Node::deserialize_from(&buf, &mut read_offset).unwrap();
        assert_eq!(parsed, node);
        assert_eq!(parsed.data_page_id().unwrap(), 42);
    }

    #[test]
    fn locator_key_mismatch_is_rejected() {
        let mut node = leaf_with_keys(&[1, 2]);
        node.payload = NodePayload::SecondaryLeaf {
            locators: vec![RowLocator::new(3, 0)],
        };

        let mut buf = vec![0u8; 256];
        let mut offset = 0;
        assert!(node.serialize_to(&mut buf, &mut offset).is_err());
    }
}
