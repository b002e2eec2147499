//! # Disk-Resident B+Tree Index
//!
//! Clustered and non-clustered index trees whose nodes live inside index
//! pages rather than in memory. A node is addressed by `(page_id, slot)`
//! and fetched through the page cache on every traversal step; the index
//! page layout lives here next to the node format because the two evolve
//! together.
//!
//! - [`key`]: composite keys with total, type-aware ordering
//! - [`node`]: node layout and logical addressing
//! - [`index_page`]: the page that stores serialized nodes
//! - [`tree`]: descent, proactive node splits, and page-level splits

pub mod index_page;
pub mod key;
pub mod node;
pub mod tree;

pub use index_page::IndexPage;
pub use key::{Key, KeyPart};
pub use node::{Node, NodeHeader, NodePayload};
pub use tree::{check_link_invariants, BTree, TreeInsert, TreeReader, TreeSpace};
