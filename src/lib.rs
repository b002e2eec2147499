//! # ExtentDB - Single-File Relational Storage Engine
//!
//! ExtentDB owns the on-disk layout, the page cache, the extent-based
//! space allocator, and disk-resident B+Tree indexes of a single-file
//! relational database. The SQL layer lives above this crate and arrives
//! with column indices and typed values already bound; nothing here parses
//! text, logs transactions, or recovers from crashes.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │        Database (tables, catalog)      │
//! ├───────────────────────────────────────┤
//! │  Space Allocator (GAM / IAM / PFS)     │
//! ├──────────────────┬────────────────────┤
//! │  B+Tree Indexes  │  Heap Row Storage   │
//! ├──────────────────┴────────────────────┤
//! │   Page Cache (data pool, system pool)  │
//! ├───────────────────────────────────────┤
//! │      Single backing file, 8K pages     │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One file per database. Page 0 is the catalog; page 1 and every
//! free-space stride thereafter is a PFS page; page 2 and every extent-map
//! stride is a GAM page. Everything else belongs to some table, grouped
//! into 8-page extents tracked by that table's IAM chain.
//!
//! ## Quick Start
//!
//! ```ignore
//! use extentdb::{ColumnDef, Database, DataType, OwnedValue};
//!
//! let mut db = Database::create("./library.db", "library")?;
//! db.create_table(
//!     "books",
//!     vec![
//!         ColumnDef::new("id", DataType::BigInt, 0).not_null(),
//!         ColumnDef::varchar("title", 200, 1),
//!     ],
//!     Some(vec![0]),
//! )?;
//! db.insert_row("books", &[OwnedValue::BigInt(1), OwnedValue::Text("Dune".into())])?;
//! let hit = db.search_key("books", &[OwnedValue::BigInt(1)])?;
//! db.close()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`bitmap`]: bit/byte maps behind null tracking and allocation maps
//! - [`storage`]: typed pages, layout arithmetic, the split page cache
//! - [`btree`]: disk-resident clustered and non-clustered index trees
//! - [`database`]: catalog, space allocator, and the row-level surface
//! - [`row`] / [`types`]: the row/block model and column scalar types

#[macro_use]
mod macros;

pub mod bitmap;
pub mod btree;
pub mod config;
pub mod database;
pub mod row;
pub mod storage;
pub mod types;

pub use database::{Catalog, CmpOp, Database, IndexMeta, Predicate, Table};
pub use row::{Row, RowLocator};
pub use types::{ColumnDef, DataType, OwnedValue};
