//! Catalog model: tables, indexes, and allocation high-water marks.
//!
//! These structs are the in-memory working copy of page 0; the byte layout
//! lives in [`crate::storage::catalog_page`]. A table is either
//! heap-organized (rows placed by the free-space scan, optional secondary
//! indexes) or clustered (row order defined by the clustered tree, no
//! secondaries, since locators into clustered leaves would go stale on
//! physical splits).

use eyre::{bail, ensure, Result};

use crate::config::{LOB_POINTER_SIZE, LOB_THRESHOLD, PAGE_USABLE_SIZE, ROW_LENGTH_PREFIX_SIZE};
use crate::types::ColumnDef;

/// One index of a table. The clustered index always has id 0; secondary
/// indexes count up from 1. `root_page_id` of 0 means the tree is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub index_id: u32,
    pub root_page_id: u32,
    pub key_columns: Vec<u16>,
}

impl IndexMeta {
    pub fn new(index_id: u32, key_columns: Vec<u16>) -> Self {
        Self {
            index_id,
            root_page_id: 0,
            key_columns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub id: u32,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Head of the table's IAM chain; 0 until the first extent is allocated.
    pub iam_page_id: u32,
    pub max_row_size: u16,
    pub clustered: Option<IndexMeta>,
    pub secondary: Vec<IndexMeta>,
}

impl Table {
    pub fn is_clustered(&self) -> bool {
        self.clustered.is_some()
    }

    pub fn column(&self, index: u16) -> Result<&ColumnDef> {
        self.columns.get(index as usize).ok_or_else(|| {
            eyre::eyre!(
                "table {} has {} columns, no index {}",
                self.name,
                self.columns.len(),
                index
            )
        })
    }

    pub fn secondary_index(&self, index_id: u32) -> Result<&IndexMeta> {
        self.secondary
            .iter()
            .find(|m| m.index_id == index_id)
            .ok_or_else(|| eyre::eyre!("table {} has no index {}", self.name, index_id))
    }

    /// Worst-case in-page size of one row: header, bitmaps, and per-column
    /// length prefix plus the larger of the declared size (capped by the
    /// out-of-row threshold) and a large-object pointer.
    pub fn compute_max_row_size(columns: &[ColumnDef]) -> usize {
        let bitmap = columns.len().div_ceil(8);
        let mut size = 2 + 2 * bitmap;
        for column in columns {
            let in_row = (column.declared_size() as usize)
                .min(LOB_THRESHOLD)
                .max(LOB_POINTER_SIZE);
            size += ROW_LENGTH_PREFIX_SIZE + in_row;
        }
        size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub name: String,
    pub last_table_id: u32,
    pub last_pfs_page_id: u32,
    pub last_gam_page_id: u32,
    pub tables: Vec<Table>,
}

impl Catalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_table_id: 0,
            last_pfs_page_id: 0,
            last_gam_page_id: 0,
            tables: Vec::new(),
        }
    }

    pub fn table_index(&self, name: &str) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| eyre::eyre!("no table named {name}"))
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        Ok(&self.tables[self.table_index(name)?])
    }

    /// Registers a new table, validating its definition.
    pub fn add_table(
        &mut self,
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        clustered_key: Option<Vec<u16>>,
    ) -> Result<u32> {
        let name = name.into();
        ensure!(!name.is_empty(), "table name cannot be empty");
        if self.tables.iter().any(|t| t.name == name) {
            bail!("table {name} already exists");
        }
        ensure!(!columns.is_empty(), "table {name} needs at least one column");
        for (i, column) in columns.iter().enumerate() {
            ensure!(
                column.index() as usize == i,
                "column {} carries index {} at position {}",
                column.name(),
                column.index(),
                i
            );
        }

        let max_row_size = Table::compute_max_row_size(&columns);
        ensure!(
            max_row_size <= PAGE_USABLE_SIZE,
            "table {name}: worst-case row of {max_row_size} bytes exceeds page capacity"
        );

        let clustered = match clustered_key {
            Some(key_columns) => {
                ensure!(
                    !key_columns.is_empty(),
                    "clustered key needs at least one column"
                );
                for &col in &key_columns {
                    let column = columns.get(col as usize).ok_or_else(|| {
                        eyre::eyre!("clustered key column {} out of range", col)
                    })?;
                    ensure!(
                        column.data_type().is_orderable_key(),
                        "column {} ({:?}) cannot be a clustered key",
                        column.name(),
                        column.data_type()
                    );
                    ensure!(
                        !column.nullable(),
                        "clustered key column {} must be NOT NULL",
                        column.name()
                    );
                }
                Some(IndexMeta::new(0, key_columns))
            }
            None => None,
        };

        self.last_table_id += 1;
        let id = self.last_table_id;
        self.tables.push(Table {
            id,
            name,
            columns,
            iam_page_id: 0,
            max_row_size: max_row_size as u16,
            clustered,
            secondary: Vec::new(),
        });
        Ok(id)
    }
}
