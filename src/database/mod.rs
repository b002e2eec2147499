//! # Database Surface
//!
//! [`Database`] ties the storage engine, the catalog, the space allocator,
//! and the index trees together behind the row-level operations callers
//! use: `insert_row`, `select`, `search_key`, `range_query`. The SQL layer
//! above this crate arrives with column indices and typed values already
//! bound; nothing here parses text.
//!
//! A database is one file. `create` bootstraps the three fixed system pages
//! (catalog, first free-space map, first extent map); `open` reloads the
//! catalog from page 0. Durability is deliberate but simple: dirty pages
//! reach disk on cache eviction and on `flush`/`close`. There is no
//! write-ahead log and no recovery.

pub mod allocator;
pub mod query;
pub mod table;

pub use query::{CmpOp, Predicate};
pub use table::{Catalog, IndexMeta, Table};

use std::path::Path;

use eyre::{bail, ensure, Result};
use tracing::{debug, info};

use crate::btree::{BTree, Key, TreeInsert, TreeReader};
use crate::config::{
    CATALOG_PAGE_ID, FIRST_GAM_PAGE_ID, FIRST_PFS_PAGE_ID, LOB_THRESHOLD, MAX_NUMBER_OF_PAGES,
    MAX_NUMBER_SYSTEM_PAGES,
};
use crate::database::allocator::TableSpace;
use crate::row::{Row, RowLocator};
use crate::storage::alloc_page::{ExtentMapPage, FreeSpacePage, PfsEntry, PfsKind};
use crate::storage::catalog_page::CatalogPage;
use crate::storage::engine::StorageEngine;
use crate::storage::layout;
use crate::storage::page::Page;
use crate::types::{ColumnDef, OwnedValue};

pub struct Database {
    pub(crate) engine: StorageEngine,
    pub(crate) catalog: Catalog,
}

impl Database {
    /// Creates a fresh database file and bootstraps its system pages.
    pub fn create(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        Self::create_with_capacities(path, name, MAX_NUMBER_OF_PAGES, MAX_NUMBER_SYSTEM_PAGES)
    }

    pub fn create_with_capacities(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        data_capacity: usize,
        system_capacity: usize,
    ) -> Result<Self> {
        let engine =
            StorageEngine::create_with_capacities(path, data_capacity, system_capacity)?;
        let mut catalog = Catalog::new(name);
        catalog.last_pfs_page_id = FIRST_PFS_PAGE_ID;
        catalog.last_gam_page_id = FIRST_GAM_PAGE_ID;

        let mut pfs = FreeSpacePage::new(FIRST_PFS_PAGE_ID);
        for page_id in [CATALOG_PAGE_ID, FIRST_PFS_PAGE_ID, FIRST_GAM_PAGE_ID] {
            let (_, entry) = layout::pfs_location(page_id);
            pfs.set_entry(entry, PfsEntry::new(PfsKind::System, 0))?;
        }

        engine.create_page(Page::Catalog(CatalogPage::new(catalog.clone())))?;
        engine.create_page(Page::FreeSpace(pfs))?;
        engine.create_page(Page::ExtentMap(ExtentMapPage::new(FIRST_GAM_PAGE_ID)))?;
        info!(name = catalog.name, "database created");
        Ok(Self { engine, catalog })
    }

    /// Opens an existing database and reloads its catalog from page 0.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacities(path, MAX_NUMBER_OF_PAGES, MAX_NUMBER_SYSTEM_PAGES)
    }

    pub fn open_with_capacities(
        path: impl AsRef<Path>,
        data_capacity: usize,
        system_capacity: usize,
    ) -> Result<Self> {
        let engine = StorageEngine::open_with_capacities(path, data_capacity, system_capacity)?;
        let catalog = {
            let guard = engine.system_page(CATALOG_PAGE_ID)?;
            guard.page().as_catalog()?.catalog().clone()
        };
        info!(name = catalog.name, tables = catalog.tables.len(), "database opened");
        Ok(Self { engine, catalog })
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.catalog.table(name)
    }

    /// Persists the catalog into page 0 and writes every dirty page back.
    pub fn flush(&mut self) -> Result<()> {
        {
            let mut guard = self.engine.system_page(CATALOG_PAGE_ID)?;
            guard
                .page_mut()
                .as_catalog_mut()?
                .replace_catalog(self.catalog.clone());
        }
        self.engine.flush_all()?;
        self.engine.sync()
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Registers a table. Pass `clustered_key` to organize rows by key
    /// order; heap tables take `None`.
    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<ColumnDef>,
        clustered_key: Option<Vec<u16>>,
    ) -> Result<u32> {
        let id = self.catalog.add_table(name, columns, clustered_key)?;
        debug!(table = name, id, "table created");
        Ok(id)
    }

    /// Creates a non-clustered index over a heap table and backfills it
    /// from the existing rows. Rows with a NULL key column are not indexed;
    /// a column whose stored values already live out of row cannot be
    /// indexed at all.
    pub fn create_index(&mut self, table_name: &str, key_columns: Vec<u16>) -> Result<u32> {
        let table_idx = self.catalog.table_index(table_name)?;
        {
            let table = &self.catalog.tables[table_idx];
            ensure!(
                !table.is_clustered(),
                "table {} is clustered; physical splits would strand secondary locators",
                table_name
            );
            ensure!(!key_columns.is_empty(), "index needs at least one key column");
            for &col in &key_columns {
                let column = table.column(col)?;
                ensure!(
                    column.data_type().is_orderable_key(),
                    "column {} ({:?}) cannot be an index key",
                    column.name(),
                    column.data_type()
                );
            }
        }

        let index_id = self.catalog.tables[table_idx]
            .secondary
            .iter()
            .map(|m| m.index_id)
            .max()
            .unwrap_or(0)
            + 1;
        let mut meta = IndexMeta::new(index_id, key_columns);
        let columns = self.catalog.tables[table_idx].columns.clone();
        let entry_size = Key::max_serialized_size(&columns, &meta.key_columns) + 6;

        let existing = self.heap_rows_with_locators(table_idx)?;
        for (locator, row) in existing {
            for &col in &meta.key_columns {
                ensure!(
                    !row.is_lob(col as usize),
                    "column {} holds out-of-row values and cannot be indexed",
                    columns[col as usize].name()
                );
            }
            let Some(key) = secondary_key(&row, &columns, &meta.key_columns)? else {
                continue;
            };
            let mut space = TableSpace {
                db: self,
                table_idx,
            };
            let mut tree = BTree::new(&mut space, &mut meta, false, entry_size);
            tree.insert(key, TreeInsert::Locator(locator))?;
        }

        self.catalog.tables[table_idx].secondary.push(meta);
        debug!(table = table_name, index_id, "index created");
        Ok(index_id)
    }

    /// Inserts a row. Oversized non-key column values are chunked out of
    /// row first; an index key never leaves the row, so a key value at the
    /// out-of-row threshold is rejected. Clustered tables place the row
    /// through the clustered tree, heap tables through the free-space scan
    /// plus secondary index maintenance.
    pub fn insert_row(&mut self, table_name: &str, values: &[OwnedValue]) -> Result<RowLocator> {
        let table_idx = self.catalog.table_index(table_name)?;
        let columns = self.catalog.tables[table_idx].columns.clone();
        let mut row = Row::from_values(&columns, values)?;

        let mut key_columns: Vec<u16> = Vec::new();
        {
            let table = &self.catalog.tables[table_idx];
            if let Some(meta) = &table.clustered {
                key_columns.extend_from_slice(&meta.key_columns);
            }
            for meta in &table.secondary {
                key_columns.extend_from_slice(&meta.key_columns);
            }
        }

        for col in 0..columns.len() {
            if row.is_null(col) || row.is_lob(col) || row.block(col).len() < LOB_THRESHOLD {
                continue;
            }
            ensure!(
                !key_columns.contains(&(col as u16)),
                "key column {} value of {} bytes exceeds the in-row key limit of {} bytes",
                columns[col].name(),
                row.block(col).len(),
                LOB_THRESHOLD
            );
            let bytes = row.block(col).bytes().to_vec();
            let (page_id, index) = self.store_lob(table_idx, &bytes)?;
            row.convert_to_lob(col, page_id, index);
        }

        if let Some(meta) = self.catalog.tables[table_idx].clustered.clone() {
            let key = Key::from_row(&row, &columns, &meta.key_columns)?;
            let entry_size = self.catalog.tables[table_idx].max_row_size as usize;
            let mut meta = meta;
            let locator = {
                let mut space = TableSpace {
                    db: self,
                    table_idx,
                };
                let mut tree = BTree::new(&mut space, &mut meta, true, entry_size);
                tree.insert(key, TreeInsert::Row(row))?
            };
            self.catalog.tables[table_idx].clustered = Some(meta);
            Ok(locator)
        } else {
            let locator = self.insert_row_to_page(table_idx, row.clone())?;
            for i in 0..self.catalog.tables[table_idx].secondary.len() {
                let mut meta = self.catalog.tables[table_idx].secondary[i].clone();
                let Some(key) = secondary_key(&row, &columns, &meta.key_columns)? else {
                    continue;
                };
                let entry_size = Key::max_serialized_size(&columns, &meta.key_columns) + 6;
                {
                    let mut space = TableSpace {
                        db: self,
                        table_idx,
                    };
                    let mut tree = BTree::new(&mut space, &mut meta, false, entry_size);
                    tree.insert(key, TreeInsert::Locator(locator))?;
                }
                self.catalog.tables[table_idx].secondary[i] = meta;
            }
            Ok(locator)
        }
    }

    fn preferred_index<'t>(&self, table: &'t Table) -> Result<&'t IndexMeta> {
        match (&table.clustered, table.secondary.first()) {
            (Some(meta), _) => Ok(meta),
            (None, Some(meta)) => Ok(meta),
            (None, None) => bail!("table {} has no index to search", table.name),
        }
    }

    /// Point lookup through the table's clustered index (or its first
    /// secondary index on a heap table).
    pub fn search_key(
        &self,
        table_name: &str,
        key_values: &[OwnedValue],
    ) -> Result<Option<RowLocator>> {
        let table = self.catalog.table(table_name)?;
        let meta = self.preferred_index(table)?;
        if meta.root_page_id == 0 {
            return Ok(None);
        }
        let key = Key::from_values(key_values, &table.columns, &meta.key_columns)?;
        TreeReader::new(&self.engine, meta).search(&key)
    }

    /// Ordered range query over `[min, max]`, returning row locators.
    pub fn range_query(
        &self,
        table_name: &str,
        min_values: &[OwnedValue],
        max_values: &[OwnedValue],
    ) -> Result<Vec<RowLocator>> {
        let table = self.catalog.table(table_name)?;
        let meta = self.preferred_index(table)?;
        if meta.root_page_id == 0 {
            return Ok(Vec::new());
        }
        let min = Key::from_values(min_values, &table.columns, &meta.key_columns)?;
        let max = Key::from_values(max_values, &table.columns, &meta.key_columns)?;
        let results = TreeReader::new(&self.engine, meta).range(&min, &max)?;
        Ok(results.into_iter().map(|(_, locator)| locator).collect())
    }

    /// Loads the row a locator points at.
    pub fn fetch_row(&self, table_name: &str, locator: RowLocator) -> Result<Row> {
        let table = self.catalog.table(table_name)?;
        let guard = self.engine.data_page(locator.page_id, Some(&table.columns))?;
        Ok(guard.page().as_data()?.row(locator.slot)?.clone())
    }

    /// Decodes one column of a row, reassembling out-of-row values.
    pub fn resolve_value(&self, table_name: &str, row: &Row, column: u16) -> Result<OwnedValue> {
        let table_idx = self.catalog.table_index(table_name)?;
        self.resolve_value_at(table_idx, row, column)
    }

    pub(crate) fn resolve_value_at(
        &self,
        table_idx: usize,
        row: &Row,
        column: u16,
    ) -> Result<OwnedValue> {
        let table = &self.catalog.tables[table_idx];
        let col = column as usize;
        if row.is_null(col) {
            return Ok(OwnedValue::Null);
        }
        if row.is_lob(col) {
            let (page_id, index) = row.lob_pointer(col)?;
            let bytes = self.read_lob(page_id, index)?;
            return OwnedValue::decode(table.column(column)?.data_type(), &bytes);
        }
        row.value(col, &table.columns)
    }
}

/// Key over a secondary index, or `None` when a key column is NULL (such
/// rows are simply not indexed).
pub(crate) fn secondary_key(
    row: &Row,
    columns: &[ColumnDef],
    key_columns: &[u16],
) -> Result<Option<Key>> {
    for &col in key_columns {
        if row.is_null(col as usize) {
            return Ok(None);
        }
    }
    Key::from_row(row, columns, key_columns).map(Some)
}
