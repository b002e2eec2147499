//! # Row Queries
//!
//! Bound predicates and the scan paths behind `select`. Predicates arrive
//! from the layer above already resolved to column indices and typed
//! values.
//!
//! Heap (non-indexed) scans are the engine's one parallel path: one worker
//! thread per allocated extent, each independently walking its extent's
//! pages and appending matching rows into a single shared result sequence
//! under a dedicated lock. Only the scan and filter work overlaps; every
//! append is serialized.
//!
//! Clustered tables scan in key order by walking the leaf chain, or answer
//! a full-key equality predicate with a single tree descent.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::btree::{Key, TreeReader};
use crate::database::table::IndexMeta;
use crate::database::Database;
use crate::row::{Row, RowLocator};
use crate::storage::alloc_page::PfsKind;
use crate::storage::layout;
use crate::types::OwnedValue;

/// Comparison operator of a bound predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn matches(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::NotEq => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::LtEq => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// One predicate, already bound to a column index and a typed value.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: u16,
    pub op: CmpOp,
    pub value: OwnedValue,
}

impl Predicate {
    pub fn new(column: u16, op: CmpOp, value: OwnedValue) -> Self {
        Self { column, op, value }
    }
}

impl Database {
    /// Returns the requested columns of every row matching all predicates,
    /// up to `limit`. Out-of-row values are reassembled transparently.
    pub fn select(
        &self,
        table_name: &str,
        column_indices: &[u16],
        predicates: &[Predicate],
        limit: Option<usize>,
    ) -> Result<Vec<Vec<OwnedValue>>> {
        let table_idx = self.catalog.table_index(table_name)?;
        let table = &self.catalog.tables[table_idx];
        ensure!(!column_indices.is_empty(), "select needs at least one column");
        for &col in column_indices {
            table.column(col)?;
        }
        for predicate in predicates {
            table.column(predicate.column)?;
        }

        let (rows, already_filtered) = if let Some(meta) = &table.clustered {
            match full_key_eq_values(&meta.key_columns, predicates) {
                Some(key_values) if meta.root_page_id != 0 => {
                    let key = Key::from_values(&key_values, &table.columns, &meta.key_columns)?;
                    let rows = match TreeReader::new(&self.engine, meta).search(&key)? {
                        Some(locator) => vec![self.row_at(table_idx, locator)?],
                        None => Vec::new(),
                    };
                    (rows, false)
                }
                _ => (self.clustered_rows(table_idx, meta)?, false),
            }
        } else {
            (self.heap_scan(table_idx, predicates)?, true)
        };

        let mut out = Vec::new();
        for row in rows {
            if !already_filtered && !self.matches_row(table_idx, &row, predicates)? {
                continue;
            }
            let mut projected = Vec::with_capacity(column_indices.len());
            for &col in column_indices {
                projected.push(self.resolve_value_at(table_idx, &row, col)?);
            }
            out.push(projected);
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }

    pub(crate) fn matches_row(
        &self,
        table_idx: usize,
        row: &Row,
        predicates: &[Predicate],
    ) -> Result<bool> {
        for predicate in predicates {
            let value = self.resolve_value_at(table_idx, row, predicate.column)?;
            // NULL compares as unknown and never satisfies a predicate.
            if value.is_null() {
                return Ok(false);
            }
            if !predicate.op.matches(value.compare(&predicate.value)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn row_at(&self, table_idx: usize, locator: RowLocator) -> Result<Row> {
        let columns = &self.catalog.tables[table_idx].columns;
        let guard = self.engine.data_page(locator.page_id, Some(columns))?;
        Ok(guard.page().as_data()?.row(locator.slot)?.clone())
    }

    /// Parallel heap scan: one worker per extent, matches appended to a
    /// shared sequence under its own lock.
    pub(crate) fn heap_scan(
        &self,
        table_idx: usize,
        predicates: &[Predicate],
    ) -> Result<Vec<Row>> {
        let extents = self.owned_extents(table_idx)?;
        if extents.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            table = self.catalog.tables[table_idx].name,
            workers = extents.len(),
            "parallel heap scan"
        );

        let results: Mutex<Vec<Row>> = Mutex::new(Vec::new());
        let failures: Mutex<Vec<eyre::Report>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for &extent in &extents {
                let results = &results;
                let failures = &failures;
                scope.spawn(move || match self.scan_extent(table_idx, extent, predicates) {
                    Ok(rows) => {
                        let mut shared = results.lock();
                        for row in rows {
                            shared.push(row);
                        }
                    }
                    Err(error) => failures.lock().push(error),
                });
            }
        });

        if let Some(error) = failures.into_inner().into_iter().next() {
            return Err(error);
        }
        Ok(results.into_inner())
    }

    fn scan_extent(
        &self,
        table_idx: usize,
        extent: u32,
        predicates: &[Predicate],
    ) -> Result<Vec<Row>> {
        let columns = self.catalog.tables[table_idx].columns.clone();
        let mut matches = Vec::new();
        for page_id in layout::extent_pages(extent) {
            let entry = self.pfs_entry(page_id)?;
            if !entry.allocated || entry.kind != PfsKind::Data {
                continue;
            }
            // Copy rows out so the pool guard stays a short critical
            // section; the filter work happens outside it.
            let rows: Vec<Row> = {
                let guard = self.engine.data_page(page_id, Some(&columns))?;
                guard.page().as_data()?.rows().to_vec()
            };
            for row in rows {
                if self.matches_row(table_idx, &row, predicates)? {
                    matches.push(row);
                }
            }
        }
        Ok(matches)
    }

    /// All rows of a clustered table in key order, by leaf-chain walk.
    fn clustered_rows(&self, table_idx: usize, meta: &IndexMeta) -> Result<Vec<Row>> {
        let columns = self.catalog.tables[table_idx].columns.clone();
        let reader = TreeReader::new(&self.engine, meta);
        let mut rows = Vec::new();
        let Some(mut leaf_h) = reader.first_leaf()? else {
            return Ok(rows);
        };
        loop {
            let leaf = reader.node(leaf_h)?;
            let data_page_id = leaf.data_page_id()?;
            let page_rows: Vec<Row> = {
                let guard = self.engine.data_page(data_page_id, Some(&columns))?;
                guard.page().as_data()?.rows().to_vec()
            };
            rows.extend(page_rows);
            match leaf.next_leaf {
                Some(next) => leaf_h = next,
                None => return Ok(rows),
            }
        }
    }

    /// Sequential heap walk yielding locators, used for index backfill.
    pub(crate) fn heap_rows_with_locators(
        &self,
        table_idx: usize,
    ) -> Result<Vec<(RowLocator, Row)>> {
        let columns = self.catalog.tables[table_idx].columns.clone();
        let mut out = Vec::new();
        for extent in self.owned_extents(table_idx)? {
            for page_id in layout::extent_pages(extent) {
                let entry = self.pfs_entry(page_id)?;
                if !entry.allocated || entry.kind != PfsKind::Data {
                    continue;
                }
                let rows: Vec<Row> = {
                    let guard = self.engine.data_page(page_id, Some(&columns))?;
                    guard.page().as_data()?.rows().to_vec()
                };
                for (slot, row) in rows.into_iter().enumerate() {
                    out.push((RowLocator::new(page_id, slot as u16), row));
                }
            }
        }
        Ok(out)
    }
}

/// When every clustered key column carries an equality predicate, returns
/// the bound values in key-column order.
fn full_key_eq_values(key_columns: &[u16], predicates: &[Predicate]) -> Option<Vec<OwnedValue>> {
    let mut values = Vec::with_capacity(key_columns.len());
    for &col in key_columns {
        let predicate = predicates
            .iter()
            .find(|p| p.column == col && p.op == CmpOp::Eq)?;
        values.push(predicate.value.clone());
    }
    Some(values)
}
