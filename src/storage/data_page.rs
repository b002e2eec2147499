//! # Data Pages
//!
//! A data page holds the serialized rows of one table, back to back after
//! the page header. The slot of a row is its position in the sequence, so a
//! [`RowLocator`] is stable as long as earlier rows do not move: heap pages
//! only append, and clustered pages move rows only during a leaf split,
//! which rewrites the affected tree bookkeeping.
//!
//! Every mutation keeps `item_count` and `bytes_left` in the header exact;
//! the cache relies on `bytes_left` when re-checking a candidate page found
//! through the free-space map, and the free-space category is recomputed
//! from it after every change.

use eyre::{ensure, Result};

use crate::config::{PAGE_HEADER_SIZE, PAGE_USABLE_SIZE};
use crate::row::Row;
use crate::storage::page::{PageHeader, PageKind};
use crate::types::ColumnDef;

#[derive(Debug, Clone)]
pub struct DataPage {
    header: PageHeader,
    rows: Vec<Row>,
}

impl DataPage {
    pub fn new(page_id: u32) -> Self {
        Self {
            header: PageHeader::new(page_id, PageKind::Data),
            rows: Vec::new(),
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

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, slot: u16) -> Result<&Row> {
        self.rows.get(slot as usize).ok_or_else(|| {
            eyre::eyre!(
                "page {} has {} rows, no slot {}",
                self.page_id(),
                self.rows.len(),
                slot
            )
        })
    }

    fn fits(&self, row: &Row) -> Result<()> {
        ensure!(
            row.total_size() <= self.bytes_left(),
            "row of {} bytes does not fit in page {} ({} bytes left)",
            row.total_size(),
            self.page_id(),
            self.bytes_left()
        );
        Ok(())
    }

    fn account_insert(&mut self, size: usize) {
        self.header.set_item_count(self.rows.len() as u16);
        self.header
            .set_bytes_left((self.bytes_left() - size) as u16);
    }

    /// Appends a row, returning its slot. Rejected when the row does not fit.
    pub fn insert_row(&mut self, row: Row) -> Result<u16> {
        self.fits(&row)?;
        let size = row.total_size();
        let slot = self.rows.len() as u16;
        self.rows.push(row);
        self.account_insert(size);
        Ok(slot)
    }

    /// Inserts a row at a fixed slot, shifting later rows. Used by clustered
    /// leaves, where row order on the page is key order.
    pub fn insert_row_at(&mut self, slot: usize, row: Row) -> Result<()> {
        ensure!(
            slot <= self.rows.len(),
            "slot {} out of range for page {} with {} rows",
            slot,
            self.page_id(),
            self.rows.len()
        );
        self.fits(&row)?;
        let size = row.total_size();
        self.rows.insert(slot, row);
        self.account_insert(size);
        Ok(())
    }

    /// Removes and returns the rows from `at` onward, used when a clustered
    /// leaf split physically splits its data page.
    pub fn split_off(&mut self, at: usize) -> Vec<Row> {
        let tail = self.rows.split_off(at);
        let freed: usize = tail.iter().map(Row::total_size).sum();
        self.header.set_item_count(self.rows.len() as u16);
        self.header
            .set_bytes_left((self.bytes_left() + freed) as u16);
        tail
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        for row in &self.rows {
            row.serialize_to(buf, &mut offset)?;
        }
        Ok(())
    }

    pub fn deserialize(buf: &[u8], columns: &[ColumnDef]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::Data,
            "page {} is {:?}, expected Data",
            header.page_id(),
            header.kind()
        );

        let mut offset = PAGE_HEADER_SIZE;
        let mut rows = Vec::with_capacity(header.item_count() as usize);
        for _ in 0..header.item_count() {
            rows.push(Row::deserialize_from(buf, &mut offset, columns)?);
        }

        let used: usize = rows.iter().map(Row::total_size).sum();
        ensure!(
            header.bytes_left() as usize == PAGE_USABLE_SIZE - used,
            "page {} header claims {} bytes left but rows occupy {}",
            header.page_id(),
            header.bytes_left(),
            used
        );

        Ok(Self { header, rows })
    }
}
