//! # Row and Block Model
//!
//! A [`Row`] is the in-memory form of one table row: a null bitmap, a
//! large-object bitmap, and one owned [`Block`] per column. Rows own their
//! blocks; data pages own their rows. Nothing in this module touches disk:
//! pages serialize rows into their buffers and the engine moves the buffers.
//!
//! ## In-page encoding
//!
//! ```text
//! Offset  Size         Field
//! ------  -----------  ------------------------------------------
//! 0       2            total_size (includes this field)
//! 2       ceil(n/8)    null bitmap, bit i set = column i is NULL
//! ..      ceil(n/8)    LOB bitmap, bit i set = column i stored out of row
//! ..      2 + len      per non-null column: length prefix + block bytes
//! ```
//!
//! Null columns contribute only their bitmap bit. A column with its LOB bit
//! set stores a 6-byte pointer (page id + object index) in place of the
//! value; the bytes live in a chain of large-object records.

mod block;

pub use block::Block;

use eyre::{bail, ensure, Result};

use crate::bitmap::ByteMap;
use crate::config::{LOB_POINTER_SIZE, ROW_LENGTH_PREFIX_SIZE};
use crate::types::{ColumnDef, OwnedValue};

/// Physical location of a row: data page and slot within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLocator {
    pub page_id: u32,
    pub slot: u16,
}

impl RowLocator {
    pub fn new(page_id: u32, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

/// One table row: bitmaps plus one block per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    null_map: ByteMap,
    lob_map: ByteMap,
    blocks: Vec<Block>,
}

impl Row {
    /// Builds a row from typed values, enforcing arity and nullability.
    /// Large values are not chunked here; the database layer rewrites
    /// oversized blocks into LOB pointers before the row reaches a page.
    pub fn from_values(columns: &[ColumnDef], values: &[OwnedValue]) -> Result<Self> {
        ensure!(
            values.len() == columns.len(),
            "row has {} values but table has {} columns",
            values.len(),
            columns.len()
        );

        let mut null_map = ByteMap::with_bit_capacity(columns.len());
        let lob_map = ByteMap::with_bit_capacity(columns.len());
        let mut blocks = Vec::with_capacity(columns.len());

        for (column, value) in columns.iter().zip(values) {
            if value.is_null() {
                if !column.nullable() {
                    bail!("column {} is NOT NULL", column.name());
                }
                null_map.set(column.index() as usize, true);
                blocks.push(Block::empty(column.index()));
            } else {
                let bytes = value.encode(column.data_type())?;
                blocks.push(Block::new(column.index(), bytes));
            }
        }

        Ok(Self {
            null_map,
            lob_map,
            blocks,
        })
    }

    pub(crate) fn from_parts(null_map: ByteMap, lob_map: ByteMap, blocks: Vec<Block>) -> Self {
        Self {
            null_map,
            lob_map,
            blocks,
        }
    }

    pub fn column_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_null(&self, column: usize) -> bool {
        self.null_map.get(column)
    }

    pub fn is_lob(&self, column: usize) -> bool {
        self.lob_map.get(column)
    }

    pub fn block(&self, column: usize) -> &Block {
        &self.blocks[column]
    }

    /// Replaces a column's block with a large-object pointer and flags it in
    /// the LOB bitmap. `page_id`/`object_index` address the chain head.
    pub fn convert_to_lob(&mut self, column: usize, page_id: u32, object_index: u16) {
        let mut pointer = Vec::with_capacity(LOB_POINTER_SIZE);
        pointer.extend_from_slice(&page_id.to_le_bytes());
        pointer.extend_from_slice(&object_index.to_le_bytes());
        self.blocks[column] = Block::new(column as u16, pointer);
        self.lob_map.set(column, true);
    }

    /// Decodes the chain-head address of a LOB column.
    pub fn lob_pointer(&self, column: usize) -> Result<(u32, u16)> {
        ensure!(self.is_lob(column), "column {} is not stored out of row", column);
        let bytes = self.blocks[column].bytes();
        ensure!(
            bytes.len() == LOB_POINTER_SIZE,
            "LOB pointer must be {} bytes, got {}",
            LOB_POINTER_SIZE,
            bytes.len()
        );
        let page_id = u32::from_le_bytes(bytes[0..4].try_into().expect("length checked"));
        let object_index = u16::from_le_bytes(bytes[4..6].try_into().expect("length checked"));
        Ok((page_id, object_index))
    }

    /// Decodes an in-row column back to an owned value. LOB columns must be
    /// resolved through the database layer instead.
    pub fn value(&self, column: usize, columns: &[ColumnDef]) -> Result<OwnedValue> {
        if self.is_null(column) {
            return Ok(OwnedValue::Null);
        }
        ensure!(
            !self.is_lob(column),
            "column {} is stored out of row; read it through the large-object chain",
            column
        );
        OwnedValue::decode(columns[column].data_type(), self.blocks[column].bytes())
    }

    fn bitmap_len(&self) -> usize {
        self.blocks.len().div_ceil(8)
    }

    /// Full in-page size: size field, both bitmaps, and each non-null
    /// block's length prefix plus bytes.
    pub fn total_size(&self) -> usize {
        let mut size = 2 + 2 * self.bitmap_len();
        for (i, block) in self.blocks.iter().enumerate() {
            if !self.null_map.get(i) {
                size += ROW_LENGTH_PREFIX_SIZE + block.len();
            }
        }
        size
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: &mut usize) -> Result<()> {
        let total = self.total_size();
        ensure!(
            *offset + total <= buf.len(),
            "row of {} bytes does not fit at offset {}",
            total,
            *offset
        );

        buf[*offset..*offset + 2].copy_from_slice(&(total as u16).to_le_bytes());
        *offset += 2;
        self.null_map.serialize_to(buf, offset)?;
        self.lob_map.serialize_to(buf, offset)?;

        for (i, block) in self.blocks.iter().enumerate() {
            if self.null_map.get(i) {
                continue;
            }
            let len = block.len() as u16;
            buf[*offset..*offset + 2].copy_from_slice(&len.to_le_bytes());
            *offset += 2;
            buf[*offset..*offset + block.len()].copy_from_slice(block.bytes());
            *offset += block.len();
        }
        Ok(())
    }

    pub fn deserialize_from(buf: &[u8], offset: &mut usize, columns: &[ColumnDef]) -> Result<Self> {
        let start = *offset;
        ensure!(*offset + 2 <= buf.len(), "row header truncated at offset {}", *offset);
        let total = u16::from_le_bytes(buf[*offset..*offset + 2].try_into().expect("length checked")) as usize;
        *offset += 2;

        let bitmap_len = columns.len().div_ceil(8);
        let null_map = ByteMap::deserialize_from(buf, offset, bitmap_len)?;
        let lob_map = ByteMap::deserialize_from(buf, offset, bitmap_len)?;

        let mut blocks = Vec::with_capacity(columns.len());
        for column in columns {
            if null_map.get(column.index() as usize) {
                blocks.push(Block::empty(column.index()));
                continue;
            }
            ensure!(*offset + 2 <= buf.len(), "block prefix truncated at offset {}", *offset);
            let len =
                u16::from_le_bytes(buf[*offset..*offset + 2].try_into().expect("length checked")) as usize;
            *offset += 2;
            ensure!(
                *offset + len <= buf.len(),
                "block of {} bytes truncated at offset {}",
                len,
                *offset
            );
            blocks.push(Block::new(column.index(), buf[*offset..*offset + len].to_vec()));
            *offset += len;
        }

        ensure!(
            *offset - start == total,
            "row decoded to {} bytes but header claims {}",
            *offset - start,
            total
        );
        Ok(Self {
            null_map,
            lob_map,
            blocks,
        })
    }
}
