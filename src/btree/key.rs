//! # Index Keys
//!
//! A [`Key`] is an ordered, possibly composite value extracted from a row's
//! key columns. Ordering is total and identical across insert, point search,
//! and range query:
//!
//! - integer parts compare by value;
//! - byte-string parts compare by length first, then bytewise;
//! - composite keys compare part by part in declared column order,
//!   short-circuiting on the first difference.
//!
//! Keys serialize into index-page nodes with a one-byte part count followed
//! by tagged parts, so a node's byte size is computable without touching the
//! tree.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::row::Row;
use crate::types::{ColumnDef, DataType, OwnedValue};

const PART_TAG_INT: u8 = 0x01;
const PART_TAG_BYTES: u8 = 0x02;

/// One component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    Int(i64),
    Bytes(Vec<u8>),
}

impl KeyPart {
    fn rank(&self) -> u8 {
        match self {
            KeyPart::Int(_) => 0,
            KeyPart::Bytes(_) => 1,
        }
    }

    fn serialized_size(&self) -> usize {
        match self {
            KeyPart::Int(_) => 1 + 8,
            KeyPart::Bytes(b) => 1 + 2 + b.len(),
        }
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Int(a), KeyPart::Int(b)) => a.cmp(b),
            (KeyPart::Bytes(a), KeyPart::Bytes(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            // Mixed parts only arise across indexes; order by tag for a
            // deterministic total order.
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An ordered composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    parts: SmallVec<[KeyPart; 2]>,
}

impl Key {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    pub fn from_int(value: i64) -> Self {
        Self::new([KeyPart::Int(value)])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Extracts the key of `row` over the declared key columns.
    pub fn from_row(row: &Row, columns: &[ColumnDef], key_columns: &[u16]) -> Result<Self> {
        let mut parts = SmallVec::new();
        for &col in key_columns {
            ensure!(
                (col as usize) < columns.len(),
                "key column {} out of range ({} columns)",
                col,
                columns.len()
            );
            ensure!(
                !row.is_null(col as usize),
                "key column {} is NULL",
                columns[col as usize].name()
            );
            ensure!(
                !row.is_lob(col as usize),
                "key column {} is stored out of row",
                columns[col as usize].name()
            );
            parts.push(part_from_value(
                &row.value(col as usize, columns)?,
                columns[col as usize].data_type(),
            )?);
        }
        Ok(Self { parts })
    }

    /// Builds a search key from bound values over the same key columns.
    pub fn from_values(
        values: &[OwnedValue],
        columns: &[ColumnDef],
        key_columns: &[u16],
    ) -> Result<Self> {
        ensure!(
            values.len() == key_columns.len(),
            "{} key values for {} key columns",
            values.len(),
            key_columns.len()
        );
        let mut parts = SmallVec::new();
        for (value, &col) in values.iter().zip(key_columns) {
            parts.push(part_from_value(value, columns[col as usize].data_type())?);
        }
        Ok(Self { parts })
    }

    pub fn serialized_size(&self) -> usize {
        1 + self.parts.iter().map(KeyPart::serialized_size).sum::<usize>()
    }

    pub fn serialize_to(&self, buf: &mut [u8], offset: &mut usize) -> Result<()> {
        ensure!(
            self.parts.len() <= u8::MAX as usize,
            "composite key with {} parts exceeds the part-count prefix",
            self.parts.len()
        );
        put(buf, offset, &[self.parts.len() as u8])?;
        for part in &self.parts {
            match part {
                KeyPart::Int(v) => {
                    put(buf, offset, &[PART_TAG_INT])?;
                    put(buf, offset, &v.to_le_bytes())?;
                }
                KeyPart::Bytes(b) => {
                    ensure!(
                        b.len() <= u16::MAX as usize,
                        "key part of {} bytes exceeds the length prefix",
                        b.len()
                    );
                    put(buf, offset, &[PART_TAG_BYTES])?;
                    put(buf, offset, &(b.len() as u16).to_le_bytes())?;
                    put(buf, offset, b)?;
                }
            }
        }
        Ok(())
    }

    pub fn deserialize_from(buf: &[u8], offset: &mut usize) -> Result<Self> {
        let count = take(buf, offset, 1)?[0] as usize;
        let mut parts = SmallVec::with_capacity(count);
        for _ in 0..count {
            let tag = take(buf, offset, 1)?[0];
            match tag {
                PART_TAG_INT => {
                    let bytes = take(buf, offset, 8)?;
                    parts.push(KeyPart::Int(i64::from_le_bytes(
                        bytes.try_into().expect("length checked"),
                    )));
                }
                PART_TAG_BYTES => {
                    let len = u16::from_le_bytes(
                        take(buf, offset, 2)?.try_into().expect("length checked"),
                    ) as usize;
                    parts.push(KeyPart::Bytes(take(buf, offset, len)?.to_vec()));
                }
                _ => bail!("unsupported key part tag: {:#04x}", tag),
            }
        }
        Ok(Self { parts })
    }

    /// Worst-case serialized size of a key over the given columns, used to
    /// derive the tree degree at open time.
    pub fn max_serialized_size(columns: &[ColumnDef], key_columns: &[u16]) -> usize {
        let mut size = 1;
        for &col in key_columns {
            let column = &columns[col as usize];
            size += match column.data_type() {
                DataType::Int | DataType::BigInt => 1 + 8,
                _ => 1 + 2 + column.declared_size() as usize,
            };
        }
        size
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(&other.parts) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn part_from_value(value: &OwnedValue, data_type: DataType) -> Result<KeyPart> {
    ensure!(
        data_type.is_orderable_key(),
        "{:?} columns cannot participate in an index key",
        data_type
    );
    Ok(match value {
        OwnedValue::Int(v) => KeyPart::Int(*v as i64),
        OwnedValue::BigInt(v) => KeyPart::Int(*v),
        OwnedValue::Text(v) => KeyPart::Bytes(v.as_bytes().to_vec()),
        OwnedValue::Bytes(v) => KeyPart::Bytes(v.clone()),
        other => bail!("value {:?} cannot form a key part", other),
    })
}

fn put(buf: &mut [u8], offset: &mut usize, bytes: &[u8]) -> Result<()> {
    ensure!(
        *offset + bytes.len() <= buf.len(),
        "key field of {} bytes does not fit at offset {}",
        bytes.len(),
        *offset
    );
    buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    *offset += bytes.len();
    Ok(())
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    ensure!(
        *offset + len <= buf.len(),
        "key field of {} bytes truncated at offset {}",
        len,
        *offset
    );
    let bytes = &buf[*offset..*offset + len];
    *offset += len;
    Ok(bytes)
}
