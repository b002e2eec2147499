//! # Catalog Page
//!
//! Page 0 persists the database catalog: the database name, allocation
//! high-water marks, and the full definition of every table. The in-memory
//! [`Catalog`] is the working copy; this page is rewritten on flush and
//! parsed once on open.
//!
//! ## Body Layout (after the 16-byte page header)
//!
//! ```text
//! magic (8) | version (2) | name (2+n) | table_count (2)
//! last_table_id (4) | last_pfs_page_id (4) | last_gam_page_id (4)
//! per table:
//!   table_id (4) | name (2+n) | iam_page_id (4) | max_row_size (2)
//!   column_count (2) | clustered_root_page_id (4)
//!   nullability bitmap (ceil(cols/8))
//!   clustered column list (2 + 2*k)
//!   secondary index count (2), per index:
//!     index_id (4) | root_page_id (4) | column list (2 + 2*k)
//!   per column:
//!     name (2+n) | type literal (2+n) | declared size (2) | type tag (1)
//!     | column index (2)
//! ```
//!
//! All strings are length-prefixed UTF-8; all integers little-endian.

use eyre::{bail, ensure, Result};

use crate::bitmap::ByteMap;
use crate::config::{CATALOG_PAGE_ID, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::database::table::{Catalog, IndexMeta, Table};
use crate::storage::page::{PageHeader, PageKind};
use crate::types::{ColumnDef, DataType};

pub const CATALOG_MAGIC: &[u8; 8] = b"ExtDB\x00v1";
pub const CATALOG_VERSION: u16 = 1;

#[derive(Debug, Clone)]
pub struct CatalogPage {
    header: PageHeader,
    catalog: Catalog,
}

impl CatalogPage {
    pub fn new(catalog: Catalog) -> Self {
        let mut header = PageHeader::new(CATALOG_PAGE_ID, PageKind::Metadata);
        header.set_bytes_left(0);
        Self { header, catalog }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn replace_catalog(&mut self, catalog: Catalog) {
        self.catalog = catalog;
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;

        put_bytes(buf, &mut offset, CATALOG_MAGIC.as_slice())?;
        put_u16(buf, &mut offset, CATALOG_VERSION)?;
        put_str(buf, &mut offset, &self.catalog.name)?;
        put_u16(buf, &mut offset, self.catalog.tables.len() as u16)?;
        put_u32(buf, &mut offset, self.catalog.last_table_id)?;
        put_u32(buf, &mut offset, self.catalog.last_pfs_page_id)?;
        put_u32(buf, &mut offset, self.catalog.last_gam_page_id)?;

        for table in &self.catalog.tables {
            put_u32(buf, &mut offset, table.id)?;
            put_str(buf, &mut offset, &table.name)?;
            put_u32(buf, &mut offset, table.iam_page_id)?;
            put_u16(buf, &mut offset, table.max_row_size)?;
            put_u16(buf, &mut offset, table.columns.len() as u16)?;
            put_u32(
                buf,
                &mut offset,
                table.clustered.as_ref().map_or(0, |m| m.root_page_id),
            )?;

            let mut nullable = ByteMap::with_bit_capacity(table.columns.len());
            for column in &table.columns {
                nullable.set(column.index() as usize, column.nullable());
            }
            nullable.serialize_to(buf, &mut offset)?;

            let clustered_cols = table
                .clustered
                .as_ref()
                .map_or(&[] as &[u16], |m| &m.key_columns);
            put_column_list(buf, &mut offset, clustered_cols)?;

            put_u16(buf, &mut offset, table.secondary.len() as u16)?;
            for index in &table.secondary {
                put_u32(buf, &mut offset, index.index_id)?;
                put_u32(buf, &mut offset, index.root_page_id)?;
                put_column_list(buf, &mut offset, &index.key_columns)?;
            }

            for column in &table.columns {
                put_str(buf, &mut offset, column.name())?;
                put_str(buf, &mut offset, column.data_type().literal())?;
                put_u16(buf, &mut offset, column.declared_size())?;
                put_u8(buf, &mut offset, column.data_type().tag())?;
                put_u16(buf, &mut offset, column.index())?;
            }
        }

        ensure!(
            offset <= PAGE_SIZE,
            "catalog of {} bytes overflows the catalog page",
            offset
        );
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::Metadata,
            "page {} is {:?}, expected Metadata",
            header.page_id(),
            header.kind()
        );

        let mut offset = PAGE_HEADER_SIZE;
        let magic = get_bytes(buf, &mut offset, CATALOG_MAGIC.len())?;
        ensure!(magic == CATALOG_MAGIC, "invalid magic bytes in catalog page");
        let version = get_u16(buf, &mut offset)?;
        ensure!(
            version == CATALOG_VERSION,
            "unsupported catalog version: {} (expected {})",
            version,
            CATALOG_VERSION
        );

        let name = get_str(buf, &mut offset)?;
        let table_count = get_u16(buf, &mut offset)? as usize;
        let last_table_id = get_u32(buf, &mut offset)?;
        let last_pfs_page_id = get_u32(buf, &mut offset)?;
        let last_gam_page_id = get_u32(buf, &mut offset)?;

        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            let id = get_u32(buf, &mut offset)?;
            let table_name = get_str(buf, &mut offset)?;
            let iam_page_id = get_u32(buf, &mut offset)?;
            let max_row_size = get_u16(buf, &mut offset)?;
            let column_count = get_u16(buf, &mut offset)? as usize;
            let clustered_root = get_u32(buf, &mut offset)?;

            let nullable = ByteMap::deserialize_from(buf, &mut offset, column_count.div_ceil(8))?;
            let clustered_cols = get_column_list(buf, &mut offset)?;

            let secondary_count = get_u16(buf, &mut offset)? as usize;
            let mut secondary = Vec::with_capacity(secondary_count);
            for _ in 0..secondary_count {
                let index_id = get_u32(buf, &mut offset)?;
                let root_page_id = get_u32(buf, &mut offset)?;
                let key_columns = get_column_list(buf, &mut offset)?;
                secondary.push(IndexMeta {
                    index_id,
                    root_page_id,
                    key_columns,
                });
            }

            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let col_name = get_str(buf, &mut offset)?;
                let literal = get_str(buf, &mut offset)?;
                let declared_size = get_u16(buf, &mut offset)?;
                let tag = get_u8(buf, &mut offset)?;
                let index = get_u16(buf, &mut offset)?;

                let data_type = DataType::from_tag(tag)?;
                ensure!(
                    data_type == DataType::from_literal(&literal)?,
                    "column {} type tag {:#04x} disagrees with literal {}",
                    col_name,
                    tag,
                    literal
                );
                columns.push(ColumnDef::from_parts(
                    col_name,
                    data_type,
                    declared_size,
                    index,
                    nullable.get(index as usize),
                ));
            }

            let clustered = if clustered_root != 0 || !clustered_cols.is_empty() {
                Some(IndexMeta {
                    index_id: 0,
                    root_page_id: clustered_root,
                    key_columns: clustered_cols,
                })
            } else {
                None
            };

            tables.push(Table {
                id,
                name: table_name,
                columns,
                iam_page_id,
                max_row_size,
                clustered,
                secondary,
            });
        }

        Ok(Self {
            header,
            catalog: Catalog {
                name,
                last_table_id,
                last_pfs_page_id,
                last_gam_page_id,
                tables,
            },
        })
    }
}

fn put_bytes(buf: &mut [u8], offset: &mut usize, bytes: &[u8]) -> Result<()> {
    ensure!(
        *offset + bytes.len() <= buf.len(),
        "catalog field of {} bytes does not fit at offset {}",
        bytes.len(),
        *offset
    );
    buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    *offset += bytes.len();
    Ok(())
}

fn put_u8(buf: &mut [u8], offset: &mut usize, value: u8) -> Result<()> {
    put_bytes(buf, offset, &[value])
}

fn put_u16(buf: &mut [u8], offset: &mut usize, value: u16) -> Result<()> {
    put_bytes(buf, offset, &value.to_le_bytes())
}

fn put_u32(buf: &mut [u8], offset: &mut usize, value: u32) -> Result<()> {
    put_bytes(buf, offset, &value.to_le_bytes())
}

fn put_str(buf: &mut [u8], offset: &mut usize, value: &str) -> Result<()> {
    ensure!(
        value.len() <= u16::MAX as usize,
        "catalog string of {} bytes exceeds the length prefix",
        value.len()
    );
    put_u16(buf, offset, value.len() as u16)?;
    put_bytes(buf, offset, value.as_bytes())
}

fn put_column_list(buf: &mut [u8], offset: &mut usize, columns: &[u16]) -> Result<()> {
    put_u16(buf, offset, columns.len() as u16)?;
    for &column in columns {
        put_u16(buf, offset, column)?;
    }
    Ok(())
}

fn get_bytes<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    ensure!(
        *offset + len <= buf.len(),
        "catalog field of {} bytes truncated at offset {}",
        len,
        *offset
    );
    let bytes = &buf[*offset..*offset + len];
    *offset += len;
    Ok(bytes)
}

fn get_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    Ok(get_bytes(buf, offset, 1)?[0])
}

fn get_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(
        get_bytes(buf, offset, 2)?.try_into().expect("length checked"),
    ))
}

fn get_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(
        get_bytes(buf, offset, 4)?.try_into().expect("length checked"),
    ))
}

fn get_str(buf: &[u8], offset: &mut usize) -> Result<String> {
    let len = get_u16(buf, offset)? as usize;
    let bytes = get_bytes(buf, offset, len)?;
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => bail!("catalog string is not valid UTF-8"),
    }
}

fn get_column_list(buf: &[u8], offset: &mut usize) -> Result<Vec<u16>> {
    let count = get_u16(buf, offset)? as usize;
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        columns.push(get_u16(buf, offset)?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FIRST_GAM_PAGE_ID, FIRST_PFS_PAGE_ID};

    fn sample_catalog() -> Catalog {
        let columns = vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::varchar("title", 80, 1),
            ColumnDef::new("flag", DataType::Bool, 2),
        ];
        let table = Table {
            id: 1,
            name: "books".into(),
            columns,
            iam_page_id: 3,
            max_row_size: 120,
            clustered: Some(IndexMeta {
                index_id: 0,
                root_page_id: 4,
                key_columns: vec![0],
            }),
            secondary: vec![IndexMeta {
                index_id: 2,
                root_page_id: 5,
                key_columns: vec![1, 2],
            }],
        };
        Catalog {
            name: "library".into(),
            last_table_id: 1,
            last_pfs_page_id: FIRST_PFS_PAGE_ID,
            last_gam_page_id: FIRST_GAM_PAGE_ID,
            tables: vec![table],
        }
    }

    #[test]
    fn catalog_round_trip() {
        let page = CatalogPage::new(sample_catalog());
        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize_into(&mut buf).unwrap();

        let parsed = CatalogPage::deserialize(&buf).unwrap();
        let catalog = parsed.catalog();

        assert_eq!(catalog.name, "library");
        assert_eq!(catalog.last_table_id, 1);
        assert_eq!(catalog.tables.len(), 1);

        let table = &catalog.tables[0];
        assert_eq!(table.name, "books");
        assert_eq!(table.iam_page_id, 3);
        assert_eq!(table.max_row_size, 120);
        assert_eq!(table.columns.len(), 3);
        assert!(!table.columns[0].nullable());
        assert!(table.columns[1].nullable());

        let clustered = table.clustered.as_ref().unwrap();
        assert_eq!(clustered.root_page_id, 4);
        assert_eq!(clustered.key_columns, vec![0]);

        assert_eq!(table.secondary.len(), 1);
        assert_eq!(table.secondary[0].index_id, 2);
        assert_eq!(table.secondary[0].key_columns, vec![1, 2]);
    }

    #[test]
    fn empty_catalog_round_trip() {
        let catalog = Catalog::new("fresh");
        let page = CatalogPage::new(catalog);
        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize_into(&mut buf).unwrap();

        let parsed = CatalogPage::deserialize(&buf).unwrap();
        assert_eq!(parsed.catalog().name, "fresh");
        assert!(parsed.catalog().tables.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let page = CatalogPage::new(Catalog::new("x"));
        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize_into(&mut buf).unwrap();
        buf[PAGE_HEADER_SIZE] = b'?';

        assert!(CatalogPage::deserialize(&buf).is_err());
    }
}
