//! # Page Header and Typed Page Dispatch
//!
//! Every 8KB page begins with a 16-byte header containing the page's id,
//! occupancy, and kind tag. The header is a zerocopy struct read directly
//! from page buffers.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       4     page_id      File-relative page number
//! 4       2     item_count   Rows, nodes, or objects held by the page
//! 6       2     bytes_left   Remaining usable capacity in bytes
//! 8       1     kind         Page kind tag (see PageKind)
//! 9       7     reserved     Reserved, written as zero
//! ```
//!
//! ## Page Kinds
//!
//! - **Data** (0x01): serialized rows of one table
//! - **Index** (0x02): serialized B+Tree nodes
//! - **LargeObject** (0x03): chained out-of-row value records
//! - **Metadata** (0x04): the catalog page (page 0)
//! - **FreeSpaceMap** (0x05): packed per-page allocation/type/category entries
//! - **ExtentMap** (0x06): database-wide extent allocation bitmap
//! - **AllocationMap** (0x07): one table's owned-extent bitmap chain
//!
//! The [`Page`] enum is the cache's unit of ownership: a cache slot holds
//! exactly one deserialized page, and eviction serializes it back through
//! the same byte-exact contract. Deserialization dispatches on the kind tag
//! with an exhaustive `match`, so an unhandled kind cannot slip through.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::IndexPage;
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE};
use crate::storage::alloc_page::{AllocationMapPage, ExtentMapPage, FreeSpacePage};
use crate::storage::catalog_page::CatalogPage;
use crate::storage::data_page::DataPage;
use crate::storage::lob_page::LobPage;
use crate::types::ColumnDef;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Unknown = 0x00,
    Data = 0x01,
    Index = 0x02,
    LargeObject = 0x03,
    Metadata = 0x04,
    FreeSpaceMap = 0x05,
    ExtentMap = 0x06,
    AllocationMap = 0x07,
}

impl PageKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageKind::Data,
            0x02 => PageKind::Index,
            0x03 => PageKind::LargeObject,
            0x04 => PageKind::Metadata,
            0x05 => PageKind::FreeSpaceMap,
            0x06 => PageKind::ExtentMap,
            0x07 => PageKind::AllocationMap,
            _ => PageKind::Unknown,
        }
    }

    /// Kinds held by the system cache pool rather than the data pool.
    pub fn is_system(self) -> bool {
        match self {
            PageKind::Data | PageKind::LargeObject => false,
            PageKind::Index
            | PageKind::Metadata
            | PageKind::FreeSpaceMap
            | PageKind::ExtentMap
            | PageKind::AllocationMap => true,
            PageKind::Unknown => false,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_id: U32,
    item_count: U16,
    bytes_left: U16,
    kind: u8,
    reserved: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_id: u32, kind: PageKind) -> Self {
        Self {
            page_id: U32::new(page_id),
            item_count: U16::new(0),
            bytes_left: U16::new(PAGE_USABLE_SIZE as u16),
            kind: kind as u8,
            reserved: [0; 7],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    crate::zerocopy_accessors! {
        page_id: u32,
        item_count: u16,
        bytes_left: u16,
    }

    pub fn kind(&self) -> PageKind {
        PageKind::from_byte(self.kind)
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.kind = kind as u8;
    }
}

/// One deserialized page, owned by a cache slot.
#[derive(Debug, Clone)]
pub enum Page {
    Data(DataPage),
    Index(IndexPage),
    Lob(LobPage),
    Catalog(CatalogPage),
    FreeSpace(FreeSpacePage),
    ExtentMap(ExtentMapPage),
    AllocationMap(AllocationMapPage),
}

impl Page {
    pub fn header(&self) -> &PageHeader {
        match self {
            Page::Data(p) => p.header(),
            Page::Index(p) => p.header(),
            Page::Lob(p) => p.header(),
            Page::Catalog(p) => p.header(),
            Page::FreeSpace(p) => p.header(),
            Page::ExtentMap(p) => p.header(),
            Page::AllocationMap(p) => p.header(),
        }
    }

    pub fn page_id(&self) -> u32 {
        self.header().page_id()
    }

    pub fn kind(&self) -> PageKind {
        self.header().kind()
    }

    /// Pool routing: system pages and data pages never share cache slots.
    pub fn is_system(&self) -> bool {
        self.kind().is_system()
    }

    /// Serializes the page into a full `PAGE_SIZE` buffer, byte-exact with
    /// what `deserialize` accepts.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == PAGE_SIZE,
            "page buffer must be {} bytes, got {}",
            PAGE_SIZE,
            buf.len()
        );
        match self {
            Page::Data(p) => p.serialize_into(buf),
            Page::Index(p) => p.serialize_into(buf),
            Page::Lob(p) => p.serialize_into(buf),
            Page::Catalog(p) => p.serialize_into(buf),
            Page::FreeSpace(p) => p.serialize_into(buf),
            Page::ExtentMap(p) => p.serialize_into(buf),
            Page::AllocationMap(p) => p.serialize_into(buf),
        }
    }

    /// Deserializes a page buffer by its kind tag. Returns `None` for a
    /// zeroed buffer, which is how a never-written region of the file reads.
    /// Data pages require the owning table's columns.
    pub fn deserialize(buf: &[u8], columns: Option<&[ColumnDef]>) -> Result<Option<Page>> {
        ensure!(
            buf.len() == PAGE_SIZE,
            "page buffer must be {} bytes, got {}",
            PAGE_SIZE,
            buf.len()
        );

        let header = PageHeader::from_bytes(buf)?;
        Ok(Some(match header.kind() {
            PageKind::Unknown => return Ok(None),
            PageKind::Data => {
                let Some(columns) = columns else {
                    bail!(
                        "data page {} cannot be deserialized without its table's columns",
                        header.page_id()
                    );
                };
                Page::Data(DataPage::deserialize(buf, columns)?)
            }
            PageKind::Index => Page::Index(IndexPage::deserialize(buf)?),
            PageKind::LargeObject => Page::Lob(LobPage::deserialize(buf)?),
            PageKind::Metadata => Page::Catalog(CatalogPage::deserialize(buf)?),
            PageKind::FreeSpaceMap => Page::FreeSpace(FreeSpacePage::deserialize(buf)?),
            PageKind::ExtentMap => Page::ExtentMap(ExtentMapPage::deserialize(buf)?),
            PageKind::AllocationMap => Page::AllocationMap(AllocationMapPage::deserialize(buf)?),
        }))
    }

    pub fn as_data(&self) -> Result<&DataPage> {
        match self {
            Page::Data(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a data page", other.page_id(), other.kind()),
        }
    }

    pub fn as_data_mut(&mut self) -> Result<&mut DataPage> {
        match self {
            Page::Data(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a data page", other.page_id(), other.kind()),
        }
    }

    pub fn as_index(&self) -> Result<&IndexPage> {
        match self {
            Page::Index(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an index page", other.page_id(), other.kind()),
        }
    }

    pub fn as_index_mut(&mut self) -> Result<&mut IndexPage> {
        match self {
            Page::Index(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an index page", other.page_id(), other.kind()),
        }
    }

    pub fn as_lob(&self) -> Result<&LobPage> {
        match self {
            Page::Lob(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a large-object page", other.page_id(), other.kind()),
        }
    }

    pub fn as_lob_mut(&mut self) -> Result<&mut LobPage> {
        match self {
            Page::Lob(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a large-object page", other.page_id(), other.kind()),
        }
    }

    pub fn as_catalog(&self) -> Result<&CatalogPage> {
        match self {
            Page::Catalog(p) => Ok(p),
            other => bail!("page {} is {:?}, expected the catalog page", other.page_id(), other.kind()),
        }
    }

    pub fn as_catalog_mut(&mut self) -> Result<&mut CatalogPage> {
        match self {
            Page::Catalog(p) => Ok(p),
            other => bail!("page {} is {:?}, expected the catalog page", other.page_id(), other.kind()),
        }
    }

    pub fn as_free_space(&self) -> Result<&FreeSpacePage> {
        match self {
            Page::FreeSpace(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a free-space page", other.page_id(), other.kind()),
        }
    }

    pub fn as_free_space_mut(&mut self) -> Result<&mut FreeSpacePage> {
        match self {
            Page::FreeSpace(p) => Ok(p),
            other => bail!("page {} is {:?}, expected a free-space page", other.page_id(), other.kind()),
        }
    }

    pub fn as_extent_map(&self) -> Result<&ExtentMapPage> {
        match self {
            Page::ExtentMap(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an extent map page", other.page_id(), other.kind()),
        }
    }

    pub fn as_extent_map_mut(&mut self) -> Result<&mut ExtentMapPage> {
        match self {
            Page::ExtentMap(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an extent map page", other.page_id(), other.kind()),
        }
    }

    pub fn as_allocation_map(&self) -> Result<&AllocationMapPage> {
        match self {
            Page::AllocationMap(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an allocation map page", other.page_id(), other.kind()),
        }
    }

    pub fn as_allocation_map_mut(&mut self) -> Result<&mut AllocationMapPage> {
        match self {
            Page::AllocationMap(p) => Ok(p),
            other => bail!("page {} is {:?}, expected an allocation map page", other.page_id(), other.kind()),
        }
    }
}
