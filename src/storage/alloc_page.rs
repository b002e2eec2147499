//! # Allocation Map Pages
//!
//! Three page kinds track where space lives:
//!
//! - **Free-space (PFS) pages** carry one packed byte per tracked page:
//!   an allocated flag, a 2-bit page-type tag, and a 5-bit free-space
//!   category drawn from a fixed 9-bucket occupancy table. Every page in the
//!   file has exactly one PFS entry, updated on every occupancy change;
//!   this is the central cross-page invariant the allocator preserves.
//! - **Extent-allocation (GAM) pages** carry one bit per extent,
//!   database-wide: set = the extent is owned by some table.
//! - **Index-allocation (IAM) pages** carry one bit per extent, scoped to a
//!   single table, plus a chain link to the table's next IAM page covering
//!   the next GAM interval.
//!
//! ## PFS Entry Packing
//!
//! ```text
//! Bit   7          6..5        4..0
//!       allocated  type tag    free-space category (0-31)
//! ```
//!
//! Type tags: 0 = data, 1 = index, 2 = large object, 3 = system.

use eyre::{bail, ensure, Result};

use crate::bitmap::ByteMap;
use crate::config::{
    EXTENTS_PER_GAM, EXTENT_MAP_BYTES, FREE_SPACE_BUCKETS, PAGE_HEADER_SIZE, PAGE_USABLE_SIZE,
    PFS_PAGE_INTERVAL,
};
use crate::storage::page::{PageHeader, PageKind};

/// Page-type tag inside a PFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfsKind {
    Data = 0,
    Index = 1,
    LargeObject = 2,
    System = 3,
}

impl PfsKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => PfsKind::Data,
            1 => PfsKind::Index,
            2 => PfsKind::LargeObject,
            _ => PfsKind::System,
        }
    }
}

/// One unpacked PFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfsEntry {
    pub allocated: bool,
    pub kind: PfsKind,
    pub category: u8,
}

impl PfsEntry {
    pub fn unallocated() -> Self {
        Self {
            allocated: false,
            kind: PfsKind::Data,
            category: 0,
        }
    }

    pub fn new(kind: PfsKind, category: u8) -> Self {
        Self {
            allocated: true,
            kind,
            category,
        }
    }

    pub fn pack(self) -> u8 {
        ((self.allocated as u8) << 7) | ((self.kind as u8) << 5) | (self.category & 0b1_1111)
    }

    pub fn unpack(byte: u8) -> Self {
        Self {
            allocated: byte & 0x80 != 0,
            kind: PfsKind::from_bits(byte >> 5),
            category: byte & 0b1_1111,
        }
    }
}

/// Free-space bucket for a page with `bytes_left` of usable space remaining:
/// the highest bucket whose free-percentage lower bound the page still meets.
pub fn free_space_category(bytes_left: usize) -> u8 {
    let percent = bytes_left * 100 / PAGE_USABLE_SIZE;
    FREE_SPACE_BUCKETS
        .iter()
        .rposition(|&bound| percent >= bound as usize)
        .unwrap_or(0) as u8
}

/// Smallest bucket that guarantees room for `bytes`. Requests larger than
/// the top bucket's guarantee map to the top bucket; the allocator re-checks
/// the exact `bytes_left` before committing to a page either way.
pub fn required_category(bytes: usize) -> u8 {
    FREE_SPACE_BUCKETS
        .iter()
        .position(|&bound| bound as usize * PAGE_USABLE_SIZE / 100 >= bytes)
        .unwrap_or(FREE_SPACE_BUCKETS.len() - 1) as u8
}

/// PFS page: one packed entry per page of its interval.
#[derive(Debug, Clone)]
pub struct FreeSpacePage {
    header: PageHeader,
    entries: ByteMap,
}

impl FreeSpacePage {
    pub fn new(page_id: u32) -> Self {
        let mut header = PageHeader::new(page_id, PageKind::FreeSpaceMap);
        header.set_bytes_left(0);
        Self {
            header,
            entries: ByteMap::zeroed(PFS_PAGE_INTERVAL),
        }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> u32 {
        self.header.page_id()
    }

    pub fn entry(&self, index: usize) -> Result<PfsEntry> {
        ensure!(
            index < PFS_PAGE_INTERVAL,
            "PFS entry index {} out of range ({} tracked pages)",
            index,
            PFS_PAGE_INTERVAL
        );
        Ok(PfsEntry::unpack(self.entries.get_byte(index)))
    }

    pub fn set_entry(&mut self, index: usize, entry: PfsEntry) -> Result<()> {
        ensure!(
            index < PFS_PAGE_INTERVAL,
            "PFS entry index {} out of range ({} tracked pages)",
            index,
            PFS_PAGE_INTERVAL
        );
        let was = PfsEntry::unpack(self.entries.get_byte(index));
        self.entries.set_byte(index, entry.pack());
        let count = self.header.item_count();
        match (was.allocated, entry.allocated) {
            (false, true) => self.header.set_item_count(count + 1),
            (true, false) => self.header.set_item_count(count - 1),
            _ => {}
        }
        Ok(())
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        self.entries.serialize_to(buf, &mut offset)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::FreeSpaceMap,
            "page {} is {:?}, expected FreeSpaceMap",
            header.page_id(),
            header.kind()
        );
        let mut offset = PAGE_HEADER_SIZE;
        let entries = ByteMap::deserialize_from(buf, &mut offset, PFS_PAGE_INTERVAL)?;
        Ok(Self { header, entries })
    }
}

/// GAM page: database-wide extent allocation bitmap.
#[derive(Debug, Clone)]
pub struct ExtentMapPage {
    header: PageHeader,
    extents: ByteMap,
}

impl ExtentMapPage {
    pub fn new(page_id: u32) -> Self {
        let mut header = PageHeader::new(page_id, PageKind::ExtentMap);
        header.set_bytes_left(0);
        Self {
            header,
            extents: ByteMap::zeroed(EXTENT_MAP_BYTES),
        }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> u32 {
        self.header.page_id()
    }

    pub fn allocated_count(&self) -> usize {
        self.header.item_count() as usize
    }

    pub fn is_full(&self) -> bool {
        self.allocated_count() >= EXTENTS_PER_GAM
    }

    pub fn is_extent_allocated(&self, bit: usize) -> Result<bool> {
        ensure!(
            bit < EXTENTS_PER_GAM,
            "extent bit {} out of range ({} tracked extents)",
            bit,
            EXTENTS_PER_GAM
        );
        Ok(self.extents.get(bit))
    }

    /// Claims the first free extent bit, or fails when the map is full; the
    /// caller then moves on to the next GAM page.
    pub fn allocate_extent_bit(&mut self) -> Result<usize> {
        let Some(bit) = self.extents.first_clear_bit(EXTENTS_PER_GAM) else {
            bail!("extent map page {} is full", self.page_id());
        };
        self.extents.set(bit, true);
        self.header.set_item_count(self.header.item_count() + 1);
        Ok(bit)
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        self.extents.serialize_to(buf, &mut offset)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::ExtentMap,
            "page {} is {:?}, expected ExtentMap",
            header.page_id(),
            header.kind()
        );
        let mut offset = PAGE_HEADER_SIZE;
        let extents = ByteMap::deserialize_from(buf, &mut offset, EXTENT_MAP_BYTES)?;
        Ok(Self { header, extents })
    }
}

/// IAM page: one table's owned extents within one GAM interval.
#[derive(Debug, Clone)]
pub struct AllocationMapPage {
    header: PageHeader,
    table_id: u32,
    first_extent_id: u32,
    next_iam_page_id: u32,
    extents: ByteMap,
}

impl AllocationMapPage {
    pub fn new(page_id: u32, table_id: u32, first_extent_id: u32) -> Self {
        let mut header = PageHeader::new(page_id, PageKind::AllocationMap);
        header.set_bytes_left(0);
        Self {
            header,
            table_id,
            first_extent_id,
            next_iam_page_id: 0,
            extents: ByteMap::zeroed(EXTENT_MAP_BYTES),
        }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> u32 {
        self.header.page_id()
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn first_extent_id(&self) -> u32 {
        self.first_extent_id
    }

    pub fn next_iam_page_id(&self) -> u32 {
        self.next_iam_page_id
    }

    pub fn set_next_iam_page_id(&mut self, page_id: u32) {
        self.next_iam_page_id = page_id;
    }

    fn relative_bit(&self, extent_id: u32) -> Result<usize> {
        let bit = extent_id
            .checked_sub(self.first_extent_id)
            .map(|b| b as usize);
        match bit {
            Some(bit) if bit < EXTENTS_PER_GAM => Ok(bit),
            _ => bail!(
                "extent {} is outside IAM page {} (covers {}..{})",
                extent_id,
                self.page_id(),
                self.first_extent_id,
                self.first_extent_id as usize + EXTENTS_PER_GAM
            ),
        }
    }

    pub fn owns_extent(&self, extent_id: u32) -> Result<bool> {
        Ok(self.extents.get(self.relative_bit(extent_id)?))
    }

    pub fn mark_extent(&mut self, extent_id: u32) -> Result<()> {
        let bit = self.relative_bit(extent_id)?;
        if !self.extents.get(bit) {
            self.extents.set(bit, true);
            self.header.set_item_count(self.header.item_count() + 1);
        }
        Ok(())
    }

    /// Absolute ids of every extent this page marks as owned.
    pub fn owned_extents(&self) -> Vec<u32> {
        (0..EXTENTS_PER_GAM)
            .filter(|&bit| self.extents.get(bit))
            .map(|bit| self.first_extent_id + bit as u32)
            .collect()
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        buf[offset..offset + 4].copy_from_slice(&self.table_id.to_le_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&self.first_extent_id.to_le_bytes());
        buf[offset + 8..offset + 12].copy_from_slice(&self.next_iam_page_id.to_le_bytes());
        offset += 12;
        self.extents.serialize_to(buf, &mut offset)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::AllocationMap,
            "page {} is {:?}, expected AllocationMap",
            header.page_id(),
            header.kind()
        );
        let mut offset = PAGE_HEADER_SIZE;
        let table_id =
            u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("length checked"));
        let first_extent_id =
            u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().expect("length checked"));
        let next_iam_page_id =
            u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().expect("length checked"));
        offset += 12;
        let extents = ByteMap::deserialize_from(buf, &mut offset, EXTENT_MAP_BYTES)?;
        Ok(Self {
            header,
            table_id,
            first_extent_id,
            next_iam_page_id,
            extents,
        })
    }
}
