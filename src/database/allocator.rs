//! # Space Allocator
//!
//! Turns logical requests ("give this table an extent", "find room for
//! this row") into page ids, consulting and updating the GAM, IAM, and PFS
//! map pages. Every page's capacity state is reflected in exactly one PFS
//! entry, updated eagerly on each allocation, insert, and split; the
//! free-space category is an approximation and is always re-checked against
//! the page's exact `bytes_left` before a row is committed to it.
//!
//! ## Extent Allocation
//!
//! `allocate_new_extent` claims a free extent bit from the current GAM page
//! (creating the next GAM at its stride, and a freshly linked IAM page for
//! the new interval, when the current one is full), formats every usable
//! page of the extent to the requested kind, registers each in the PFS, and
//! marks the extent in the table's IAM. The table's first allocation also
//! creates its IAM chain head, which occupies the extent's first usable
//! page; callers get the first page after any leading system page.
//!
//! ## Claimed vs Unclaimed Pages
//!
//! Heap data pages and large-object pages are claimed (allocated bit set)
//! the moment their extent is formatted: the row and object placement scans
//! pick them by free-space category. Index pages and clustered data pages
//! are formatted unclaimed and claimed one at a time, because each belongs
//! exclusively to one tree structure once handed out.

use eyre::{bail, ensure, Result};
use tracing::debug;

use crate::btree::TreeSpace;
use crate::config::{GAM_PAGE_INTERVAL, PAGE_USABLE_SIZE, PFS_PAGE_INTERVAL};
use crate::database::Database;
use crate::row::{Row, RowLocator};
use crate::storage::alloc_page::{
    free_space_category, required_category, AllocationMapPage, ExtentMapPage, FreeSpacePage,
    PfsEntry, PfsKind,
};
use crate::storage::engine::StorageEngine;
use crate::storage::layout;
use crate::storage::lob_page::{DataObject, LobPage};
use crate::storage::page::Page;
use crate::storage::data_page::DataPage;
use crate::btree::IndexPage;
use crate::types::ColumnDef;

impl Database {
    /// The free-space map entry currently recorded for a page.
    pub fn pfs_entry(&self, page_id: u32) -> Result<PfsEntry> {
        let (pfs_page, entry) = layout::pfs_location(page_id);
        let guard = self.engine.system_page(pfs_page)?;
        guard.page().as_free_space()?.entry(entry)
    }

    pub(crate) fn set_pfs_entry(&self, page_id: u32, entry: PfsEntry) -> Result<()> {
        let (pfs_page, index) = layout::pfs_location(page_id);
        let mut guard = self.engine.system_page(pfs_page)?;
        guard.page_mut().as_free_space_mut()?.set_entry(index, entry)
    }

    /// Creates any free-space map pages between the current high-water mark
    /// and the one covering `page_id`. Each new map page registers itself as
    /// a system page in its own map.
    fn ensure_pfs_covers(&mut self, page_id: u32) -> Result<()> {
        let (needed, _) = layout::pfs_location(page_id);
        while self.catalog.last_pfs_page_id < needed {
            let next = self.catalog.last_pfs_page_id + PFS_PAGE_INTERVAL as u32;
            let mut page = FreeSpacePage::new(next);
            let (_, own_entry) = layout::pfs_location(next);
            page.set_entry(own_entry, PfsEntry::new(PfsKind::System, 0))?;
            self.engine.create_page(Page::FreeSpace(page))?;
            self.catalog.last_pfs_page_id = next;
            debug!(page_id = next, "free-space map page created");
        }
        Ok(())
    }

    /// Walks the IAM chain to the page covering `extent_id`.
    fn iam_for_extent(&self, table_idx: usize, extent_id: u32) -> Result<u32> {
        let mut iam_page_id = self.catalog.tables[table_idx].iam_page_id;
        let mut hops = 0;
        while iam_page_id != 0 {
            ensure!(hops < 1024, "IAM chain longer than 1024 pages; corrupt");
            let guard = self.engine.index_page(iam_page_id)?;
            let iam = guard.page().as_allocation_map()?;
            let first = iam.first_extent_id();
            if extent_id >= first && (extent_id - first) < crate::config::EXTENTS_PER_GAM as u32 {
                return Ok(iam_page_id);
            }
            iam_page_id = iam.next_iam_page_id();
            hops += 1;
        }
        bail!(
            "table {} has no IAM page covering extent {}",
            self.catalog.tables[table_idx].name,
            extent_id
        )
    }

    fn iam_chain_tail(&self, head: u32) -> Result<u32> {
        let mut iam_page_id = head;
        for _ in 0..1024 {
            let next = {
                let guard = self.engine.index_page(iam_page_id)?;
                guard.page().as_allocation_map()?.next_iam_page_id()
            };
            if next == 0 {
                return Ok(iam_page_id);
            }
            iam_page_id = next;
        }
        bail!("IAM chain longer than 1024 pages; corrupt")
    }

    /// Every extent the table owns, in IAM-chain order.
    pub fn owned_extents(&self, table_idx: usize) -> Result<Vec<u32>> {
        let mut extents = Vec::new();
        let mut iam_page_id = self.catalog.tables[table_idx].iam_page_id;
        let mut hops = 0;
        while iam_page_id != 0 {
            ensure!(hops < 1024, "IAM chain longer than 1024 pages; corrupt");
            let guard = self.engine.index_page(iam_page_id)?;
            let iam = guard.page().as_allocation_map()?;
            extents.extend(iam.owned_extents());
            iam_page_id = iam.next_iam_page_id();
            hops += 1;
        }
        Ok(extents)
    }

    /// Allocates one extent for the table and formats its usable pages to
    /// `kind`. Returns the first page usable for table contents.
    pub(crate) fn allocate_new_extent(
        &mut self,
        table_idx: usize,
        kind: PfsKind,
        claimed: bool,
    ) -> Result<u32> {
        ensure!(
            table_idx < self.catalog.tables.len(),
            "table index {} out of range ({} tables)",
            table_idx,
            self.catalog.tables.len()
        );
        ensure!(
            kind != PfsKind::System,
            "system pages are never allocated through extents"
        );

        // Pick the GAM with free bits, rolling to the next stride when full.
        let mut gam_page_id = self.catalog.last_gam_page_id;
        let gam_full = {
            let guard = self.engine.system_page(gam_page_id)?;
            guard.page().as_extent_map()?.is_full()
        };
        let mut new_gam_interval = false;
        if gam_full {
            let next = gam_page_id + GAM_PAGE_INTERVAL as u32;
            self.ensure_pfs_covers(next)?;
            self.engine
                .create_page(Page::ExtentMap(ExtentMapPage::new(next)))?;
            self.set_pfs_entry(next, PfsEntry::new(PfsKind::System, 0))?;
            self.catalog.last_gam_page_id = next;
            gam_page_id = next;
            new_gam_interval = true;
            debug!(page_id = next, "extent map page created");
        }

        let bit = {
            let mut guard = self.engine.system_page(gam_page_id)?;
            guard.page_mut().as_extent_map_mut()?.allocate_extent_bit()?
        };
        let extent_id = layout::gam_first_extent(gam_page_id) + bit as u32;
        let pages: Vec<u32> = layout::extent_pages(extent_id).collect();
        self.ensure_pfs_covers(*pages.last().expect("extents always hold usable pages"))?;
        debug!(extent_id, first_page = pages[0], ?kind, "extent allocated");

        // The first extent of a table hosts its IAM chain head; a fresh GAM
        // interval gets a new IAM page linked from the chain tail.
        let table_id = self.catalog.tables[table_idx].id;
        let mut first_usable = 0usize;
        if self.catalog.tables[table_idx].iam_page_id == 0 {
            let iam_page_id = pages[0];
            let iam =
                AllocationMapPage::new(iam_page_id, table_id, layout::gam_first_extent(gam_page_id));
            self.engine.create_page(Page::AllocationMap(iam))?;
            self.set_pfs_entry(iam_page_id, PfsEntry::new(PfsKind::System, 0))?;
            self.catalog.tables[table_idx].iam_page_id = iam_page_id;
            first_usable = 1;
        } else if new_gam_interval {
            let iam_page_id = pages[0];
            let iam =
                AllocationMapPage::new(iam_page_id, table_id, layout::gam_first_extent(gam_page_id));
            self.engine.create_page(Page::AllocationMap(iam))?;
            self.set_pfs_entry(iam_page_id, PfsEntry::new(PfsKind::System, 0))?;
            let tail = self.iam_chain_tail(self.catalog.tables[table_idx].iam_page_id)?;
            let mut guard = self.engine.index_page(tail)?;
            guard
                .page_mut()
                .as_allocation_map_mut()?
                .set_next_iam_page_id(iam_page_id);
            drop(guard);
            first_usable = 1;
        }

        for &page_id in &pages[first_usable..] {
            let page = match kind {
                PfsKind::Data => Page::Data(DataPage::new(page_id)),
                PfsKind::Index => Page::Index(IndexPage::new(page_id)),
                PfsKind::LargeObject => Page::Lob(LobPage::new(page_id)),
                PfsKind::System => unreachable!("rejected above"),
            };
            self.engine.create_page(page)?;
            self.set_pfs_entry(
                page_id,
                PfsEntry {
                    allocated: claimed,
                    kind,
                    category: free_space_category(PAGE_USABLE_SIZE),
                },
            )?;
        }

        let iam_page = self.iam_for_extent(table_idx, extent_id)?;
        let mut guard = self.engine.index_page(iam_page)?;
        guard
            .page_mut()
            .as_allocation_map_mut()?
            .mark_extent(extent_id)?;
        drop(guard);

        Ok(pages[first_usable])
    }

    /// Heap row placement: bucket the row, scan owned extents for a data
    /// page whose category promises room, re-check exactly, and insert. One
    /// fresh extent is allocated and retried if no page qualifies.
    pub(crate) fn insert_row_to_page(&mut self, table_idx: usize, row: Row) -> Result<RowLocator> {
        let size = row.total_size();
        ensure!(
            size <= PAGE_USABLE_SIZE,
            "row of {} bytes can never fit a page",
            size
        );
        let category = required_category(size);

        if let Some(page_id) = self.find_heap_page(table_idx, category, size)? {
            return self.append_row(table_idx, page_id, row);
        }
        debug!(
            table = self.catalog.tables[table_idx].name,
            "no heap page with room; allocating a new extent"
        );
        let first = self.allocate_new_extent(table_idx, PfsKind::Data, true)?;
        self.append_row(table_idx, first, row)
    }

    fn find_heap_page(
        &self,
        table_idx: usize,
        category: u8,
        size: usize,
    ) -> Result<Option<u32>> {
        let columns = self.catalog.tables[table_idx].columns.clone();
        for extent in self.owned_extents(table_idx)? {
            for page_id in layout::extent_pages(extent) {
                let entry = self.pfs_entry(page_id)?;
                if !entry.allocated || entry.kind != PfsKind::Data || entry.category < category {
                    continue;
                }
                let guard = self.engine.data_page(page_id, Some(&columns))?;
                if guard.page().as_data()?.bytes_left() >= size {
                    return Ok(Some(page_id));
                }
            }
        }
        Ok(None)
    }

    fn append_row(&mut self, table_idx: usize, page_id: u32, row: Row) -> Result<RowLocator> {
        let columns = self.catalog.tables[table_idx].columns.clone();
        let (slot, bytes_left) = {
            let mut guard = self.engine.data_page(page_id, Some(&columns))?;
            let page = guard.page_mut().as_data_mut()?;
            let slot = page.insert_row(row)?;
            (slot, page.bytes_left())
        };
        self.set_pfs_entry(
            page_id,
            PfsEntry::new(PfsKind::Data, free_space_category(bytes_left)),
        )?;
        Ok(RowLocator::new(page_id, slot))
    }

    /// First formatted-but-unclaimed page of `kind` in the table's extents.
    fn find_unclaimed_page(&self, table_idx: usize, kind: PfsKind) -> Result<Option<u32>> {
        for extent in self.owned_extents(table_idx)? {
            for page_id in layout::extent_pages(extent) {
                let entry = self.pfs_entry(page_id)?;
                if !entry.allocated && entry.kind == kind && entry.category != 0 {
                    return Ok(Some(page_id));
                }
            }
        }
        Ok(None)
    }

    fn claim_page(&self, page_id: u32, kind: PfsKind) -> Result<()> {
        self.set_pfs_entry(
            page_id,
            PfsEntry::new(kind, free_space_category(PAGE_USABLE_SIZE)),
        )
    }

    /// Chunks an oversized value across large-object records, written
    /// tail-first so every record knows its successor. Returns the chain
    /// head's address.
    pub(crate) fn store_lob(&mut self, table_idx: usize, bytes: &[u8]) -> Result<(u32, u16)> {
        ensure!(!bytes.is_empty(), "cannot store an empty large object");
        let mut next_page = 0u32;
        let mut next_index = 0u16;
        for chunk in bytes.chunks(crate::config::LOB_CHUNK_SIZE).rev() {
            let object = DataObject::new(chunk.to_vec(), next_page, next_index);
            let (page_id, index) = self.place_lob_object(table_idx, object)?;
            next_page = page_id;
            next_index = index;
        }
        Ok((next_page, next_index))
    }

    fn place_lob_object(&mut self, table_idx: usize, object: DataObject) -> Result<(u32, u16)> {
        let size = object.record_size();
        let category = required_category(size);
        for extent in self.owned_extents(table_idx)? {
            for page_id in layout::extent_pages(extent) {
                let entry = self.pfs_entry(page_id)?;
                if !entry.allocated
                    || entry.kind != PfsKind::LargeObject
                    || entry.category < category
                {
                    continue;
                }
                let fits = {
                    let guard = self.engine.data_page(page_id, None)?;
                    guard.page().as_lob()?.bytes_left() >= size
                };
                if fits {
                    return self.append_lob_object(page_id, object);
                }
            }
        }
        let first = self.allocate_new_extent(table_idx, PfsKind::LargeObject, true)?;
        self.append_lob_object(first, object)
    }

    fn append_lob_object(&mut self, page_id: u32, object: DataObject) -> Result<(u32, u16)> {
        let (index, bytes_left) = {
            let mut guard = self.engine.data_page(page_id, None)?;
            let page = guard.page_mut().as_lob_mut()?;
            let index = page.insert_object(object)?;
            (index, page.bytes_left())
        };
        self.set_pfs_entry(
            page_id,
            PfsEntry::new(PfsKind::LargeObject, free_space_category(bytes_left)),
        )?;
        Ok((page_id, index))
    }

    /// Reassembles an out-of-row value by walking its record chain until the
    /// terminal record (`next_page_id == 0`).
    pub fn read_lob(&self, mut page_id: u32, mut index: u16) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for _ in 0..100_000 {
            let (bytes, next_page, next_index) = {
                let guard = self.engine.data_page(page_id, None)?;
                let object = guard.page().as_lob()?.object(index)?;
                (
                    object.bytes().to_vec(),
                    object.next_page_id(),
                    object.next_object_index(),
                )
            };
            out.extend_from_slice(&bytes);
            if next_page == 0 {
                return Ok(out);
            }
            page_id = next_page;
            index = next_index;
        }
        bail!("large-object chain exceeds 100000 records; corrupt")
    }
}

/// Per-table space services handed to the B+Tree.
pub(crate) struct TableSpace<'d> {
    pub(crate) db: &'d mut Database,
    pub(crate) table_idx: usize,
}

impl TreeSpace for TableSpace<'_> {
    fn engine(&self) -> &StorageEngine {
        &self.db.engine
    }

    fn columns(&self) -> &[ColumnDef] {
        &self.db.catalog.tables[self.table_idx].columns
    }

    fn allocate_index_page(&mut self) -> Result<u32> {
        if let Some(page_id) = self.db.find_unclaimed_page(self.table_idx, PfsKind::Index)? {
            self.db.claim_page(page_id, PfsKind::Index)?;
            return Ok(page_id);
        }
        let first = self
            .db
            .allocate_new_extent(self.table_idx, PfsKind::Index, false)?;
        self.db.claim_page(first, PfsKind::Index)?;
        Ok(first)
    }

    fn find_index_page_with_room(&mut self, bytes: usize) -> Result<Option<u32>> {
        let category = required_category(bytes);
        for extent in self.db.owned_extents(self.table_idx)? {
            for page_id in layout::extent_pages(extent) {
                let entry = self.db.pfs_entry(page_id)?;
                if !entry.allocated || entry.kind != PfsKind::Index || entry.category < category {
                    continue;
                }
                let guard = self.db.engine.index_page(page_id)?;
                if guard.page().as_index()?.bytes_left() >= bytes {
                    return Ok(Some(page_id));
                }
            }
        }
        Ok(None)
    }

    fn allocate_data_page(&mut self) -> Result<u32> {
        if let Some(page_id) = self.db.find_unclaimed_page(self.table_idx, PfsKind::Data)? {
            self.db.claim_page(page_id, PfsKind::Data)?;
            return Ok(page_id);
        }
        let first = self
            .db
            .allocate_new_extent(self.table_idx, PfsKind::Data, false)?;
        self.db.claim_page(first, PfsKind::Data)?;
        Ok(first)
    }

    fn occupancy_changed(&mut self, page_id: u32, bytes_left: usize, kind: PfsKind) -> Result<()> {
        self.db
            .set_pfs_entry(page_id, PfsEntry::new(kind, free_space_category(bytes_left)))
    }

    fn root_page_moved(&mut self, index_id: u32, new_page_id: u32) -> Result<()> {
        let table = &mut self.db.catalog.tables[self.table_idx];
        if index_id == 0 {
            if let Some(clustered) = &mut table.clustered {
                clustered.root_page_id = new_page_id;
                return Ok(());
            }
            bail!("clustered root moved on a table without a clustered index");
        }
        for meta in &mut table.secondary {
            if meta.index_id == index_id {
                meta.root_page_id = new_page_id;
                return Ok(());
            }
        }
        bail!(
            "root of unknown index {} moved in table {}",
            index_id,
            table.name
        )
    }
}
