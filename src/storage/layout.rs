//! # File Layout Arithmetic
//!
//! Pure functions mapping page ids to file offsets, extents, and the map
//! pages that track them. All strides are fixed at compile time, so every
//! question of the form "which PFS page covers page 9000?" is arithmetic,
//! never a lookup.
//!
//! Reserved system pages sit at fixed strides: the catalog at page 0, a
//! free-space (PFS) page at 1 and every `PFS_PAGE_INTERVAL` pages, an
//! extent-allocation (GAM) page at 2 and every `GAM_PAGE_INTERVAL` pages.
//! Extents tile the file in contiguous 8-page runs starting at page 0, so a
//! reserved page occupies a slot inside whatever extent covers it; data-page
//! addressing skips those slots.

use crate::config::{
    CATALOG_PAGE_ID, EXTENTS_PER_GAM, EXTENT_SIZE, FIRST_GAM_PAGE_ID, FIRST_PFS_PAGE_ID,
    GAM_PAGE_INTERVAL, PAGE_SIZE, PFS_PAGE_INTERVAL,
};

/// File offset of a page.
pub fn page_file_offset(page_id: u32) -> u64 {
    page_id as u64 * PAGE_SIZE as u64
}

/// Whether `page_id` is a free-space map page.
pub fn is_pfs_page(page_id: u32) -> bool {
    page_id >= FIRST_PFS_PAGE_ID
        && (page_id - FIRST_PFS_PAGE_ID) as usize % PFS_PAGE_INTERVAL == 0
}

/// Whether `page_id` is an extent-allocation map page.
pub fn is_gam_page(page_id: u32) -> bool {
    page_id >= FIRST_GAM_PAGE_ID
        && (page_id - FIRST_GAM_PAGE_ID) as usize % GAM_PAGE_INTERVAL == 0
}

/// Whether `page_id` is reserved for a fixed-stride system page and can
/// never hold table data.
pub fn is_reserved_page(page_id: u32) -> bool {
    page_id == CATALOG_PAGE_ID || is_pfs_page(page_id) || is_gam_page(page_id)
}

/// Extent containing `page_id`.
pub fn extent_of_page(page_id: u32) -> u32 {
    page_id / EXTENT_SIZE as u32
}

/// First page slot of an extent, reserved or not.
pub fn extent_first_page(extent_id: u32) -> u32 {
    extent_id * EXTENT_SIZE as u32
}

/// First page of an extent usable for table contents; reserved map slots at
/// the head of the extent are skipped, so for extent 0 this lands past the
/// catalog, PFS, and GAM pages.
pub fn first_usable_page(extent_id: u32) -> u32 {
    let first = extent_first_page(extent_id);
    (first..first + EXTENT_SIZE as u32)
        .find(|&p| !is_reserved_page(p))
        .expect("an extent holds at most three reserved slots") // INVARIANT: strides exceed EXTENT_SIZE
}

/// The usable page slots of an extent, in order.
pub fn extent_pages(extent_id: u32) -> impl Iterator<Item = u32> {
    let first = extent_first_page(extent_id);
    (first..first + EXTENT_SIZE as u32).filter(|&p| !is_reserved_page(p))
}

/// Id of the PFS page whose map covers `page_id`, and the entry index of
/// `page_id` within that map.
pub fn pfs_location(page_id: u32) -> (u32, usize) {
    let region = page_id as usize / PFS_PAGE_INTERVAL;
    let pfs_page = FIRST_PFS_PAGE_ID + (region * PFS_PAGE_INTERVAL) as u32;
    let entry = page_id as usize - region * PFS_PAGE_INTERVAL;
    (pfs_page, entry)
}

/// Id of the GAM page whose bitmap covers `extent_id`, and the bit index of
/// `extent_id` within that bitmap.
pub fn gam_location(extent_id: u32) -> (u32, usize) {
    let region = extent_id as usize / EXTENTS_PER_GAM;
    let gam_page = FIRST_GAM_PAGE_ID + (region * GAM_PAGE_INTERVAL) as u32;
    let bit = extent_id as usize - region * EXTENTS_PER_GAM;
    (gam_page, bit)
}

/// First extent covered by the GAM page at `gam_page_id`.
pub fn gam_first_extent(gam_page_id: u32) -> u32 {
    let region = (gam_page_id - FIRST_GAM_PAGE_ID) as usize / GAM_PAGE_INTERVAL;
    (region * EXTENTS_PER_GAM) as u32
}
