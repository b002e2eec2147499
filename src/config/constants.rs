//! # ExtentDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │
//!       └─> LOB_CHUNK_SIZE (derived: PAGE_USABLE_SIZE - LOB_RECORD_HEADER_SIZE)
//!
//! EXTENT_SIZE (8 pages)
//!       │
//!       ├─> EXTENT_BYTES (derived: EXTENT_SIZE * PAGE_SIZE, the unit of read I/O)
//!       │
//!       ├─> PFS_PAGE_INTERVAL (must be a multiple of EXTENT_SIZE so that
//!       │     free-space map pages land at a fixed offset within an extent)
//!       │
//!       └─> GAM_PAGE_INTERVAL (derived: EXTENTS_PER_GAM * EXTENT_SIZE,
//!             same multiple-of-EXTENT_SIZE requirement)
//!
//! MAX_NUMBER_OF_PAGES / MAX_NUMBER_SYSTEM_PAGES
//!       Independent capacities for the two cache pools. Data pages and
//!       system pages (catalog, allocation maps, index pages) never compete
//!       for the same slots.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE`
//! 2. `PFS_PAGE_INTERVAL % EXTENT_SIZE == 0`
//! 3. `GAM_PAGE_INTERVAL % EXTENT_SIZE == 0`
//! 4. `LOB_CHUNK_SIZE < PAGE_USABLE_SIZE`
//! 5. Each PFS page has one byte per tracked page and each GAM page one bit
//!    per tracked extent, both fitting inside `PAGE_USABLE_SIZE`.

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the fundamental page structure used throughout the database
// ============================================================================

/// Size of each database page in bytes (8KB).
/// This is the fundamental unit of caching; a page lives at file offset
/// `page_id * PAGE_SIZE`.
pub const PAGE_SIZE: usize = 8192;

/// Size of the page header in bytes.
/// Every page begins with this header containing id, occupancy, and kind.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Usable space in a page after the header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const _: () = assert!(
    PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE,
    "PAGE_USABLE_SIZE derivation mismatch"
);

// ============================================================================
// EXTENT AND ALLOCATION MAP LAYOUT
// The allocator hands out space in extents; the map strides below define
// where the allocation bookkeeping pages live in the file
// ============================================================================

/// Number of contiguous pages per extent, the unit of space allocation.
pub const EXTENT_SIZE: usize = 8;

/// Bytes spanned by one extent; the unit of read I/O on a cache miss.
pub const EXTENT_BYTES: usize = EXTENT_SIZE * PAGE_SIZE;

/// Number of pages tracked by one free-space (PFS) page, one byte each.
/// The first PFS page is page 1; the k-th sits at `1 + k * PFS_PAGE_INTERVAL`.
pub const PFS_PAGE_INTERVAL: usize = 8176;

/// Number of extents tracked by one extent-allocation (GAM) page, one bit
/// each. 8160 map bytes fit in the usable area alongside nothing else.
pub const EXTENTS_PER_GAM: usize = 8160 * 8;

/// Page stride between consecutive GAM pages.
/// The first GAM page is page 2; the k-th sits at `2 + k * GAM_PAGE_INTERVAL`.
pub const GAM_PAGE_INTERVAL: usize = EXTENTS_PER_GAM * EXTENT_SIZE;

/// Map bytes carried by a GAM page and by the extent bitmap of an IAM page.
pub const EXTENT_MAP_BYTES: usize = EXTENTS_PER_GAM / 8;

/// Page id of the catalog (metadata) page.
pub const CATALOG_PAGE_ID: u32 = 0;

/// Page id of the first free-space map page.
pub const FIRST_PFS_PAGE_ID: u32 = 1;

/// Page id of the first extent-allocation map page.
pub const FIRST_GAM_PAGE_ID: u32 = 2;

const _: () = assert!(
    PFS_PAGE_INTERVAL % EXTENT_SIZE == 0,
    "PFS pages must land at a fixed offset within an extent"
);

const _: () = assert!(
    GAM_PAGE_INTERVAL % EXTENT_SIZE == 0,
    "GAM pages must land at a fixed offset within an extent"
);

const _: () = assert!(
    PFS_PAGE_INTERVAL <= PAGE_USABLE_SIZE,
    "one byte per tracked page must fit in a PFS page"
);

const _: () = assert!(
    EXTENT_MAP_BYTES + 12 <= PAGE_USABLE_SIZE,
    "extent bitmap plus IAM chain fields must fit in a page"
);

// ============================================================================
// FREE-SPACE CATEGORIES
// ============================================================================

/// Lower bounds, in percent of usable space free, for the nine occupancy
/// buckets a PFS entry can report. A page in bucket `i` has at least
/// `FREE_SPACE_BUCKETS[i]` percent of its usable space left. The bucket
/// index is stored in the 5-bit category field of the page's PFS entry.
pub const FREE_SPACE_BUCKETS: [u8; 9] = [0, 4, 8, 16, 24, 32, 48, 64, 81];

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Capacity of the data-page cache pool (data and large-object pages).
pub const MAX_NUMBER_OF_PAGES: usize = 128;

/// Capacity of the system-page cache pool (catalog, allocation map, and
/// index pages). Independent from the data pool.
pub const MAX_NUMBER_SYSTEM_PAGES: usize = 64;

const _: () = assert!(MAX_NUMBER_OF_PAGES >= EXTENT_SIZE);
const _: () = assert!(MAX_NUMBER_SYSTEM_PAGES >= EXTENT_SIZE);

// ============================================================================
// ROW AND LARGE-OBJECT LAYOUT
// ============================================================================

/// Length prefix stored before each non-null column block in a row.
pub const ROW_LENGTH_PREFIX_SIZE: usize = 2;

/// In-row size of a large-object pointer: page id (4) + object index (2).
pub const LOB_POINTER_SIZE: usize = 6;

/// Column values at or above this many bytes are stored out of row.
pub const LOB_THRESHOLD: usize = 2000;

/// Serialized header of one large-object record:
/// object_size (4) + next_page_id (4) + next_object_index (2).
pub const LOB_RECORD_HEADER_SIZE: usize = 10;

/// Maximum payload bytes of a single large-object record.
pub const LOB_CHUNK_SIZE: usize = PAGE_USABLE_SIZE - LOB_RECORD_HEADER_SIZE;

const _: () = assert!(LOB_CHUNK_SIZE < PAGE_USABLE_SIZE);
const _: () = assert!(LOB_THRESHOLD > LOB_POINTER_SIZE);

// ============================================================================
// B+TREE CONFIGURATION
// ============================================================================

/// Maximum tree depth a descent will walk before declaring the structure
/// corrupt. Sixteen levels cover any realizable tree: even at the minimum
/// degree a full descent path of sixteen nodes spans tens of thousands of
/// keys.
pub const MAX_TREE_DEPTH: usize = 16;

/// Smallest permitted minimum degree. A node holds at most `2t - 1` keys.
pub const MIN_DEGREE: u16 = 2;

/// Largest permitted minimum degree, bounding node size regardless of how
/// small the per-entry estimate comes out.
pub const MAX_DEGREE: u16 = 64;

const _: () = assert!(MIN_DEGREE >= 2, "B-tree minimum degree must be >= 2");
const _: () = assert!(MAX_DEGREE >= MIN_DEGREE);
