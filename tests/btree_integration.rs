//! B+Tree behavior over a real storage engine: proactive splits, leaf-chain
//! ordering, range queries, duplicate rejection, and page-level splits with
//! reference patching. A small fixed degree keeps the structures observable.

use eyre::Result;
use tempfile::TempDir;

use extentdb::btree::{check_link_invariants, BTree, IndexPage, Key, KeyPart, TreeInsert, TreeSpace};
use extentdb::database::IndexMeta;
use extentdb::row::{Row, RowLocator};
use extentdb::storage::alloc_page::PfsKind;
use extentdb::storage::{DataPage, Page, StorageEngine};
use extentdb::types::{ColumnDef, DataType, OwnedValue};

/// Minimal space provider: hands out fresh pages with increasing ids and
/// skips the free-space bookkeeping the database layer normally does.
struct TestSpace {
    engine: StorageEngine,
    columns: Vec<ColumnDef>,
    index_pages: Vec<u32>,
    next_page: u32,
}

impl TestSpace {
    fn new(dir: &TempDir) -> Self {
        let engine =
            StorageEngine::create_with_capacities(dir.path().join("tree.db"), 64, 64).unwrap();
        Self {
            engine,
            columns: vec![ColumnDef::new("id", DataType::BigInt, 0).not_null()],
            index_pages: Vec::new(),
            next_page: 3,
        }
    }

    fn bump(&mut self) -> u32 {
        let id = self.next_page;
        self.next_page += 1;
        id
    }
}

impl TreeSpace for TestSpace {
    fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    fn allocate_index_page(&mut self) -> Result<u32> {
        let id = self.bump();
        self.engine.create_page(Page::Index(IndexPage::new(id)))?;
        self.index_pages.push(id);
        Ok(id)
    }

    fn find_index_page_with_room(&mut self, bytes: usize) -> Result<Option<u32>> {
        for &id in &self.index_pages {
            let guard = self.engine.index_page(id)?;
            if guard.page().as_index()?.bytes_left() >= bytes {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn allocate_data_page(&mut self) -> Result<u32> {
        let id = self.bump();
        self.engine.create_page(Page::Data(DataPage::new(id)))?;
        Ok(id)
    }

    fn occupancy_changed(&mut self, _page_id: u32, _bytes_left: usize, _kind: PfsKind) -> Result<()> {
        Ok(())
    }

    fn root_page_moved(&mut self, _index_id: u32, _new_page_id: u32) -> Result<()> {
        Ok(())
    }
}

#[test]
fn clustered_root_split_matches_proactive_shape() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(0, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, true, 3).unwrap();

    // With t=3 a node holds at most five keys, so 1..=5 stay in one leaf.
    for id in 1..=5i64 {
        let row = Row::from_values(
            &[ColumnDef::new("id", DataType::BigInt, 0).not_null()],
            &[OwnedValue::BigInt(id)],
        )
        .unwrap();
        tree.insert(Key::from_int(id), TreeInsert::Row(row)).unwrap();
    }
    let root = tree.reader().root().unwrap().unwrap();
    assert!(root.is_leaf());
    assert_eq!(root.key_count(), 5);

    // The next insert finds the root full, splits it pre-emptively into
    // {1,2} / {3,4,5} with the median copied up, then descends right.
    let row = Row::from_values(
        &[ColumnDef::new("id", DataType::BigInt, 0).not_null()],
        &[OwnedValue::BigInt(6)],
    )
    .unwrap();
    tree.insert(Key::from_int(6), TreeInsert::Row(row)).unwrap();

    let (left, right) = {
        let reader = tree.reader();
        let root = reader.root().unwrap().unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.keys, vec![Key::from_int(3)]);
        assert_eq!(root.child_headers().len(), 2);
        check_link_invariants(&reader).unwrap();
        (
            reader.node(root.child_headers()[0]).unwrap(),
            reader.node(root.child_headers()[1]).unwrap(),
        )
    };
    assert_eq!(left.keys, vec![Key::from_int(1), Key::from_int(2)]);
    assert_eq!(
        right.keys,
        vec![
            Key::from_int(3),
            Key::from_int(4),
            Key::from_int(5),
            Key::from_int(6)
        ]
    );
    assert_eq!(left.next_leaf, Some(right.header));
    assert_eq!(right.prev_leaf, Some(left.header));

    // The physical rows split with the keys.
    drop(tree);
    let columns = vec![ColumnDef::new("id", DataType::BigInt, 0).not_null()];
    let left_rows = {
        let guard = space
            .engine()
            .data_page(left.data_page_id().unwrap(), Some(&columns))
            .unwrap();
        guard.page().as_data().unwrap().row_count()
    };
    let right_rows = {
        let guard = space
            .engine()
            .data_page(right.data_page_id().unwrap(), Some(&columns))
            .unwrap();
        guard.page().as_data().unwrap().row_count()
    };
    assert_eq!(left_rows, 2);
    assert_eq!(right_rows, 4);
}

#[test]
fn secondary_inserts_keep_leaf_chain_sorted() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(1, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, false, 2).unwrap();

    // Deterministic shuffle of 0..97 via a coprime stride.
    let keys: Vec<i64> = (0..97).map(|i| (i * 37) % 97).collect();
    for &k in &keys {
        tree.insert(
            Key::from_int(k),
            TreeInsert::Locator(RowLocator::new(1000, k as u16)),
        )
        .unwrap();
    }

    let ordered = tree.reader().leaf_keys().unwrap();
    assert_eq!(ordered.len(), 97);
    assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ordered[0], Key::from_int(0));
    assert_eq!(ordered[96], Key::from_int(96));
    check_link_invariants(&tree.reader()).unwrap();

    for k in 0..97i64 {
        let found = tree.reader().search(&Key::from_int(k)).unwrap();
        assert_eq!(found, Some(RowLocator::new(1000, k as u16)), "key {k}");
    }
    assert_eq!(tree.reader().search(&Key::from_int(200)).unwrap(), None);
}

#[test]
fn range_query_equals_leaf_traversal_slice() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(1, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, false, 2).unwrap();

    for k in (0..60i64).rev() {
        tree.insert(
            Key::from_int(k),
            TreeInsert::Locator(RowLocator::new(500, k as u16)),
        )
        .unwrap();
    }

    let hits = tree
        .reader()
        .range(&Key::from_int(17), &Key::from_int(41))
        .unwrap();
    let keys: Vec<Key> = hits.iter().map(|(k, _)| k.clone()).collect();
    let expected: Vec<Key> = (17..=41).map(Key::from_int).collect();
    assert_eq!(keys, expected);
    for (k, locator) in &hits {
        assert_eq!(locator.page_id, 500);
        assert_eq!(*k, Key::from_int(locator.slot as i64));
    }

    // Bounds outside the stored keys clamp cleanly.
    assert_eq!(
        tree.reader()
            .range(&Key::from_int(-5), &Key::from_int(2))
            .unwrap()
            .len(),
        3
    );
    assert!(tree
        .reader()
        .range(&Key::from_int(70), &Key::from_int(90))
        .unwrap()
        .is_empty());
    assert!(tree
        .reader()
        .range(&Key::from_int(10), &Key::from_int(5))
        .unwrap()
        .is_empty());
}

#[test]
fn duplicate_key_is_rejected_at_the_exact_slot() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(1, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, false, 2).unwrap();

    for k in 0..20i64 {
        tree.insert(
            Key::from_int(k),
            TreeInsert::Locator(RowLocator::new(500, k as u16)),
        )
        .unwrap();
    }

    // Duplicates must be caught wherever the key landed after splits, not
    // just next to the most recent insert.
    for k in [0i64, 7, 13, 19] {
        let result = tree.insert(
            Key::from_int(k),
            TreeInsert::Locator(RowLocator::new(501, 0)),
        );
        assert!(result.is_err(), "duplicate {k} was accepted");
    }
    assert_eq!(tree.reader().leaf_keys().unwrap().len(), 20);
}

#[test]
fn page_level_split_patches_every_reference() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(1, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, false, 2).unwrap();

    // Degree 2 nodes hold three keys, so several hundred keys produce far
    // more nodes than one index page can hold and force page-level splits.
    for k in 0..400i64 {
        tree.insert(
            Key::from_int(k),
            TreeInsert::Locator(RowLocator::new(900, (k % 1000) as u16)),
        )
        .unwrap();
    }

    check_link_invariants(&tree.reader()).unwrap();
    let ordered = tree.reader().leaf_keys().unwrap();
    assert_eq!(ordered.len(), 400);
    assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    for k in [0i64, 137, 256, 399] {
        assert!(tree.reader().search(&Key::from_int(k)).unwrap().is_some());
    }
}

#[test]
fn byte_driven_leaf_split_on_wide_clustered_rows() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    space.columns = vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::binary("payload", 1800, 1),
    ];
    let mut meta = IndexMeta::new(0, vec![0]);
    // A generous degree: the data page runs out of bytes long before the
    // leaf reaches 2t-1 keys, exercising the byte-driven split path.
    let mut tree = BTree::with_degree(&mut space, &mut meta, true, 16).unwrap();

    let columns = vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::binary("payload", 1800, 1),
    ];
    for id in 0..12i64 {
        let row = Row::from_values(
            &columns,
            &[OwnedValue::BigInt(id), OwnedValue::Bytes(vec![id as u8; 1800])],
        )
        .unwrap();
        tree.insert(Key::from_int(id), TreeInsert::Row(row)).unwrap();
    }

    let reader = tree.reader();
    let root = reader.root().unwrap().unwrap();
    assert!(!root.is_leaf(), "wide rows must have split the first leaf");
    check_link_invariants(&reader).unwrap();
    let ordered = reader.leaf_keys().unwrap();
    assert_eq!(ordered.len(), 12);
    assert!(ordered.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn single_row_leaves_spread_wide_clustered_rows() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    space.columns = vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::binary("payload", 4600, 1),
    ];
    let mut meta = IndexMeta::new(0, vec![0]);
    let mut tree = BTree::with_degree(&mut space, &mut meta, true, 3).unwrap();

    let columns = vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::binary("payload", 4600, 1),
    ];
    // Rows of ~4.6K never share a page, so every byte-full leaf holds a
    // single key and splits degenerately. The mixed order lands incoming
    // keys on both sides of a resident row.
    for id in [3i64, 5, 1, 4, 2, 6, 0] {
        let row = Row::from_values(
            &columns,
            &[OwnedValue::BigInt(id), OwnedValue::Bytes(vec![id as u8; 4600])],
        )
        .unwrap();
        tree.insert(Key::from_int(id), TreeInsert::Row(row)).unwrap();
    }

    let leaf_pages: Vec<(i64, u32)> = {
        let reader = tree.reader();
        check_link_invariants(&reader).unwrap();
        let ordered = reader.leaf_keys().unwrap();
        assert_eq!(ordered, (0..=6).map(Key::from_int).collect::<Vec<_>>());

        let mut pages = Vec::new();
        let mut current = reader.first_leaf().unwrap();
        while let Some(h) = current {
            let leaf = reader.node(h).unwrap();
            assert_eq!(leaf.key_count(), 1, "wide rows must live one per leaf");
            let id = match leaf.keys[0].parts()[0] {
                KeyPart::Int(v) => v,
                ref other => panic!("unexpected key part {other:?}"),
            };
            pages.push((id, leaf.data_page_id().unwrap()));
            current = leaf.next_leaf;
        }
        pages
    };
    drop(tree);

    // Each leaf owns exactly one physical row, and the chain follows key
    // order page by page.
    assert_eq!(leaf_pages.len(), 7);
    for (i, &(id, page_id)) in leaf_pages.iter().enumerate() {
        assert_eq!(id, i as i64);
        let guard = space.engine().data_page(page_id, Some(&columns)).unwrap();
        let page = guard.page().as_data().unwrap();
        assert_eq!(page.row_count(), 1, "page {page_id}");
        assert_eq!(
            page.row(0).unwrap().value(0, &columns).unwrap(),
            OwnedValue::BigInt(id)
        );
    }
}

#[test]
fn empty_tree_reads_cleanly() {
    let dir = TempDir::new().unwrap();
    let mut space = TestSpace::new(&dir);
    let mut meta = IndexMeta::new(1, vec![0]);
    let tree = BTree::with_degree(&mut space, &mut meta, false, 2).unwrap();

    assert!(tree.reader().search(&Key::from_int(1)).unwrap().is_none());
    assert!(tree.reader().leaf_keys().unwrap().is_empty());
    assert!(tree
        .reader()
        .range(&Key::from_int(0), &Key::from_int(10))
        .unwrap()
        .is_empty());
}
