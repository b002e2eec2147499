//! End-to-end behavior of the database surface: heap and clustered row
//! placement, large-object chaining, free-space map accuracy, catalog
//! persistence across reopen, and the parallel heap scan.

use tempfile::TempDir;

use extentdb::config::LOB_CHUNK_SIZE;
use extentdb::database::{CmpOp, Predicate};
use extentdb::storage::layout;
use extentdb::storage::alloc_page::{free_space_category, PfsKind};
use extentdb::{ColumnDef, DataType, Database, OwnedValue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn people_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::varchar("name", 40, 1),
        ColumnDef::new("age", DataType::Int, 2),
    ]
}

#[test]
fn heap_insert_select_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("people.db");

    {
        let mut db = Database::create(&path, "people").unwrap();
        db.create_table("people", people_columns(), None).unwrap();
        for (id, name, age) in [
            (1i64, "ada", 36),
            (2, "grace", 45),
            (3, "edsger", 41),
            (4, "barbara", 39),
        ] {
            db.insert_row(
                "people",
                &[
                    OwnedValue::BigInt(id),
                    OwnedValue::Text(name.into()),
                    OwnedValue::Int(age),
                ],
            )
            .unwrap();
        }

        let rows = db
            .select(
                "people",
                &[1],
                &[Predicate::new(2, CmpOp::Gt, OwnedValue::Int(40))],
                None,
            )
            .unwrap();
        let mut names: Vec<String> = rows
            .into_iter()
            .map(|r| match &r[0] {
                OwnedValue::Text(s) => s.clone(),
                other => panic!("unexpected value {other:?}"),
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["edsger", "grace"]);
        db.close().unwrap();
    }

    // The catalog and every row must survive a restart.
    let db = Database::open(&path).unwrap();
    let table = db.table("people").unwrap();
    assert_eq!(table.columns.len(), 3);
    assert!(!table.columns[0].nullable());

    let all = db.select("people", &[0, 1, 2], &[], None).unwrap();
    assert_eq!(all.len(), 4);
    let limited = db.select("people", &[0], &[], Some(2)).unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn null_columns_round_trip_and_never_match_predicates() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("n.db"), "nulls").unwrap();
    db.create_table("people", people_columns(), None).unwrap();

    db.insert_row(
        "people",
        &[OwnedValue::BigInt(1), OwnedValue::Null, OwnedValue::Null],
    )
    .unwrap();
    db.insert_row(
        "people",
        &[
            OwnedValue::BigInt(2),
            OwnedValue::Text("kay".into()),
            OwnedValue::Int(70),
        ],
    )
    .unwrap();

    let rows = db.select("people", &[0, 1], &[], None).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .any(|r| r[0] == OwnedValue::BigInt(1) && r[1] == OwnedValue::Null));

    // NULL never satisfies a predicate, equality included.
    let matched = db
        .select(
            "people",
            &[0],
            &[Predicate::new(2, CmpOp::Gt, OwnedValue::Int(0))],
            None,
        )
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0][0], OwnedValue::BigInt(2));

    // NOT NULL stays enforced at the row boundary.
    let violation = db.insert_row(
        "people",
        &[OwnedValue::Null, OwnedValue::Null, OwnedValue::Null],
    );
    assert!(violation.is_err());
}

#[test]
fn large_object_chains_across_three_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lob.db");
    let payload: Vec<u8> = (0..3 * LOB_CHUNK_SIZE).map(|i| (i % 251) as u8).collect();

    {
        let mut db = Database::create(&path, "lobs").unwrap();
        db.create_table(
            "blobs",
            vec![
                ColumnDef::new("id", DataType::BigInt, 0).not_null(),
                ColumnDef::binary("data", u16::MAX, 1),
            ],
            None,
        )
        .unwrap();
        let locator = db
            .insert_row(
                "blobs",
                &[OwnedValue::BigInt(1), OwnedValue::Bytes(payload.clone())],
            )
            .unwrap();

        // The row keeps only a pointer; the bytes sit in a chain of exactly
        // three records, one full page each.
        let row = db.fetch_row("blobs", locator).unwrap();
        assert!(row.is_lob(1));
        let (mut page_id, mut index) = row.lob_pointer(1).unwrap();
        let mut records = 0;
        while page_id != 0 {
            let guard = db.engine().data_page(page_id, None).unwrap();
            let object = guard.page().as_lob().unwrap().object(index).unwrap();
            records += 1;
            assert_eq!(object.bytes().len(), LOB_CHUNK_SIZE);
            let next = (object.next_page_id(), object.next_object_index());
            drop(guard);
            (page_id, index) = next;
        }
        assert_eq!(records, 3);

        let value = db.resolve_value("blobs", &row, 1).unwrap();
        assert_eq!(value, OwnedValue::Bytes(payload.clone()));
        db.close().unwrap();
    }

    // Reassembly is byte-exact after a restart too.
    let db = Database::open(&path).unwrap();
    let rows = db.select("blobs", &[1], &[], None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], OwnedValue::Bytes(payload));
}

#[test]
fn free_space_entries_track_every_data_page_exactly() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("pfs.db"), "pfs").unwrap();
    db.create_table("people", people_columns(), None).unwrap();

    for id in 0..200i64 {
        db.insert_row(
            "people",
            &[
                OwnedValue::BigInt(id),
                OwnedValue::Text(format!("name-{id}")),
                OwnedValue::Int((id % 90) as i32),
            ],
        )
        .unwrap();

        // Eager accounting: after every insert, each allocated data page's
        // category equals the one computed from its true bytes_left.
        let table_idx = 0;
        for extent in db.owned_extents(table_idx).unwrap() {
            for page_id in layout::extent_pages(extent) {
                let entry = db.pfs_entry(page_id).unwrap();
                if !entry.allocated || entry.kind != PfsKind::Data {
                    continue;
                }
                let bytes_left = {
                    let columns = people_columns();
                    let guard = db.engine().data_page(page_id, Some(&columns)).unwrap();
                    guard.page().as_data().unwrap().bytes_left()
                };
                assert_eq!(
                    entry.category,
                    free_space_category(bytes_left),
                    "page {page_id} after insert {id}"
                );
            }
        }
    }
}

#[test]
fn parallel_heap_scan_finds_one_row_per_extent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("scan.db"), "scan").unwrap();
    db.create_table(
        "events",
        vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::new("flag", DataType::Bool, 1).not_null(),
            ColumnDef::binary("payload", 1900, 2).not_null(),
        ],
        None,
    )
    .unwrap();

    // Rows of 1919 bytes pack four to a page, so placement fills pages and
    // extents strictly in order: rows 0..16 land in the first extent (which
    // loses pages to its allocation maps), then 32 rows per extent after.
    // One flagged row is planted at the first row of each extent.
    let flagged = [0usize, 16, 48, 80];
    for i in 0..84usize {
        db.insert_row(
            "events",
            &[
                OwnedValue::BigInt(i as i64),
                OwnedValue::Bool(flagged.contains(&i)),
                OwnedValue::Bytes(vec![i as u8; 1900]),
            ],
        )
        .unwrap();
    }
    assert_eq!(db.owned_extents(0).unwrap().len(), 4);

    // One worker per extent; the predicate matches exactly one row in each.
    let rows = db
        .select(
            "events",
            &[0],
            &[Predicate::new(1, CmpOp::Eq, OwnedValue::Bool(true))],
            None,
        )
        .unwrap();
    let mut ids: Vec<i64> = rows
        .iter()
        .map(|r| match r[0] {
            OwnedValue::BigInt(v) => v,
            ref other => panic!("unexpected value {other:?}"),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 16, 48, 80]);
}

#[test]
fn clustered_table_keeps_key_order_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clustered.db");

    {
        let mut db = Database::create(&path, "ordered").unwrap();
        db.create_table(
            "entries",
            vec![
                ColumnDef::new("id", DataType::BigInt, 0).not_null(),
                ColumnDef::varchar("label", 24, 1),
            ],
            Some(vec![0]),
        )
        .unwrap();

        // A coprime stride visits 0..37 in scrambled order.
        for i in 0..37i64 {
            let id = (i * 17) % 37;
            db.insert_row(
                "entries",
                &[OwnedValue::BigInt(id), OwnedValue::Text(format!("e{id}"))],
            )
            .unwrap();
        }

        // A full scan walks the leaf chain, so rows come back sorted without
        // any sort step.
        let rows = db.select("entries", &[0], &[], None).unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| match r[0] {
                OwnedValue::BigInt(v) => v,
                ref other => panic!("unexpected value {other:?}"),
            })
            .collect();
        assert_eq!(ids, (0..37).collect::<Vec<_>>());

        for id in [0i64, 11, 36] {
            let hit = db.search_key("entries", &[OwnedValue::BigInt(id)]).unwrap();
            assert!(hit.is_some(), "key {id} not found");
        }
        assert!(db
            .search_key("entries", &[OwnedValue::BigInt(99)])
            .unwrap()
            .is_none());

        let range = db
            .range_query(
                "entries",
                &[OwnedValue::BigInt(10)],
                &[OwnedValue::BigInt(20)],
            )
            .unwrap();
        assert_eq!(range.len(), 11);

        // Duplicate clustered keys are a logic error, not an update.
        let duplicate = db.insert_row(
            "entries",
            &[OwnedValue::BigInt(5), OwnedValue::Text("again".into())],
        );
        assert!(duplicate.is_err());
        db.close().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let rows = db.select("entries", &[0, 1], &[], None).unwrap();
    assert_eq!(rows.len(), 37);
    assert_eq!(rows[0][0], OwnedValue::BigInt(0));
    assert_eq!(rows[36][0], OwnedValue::BigInt(36));
}

#[test]
fn clustered_rows_wider_than_half_a_page_spread_across_leaves() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("wide.db"), "wide").unwrap();
    db.create_table(
        "docs",
        vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::varchar("body", 1400, 1).not_null(),
            ColumnDef::varchar("summary", 1400, 2).not_null(),
            ColumnDef::varchar("notes", 1400, 3).not_null(),
        ],
        Some(vec![0]),
    )
    .unwrap();

    // Each row is ~4.2K, more than half a page, so no two rows ever share
    // a data page. Inserts on both sides of existing keys must keep
    // succeeding as the rows spread one per leaf.
    for id in [2i64, 3, 1, 4] {
        db.insert_row(
            "docs",
            &[
                OwnedValue::BigInt(id),
                OwnedValue::Text("b".repeat(1400)),
                OwnedValue::Text("s".repeat(1400)),
                OwnedValue::Text("n".repeat(1400)),
            ],
        )
        .unwrap();
    }

    let rows = db.select("docs", &[0, 1], &[], None).unwrap();
    assert_eq!(rows.len(), 4);
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| match r[0] {
            OwnedValue::BigInt(v) => v,
            ref other => panic!("unexpected value {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(rows[0][1], OwnedValue::Text("b".repeat(1400)));
    for id in [1i64, 2, 3, 4] {
        assert!(
            db.search_key("docs", &[OwnedValue::BigInt(id)])
                .unwrap()
                .is_some(),
            "key {id} not found"
        );
    }
}

#[test]
fn index_keys_stay_in_row() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("keys.db"), "keys").unwrap();
    db.create_table(
        "docs",
        vec![
            ColumnDef::varchar("slug", 4000, 0).not_null(),
            ColumnDef::binary("body", u16::MAX, 1),
        ],
        Some(vec![0]),
    )
    .unwrap();

    // A clustered-key value at the out-of-row threshold is a logic error,
    // not a large object.
    let long_key = db.insert_row(
        "docs",
        &[OwnedValue::Text("k".repeat(2500)), OwnedValue::Null],
    );
    let err = long_key.unwrap_err().to_string();
    assert!(err.contains("key column slug"), "unexpected error: {err}");

    // A short key with an oversized non-key value converts only the value.
    let locator = db
        .insert_row(
            "docs",
            &[
                OwnedValue::Text("intro".into()),
                OwnedValue::Bytes(vec![7u8; 5000]),
            ],
        )
        .unwrap();
    let row = db.fetch_row("docs", locator).unwrap();
    assert!(!row.is_lob(0));
    assert!(row.is_lob(1));
    assert_eq!(
        db.resolve_value("docs", &row, 1).unwrap(),
        OwnedValue::Bytes(vec![7u8; 5000])
    );
    assert!(db
        .search_key("docs", &[OwnedValue::Text("intro".into())])
        .unwrap()
        .is_some());

    // Secondary-index keys are held to the same limit.
    db.create_table(
        "users",
        vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::varchar("email", 4000, 1),
        ],
        None,
    )
    .unwrap();
    db.create_index("users", vec![1]).unwrap();
    let long_email = db.insert_row(
        "users",
        &[OwnedValue::BigInt(1), OwnedValue::Text("e".repeat(3000))],
    );
    let err = long_email.unwrap_err().to_string();
    assert!(err.contains("key column email"), "unexpected error: {err}");

    // A column whose stored values already went out of row cannot become
    // an index key afterwards.
    db.create_table(
        "notes",
        vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::varchar("text", 4000, 1),
        ],
        None,
    )
    .unwrap();
    db.insert_row(
        "notes",
        &[OwnedValue::BigInt(1), OwnedValue::Text("t".repeat(3000))],
    )
    .unwrap();
    let err = db.create_index("notes", vec![1]).unwrap_err().to_string();
    assert!(err.contains("cannot be indexed"), "unexpected error: {err}");
}

#[test]
fn secondary_index_backfills_and_tracks_inserts() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("idx.db"), "idx").unwrap();
    db.create_table(
        "users",
        vec![
            ColumnDef::new("id", DataType::BigInt, 0).not_null(),
            ColumnDef::varchar("email", 40, 1),
        ],
        None,
    )
    .unwrap();

    db.insert_row(
        "users",
        &[
            OwnedValue::BigInt(1),
            OwnedValue::Text("ada@crunch.io".into()),
        ],
    )
    .unwrap();
    db.insert_row("users", &[OwnedValue::BigInt(2), OwnedValue::Null])
        .unwrap();

    // Backfill indexes the existing non-NULL keys.
    db.create_index("users", vec![1]).unwrap();
    let hit = db
        .search_key("users", &[OwnedValue::Text("ada@crunch.io".into())])
        .unwrap()
        .unwrap();
    let row = db.fetch_row("users", hit).unwrap();
    assert_eq!(
        db.resolve_value("users", &row, 0).unwrap(),
        OwnedValue::BigInt(1)
    );

    // New rows are indexed as they arrive.
    db.insert_row(
        "users",
        &[
            OwnedValue::BigInt(3),
            OwnedValue::Text("kay@crunch.io".into()),
        ],
    )
    .unwrap();
    assert!(db
        .search_key("users", &[OwnedValue::Text("kay@crunch.io".into())])
        .unwrap()
        .is_some());
    assert!(db
        .search_key("users", &[OwnedValue::Text("nobody@crunch.io".into())])
        .unwrap()
        .is_none());

    // A duplicate indexed key surfaces as a logic error.
    let duplicate = db.insert_row(
        "users",
        &[
            OwnedValue::BigInt(4),
            OwnedValue::Text("ada@crunch.io".into()),
        ],
    );
    assert!(duplicate.is_err());
}

#[test]
fn clustered_tables_reject_secondary_indexes() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path().join("c.db"), "c").unwrap();
    db.create_table(
        "entries",
        vec![ColumnDef::new("id", DataType::BigInt, 0).not_null()],
        Some(vec![0]),
    )
    .unwrap();

    assert!(db.create_index("entries", vec![0]).is_err());
}

#[test]
fn tiny_cache_spills_and_reloads_through_the_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiny.db");

    let columns = vec![
        ColumnDef::new("id", DataType::BigInt, 0).not_null(),
        ColumnDef::binary("payload", 1000, 1).not_null(),
    ];

    {
        // Pools barely bigger than one extent force constant eviction; every
        // row must still be readable through write-back and reload.
        let mut db = Database::create_with_capacities(&path, "tiny", 8, 8).unwrap();
        db.create_table("events", columns.clone(), None).unwrap();
        for id in 0..150i64 {
            db.insert_row(
                "events",
                &[
                    OwnedValue::BigInt(id),
                    OwnedValue::Bytes(vec![id as u8; 1000]),
                ],
            )
            .unwrap();
        }
        let all = db.select("events", &[0], &[], None).unwrap();
        assert_eq!(all.len(), 150);
        db.close().unwrap();
    }

    let db = Database::open_with_capacities(&path, 8, 8).unwrap();
    let all = db.select("events", &[0, 1], &[], None).unwrap();
    assert_eq!(all.len(), 150);
    let one = db
        .select(
            "events",
            &[1],
            &[Predicate::new(0, CmpOp::Eq, OwnedValue::BigInt(149))],
            None,
        )
        .unwrap();
    assert_eq!(one, vec![vec![OwnedValue::Bytes(vec![149u8; 1000])]]);
}
