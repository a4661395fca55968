mod test_utils;

use std::sync::Arc;

use small_mvcc::{
    data::DField,
    dict::Table,
    row::{row_delete, row_insert, row_sel_get_consistent, row_update},
    Database,
};
use test_utils::{new_blob_table, setup_with_page_size};

const PAGE_SIZE: usize = 4096;

fn body(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

fn read_body(db: &Database, table: &Table, id: i64) -> Option<Vec<u8>> {
    let mut thr = db.begin();
    let row = row_sel_get_consistent(db, &mut thr, table, &[DField::int(id)]).unwrap();
    thr.commit(db).unwrap();
    row.map(|r| r[1].bytes().to_vec())
}

fn setup_blob() -> (Arc<Database>, Arc<Table>) {
    let db = setup_with_page_size(PAGE_SIZE);
    let table = new_blob_table(&db, "docs");
    (db, table)
}

fn insert_body(db: &Database, table: &Table, id: i64, data: Vec<u8>) {
    let mut thr = db.begin();
    row_insert(db, &mut thr, table, vec![DField::int(id), DField::binary(data)]).unwrap();
    thr.commit(db).unwrap();
}

#[test]
fn test_big_rec_insert() {
    let (db, table) = setup_blob();
    let n_used = db.fsp().n_used();

    insert_body(&db, &table, 1, body(1, 20_000));
    insert_body(&db, &table, 2, body(2, 100));

    // the long value went to blob pages, the record keeps a reference
    assert!(db.fsp().n_used() >= n_used + 5);
    assert_eq!(read_body(&db, &table, 1), Some(body(1, 20_000)));
    assert_eq!(read_body(&db, &table, 2), Some(body(2, 100)));
    db.check_table(&table).unwrap();
}

// The old value of an updated external field stays readable for old
// views until purge frees it.
#[test]
fn test_big_rec_update() {
    let (db, table) = setup_blob();
    insert_body(&db, &table, 1, body(1, 20_000));

    let mut reader = db.begin();
    row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1)]).unwrap();

    let mut writer = db.begin();
    row_update(&db, &mut writer, &table, &[DField::int(1)], &[(1, DField::binary(body(9, 30_000)))])
        .unwrap();
    writer.commit(&db).unwrap();

    let old = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1)]).unwrap();
    assert_eq!(old.map(|r| r[1].bytes().to_vec()), Some(body(1, 20_000)));
    reader.commit(&db).unwrap();
    assert_eq!(read_body(&db, &table, 1), Some(body(9, 30_000)));

    let n_used = db.fsp().n_used();
    db.purge_all().unwrap();
    assert!(db.fsp().n_used() < n_used);
    assert_eq!(read_body(&db, &table, 1), Some(body(9, 30_000)));
    db.check_table(&table).unwrap();
}

// Changing the primary key moves the row, the new record inherits the
// external field. Rolling back must leave the chain with the old record.
#[test]
fn test_big_rec_key_update_rollback() {
    let (db, table) = setup_blob();
    insert_body(&db, &table, 1, body(1, 20_000));
    let n_used = db.fsp().n_used();

    let mut thr = db.begin();
    row_update(&db, &mut thr, &table, &[DField::int(1)], &[(0, DField::int(2))]).unwrap();
    assert_eq!(db.fsp().n_used(), n_used);
    thr.rollback(&db).unwrap();

    assert_eq!(db.fsp().n_used(), n_used);
    assert_eq!(read_body(&db, &table, 1), Some(body(1, 20_000)));
    assert_eq!(read_body(&db, &table, 2), None);
    db.check_table(&table).unwrap();

    // the old record owns the chain again, removing it frees the pages
    let mut thr = db.begin();
    row_delete(&db, &mut thr, &table, &[DField::int(1)]).unwrap();
    thr.commit(&db).unwrap();
    db.purge_all().unwrap();
    assert!(db.fsp().n_used() + 5 <= n_used);
}

// After a committed key change purge removes the old record without
// touching the chain the new one inherited.
#[test]
fn test_big_rec_key_update_purge() {
    let (db, table) = setup_blob();
    insert_body(&db, &table, 1, body(1, 20_000));

    let mut thr = db.begin();
    row_update(&db, &mut thr, &table, &[DField::int(1)], &[(0, DField::int(2))]).unwrap();
    thr.commit(&db).unwrap();
    db.purge_all().unwrap();

    assert_eq!(read_body(&db, &table, 1), None);
    assert_eq!(read_body(&db, &table, 2), Some(body(1, 20_000)));
    db.check_table(&table).unwrap();
}
