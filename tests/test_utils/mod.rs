#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use small_mvcc::{
    data::{DField, DType},
    dict::{Table, TableDef},
    row::{row_insert, row_sel_get_consistent, row_sel_scan_consistent},
    utils, Config, Database,
};

/// Page size of the small-page tests, a leaf holds a few dozen int rows.
pub const SMALL_PAGE_SIZE: usize = 1024;

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Create a database with small pages, so that a few hundred rows
///   already build a multi-level tree.
pub fn setup() -> Arc<Database> {
    setup_with_page_size(SMALL_PAGE_SIZE)
}

pub fn setup_with_page_size(page_size: usize) -> Arc<Database> {
    utils::init_log();
    Database::new(Config {
        page_size,
        lock_wait_timeout: Duration::from_secs(10),
        delete_retry_sleep: Duration::from_millis(5),
        ..Config::from_env()
    })
    .unwrap()
}

/// `(id int, v int)`, primary key `id`.
pub fn new_int_table(db: &Database, name: &str) -> Arc<Table> {
    db.create_table(
        TableDef::new(name)
            .column("id", DType::int())
            .column("v", DType::int())
            .primary_key(&[0]),
    )
    .unwrap()
}

/// `(id int, k int, note varchar)`, primary key `id`, secondary index on
/// `k`.
pub fn new_indexed_table(db: &Database, name: &str, unique: bool) -> Arc<Table> {
    db.create_table(
        TableDef::new(name)
            .column("id", DType::int())
            .column("k", DType::int())
            .column("note", DType::varchar(64).nullable())
            .primary_key(&[0])
            .index(&format!("{}_k", name), &[1], unique),
    )
    .unwrap()
}

/// `(id int, body binary)`, primary key `id`.
pub fn new_blob_table(db: &Database, name: &str) -> Arc<Table> {
    db.create_table(
        TableDef::new(name)
            .column("id", DType::int())
            .column("body", DType::binary(0))
            .primary_key(&[0]),
    )
    .unwrap()
}

/// Insert `(id, v)` rows in one committed transaction.
pub fn insert_int_rows(db: &Database, table: &Table, rows: impl IntoIterator<Item = (i64, i64)>) {
    let mut thr = db.begin();
    for (id, v) in rows {
        row_insert(db, &mut thr, table, vec![DField::int(id), DField::int(v)]).unwrap();
    }
    thr.commit(db).unwrap();
}

/// The `v` of a row as seen by a fresh transaction.
pub fn read_int(db: &Database, table: &Table, id: i64) -> Option<i64> {
    let mut thr = db.begin();
    let row = row_sel_get_consistent(db, &mut thr, table, &[DField::int(id)]).unwrap();
    thr.commit(db).unwrap();
    row.map(|r| r[1].as_int().unwrap())
}

/// Every `(id, v)` of the table as seen by a fresh transaction.
pub fn scan_int_rows(db: &Database, table: &Table) -> Vec<(i64, i64)> {
    let mut thr = db.begin();
    let rows = row_sel_scan_consistent(db, &mut thr, table).unwrap();
    thr.commit(db).unwrap();
    rows.iter()
        .map(|r| (r[0].as_int().unwrap(), r[1].as_int().unwrap()))
        .collect()
}

pub fn int_of(field: &DField) -> i64 {
    field.as_int().unwrap()
}
