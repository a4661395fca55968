mod test_utils;

use small_mvcc::{
    data::{DField, DType},
    dict::TableDef,
    row::{row_delete, row_insert, row_update},
    ErrorCode,
};
use test_utils::{int_of, new_indexed_table, new_int_table, read_int, setup};

#[test]
fn test_duplicate_primary_key() {
    let db = setup();
    let table = new_int_table(&db, "t");

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, vec![DField::int(1), DField::int(10)]).unwrap();
    let err = row_insert(&db, &mut thr, &table, vec![DField::int(1), DField::int(11)]).unwrap_err();
    assert!(err.is(ErrorCode::DuplicateKey));
    thr.commit(&db).unwrap();
    assert_eq!(read_int(&db, &table, 1), Some(10));

    // a delete-marked record is taken over by the insert
    let mut thr = db.begin();
    row_delete(&db, &mut thr, &table, &[DField::int(1)]).unwrap();
    thr.commit(&db).unwrap();

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, vec![DField::int(1), DField::int(12)]).unwrap();
    thr.commit(&db).unwrap();
    assert_eq!(read_int(&db, &table, 1), Some(12));

    db.purge_all().unwrap();
    assert_eq!(read_int(&db, &table, 1), Some(12));
    db.check_table(&table).unwrap();
}

#[test]
fn test_unique_secondary() {
    let db = setup();
    let table = new_indexed_table(&db, "users", true);
    let row = |id: i64, k: i64| vec![DField::int(id), DField::int(k), DField::varchar("x")];

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, row(1, 100)).unwrap();
    row_insert(&db, &mut thr, &table, row(2, 200)).unwrap();
    thr.commit(&db).unwrap();

    let mut thr = db.begin();
    let err = row_insert(&db, &mut thr, &table, row(3, 100)).unwrap_err();
    assert!(err.is(ErrorCode::DuplicateKey));
    let err = row_update(&db, &mut thr, &table, &[DField::int(2)], &[(1, DField::int(100))])
        .unwrap_err();
    assert!(err.is(ErrorCode::DuplicateKey));

    // the key is free again once its row is deleted
    row_delete(&db, &mut thr, &table, &[DField::int(1)]).unwrap();
    row_insert(&db, &mut thr, &table, row(3, 100)).unwrap();
    thr.commit(&db).unwrap();

    db.purge_all().unwrap();
    db.check_table(&table).unwrap();

    let mut thr = db.begin();
    let rows = small_mvcc::row::row_sel_scan_consistent(&db, &mut thr, &table).unwrap();
    thr.commit(&db).unwrap();
    let rows: Vec<(i64, i64)> = rows.iter().map(|r| (int_of(&r[0]), int_of(&r[1]))).collect();
    assert_eq!(rows, vec![(2, 200), (3, 100)]);
}

#[test]
fn test_foreign_key() {
    let db = setup();
    let parent = db
        .create_table(
            TableDef::new("parent")
                .column("id", DType::int())
                .column("name", DType::varchar(32).nullable())
                .primary_key(&[0]),
        )
        .unwrap();
    let child = db
        .create_table(
            TableDef::new("child")
                .column("id", DType::int())
                .column("parent_id", DType::int().nullable())
                .primary_key(&[0])
                .foreign_key("child_parent", &[1], "parent", &[0]),
        )
        .unwrap();
    assert_eq!(child.secondary_indexes().len(), 1);

    let mut thr = db.begin();
    let err = row_insert(&db, &mut thr, &child, vec![DField::int(1), DField::int(5)]).unwrap_err();
    assert!(err.is(ErrorCode::NoReferencedRow));

    row_insert(&db, &mut thr, &parent, vec![DField::int(5), DField::varchar("p")]).unwrap();
    row_insert(&db, &mut thr, &child, vec![DField::int(1), DField::int(5)]).unwrap();
    row_insert(&db, &mut thr, &child, vec![DField::int(2), DField::null(DType::int().nullable())])
        .unwrap();
    thr.commit(&db).unwrap();

    let mut thr = db.begin();
    let err = row_delete(&db, &mut thr, &parent, &[DField::int(5)]).unwrap_err();
    assert!(err.is(ErrorCode::RowIsReferenced));
    let err = row_update(&db, &mut thr, &parent, &[DField::int(5)], &[(0, DField::int(6))])
        .unwrap_err();
    assert!(err.is(ErrorCode::RowIsReferenced));
    let err = row_update(&db, &mut thr, &child, &[DField::int(1)], &[(1, DField::int(7))])
        .unwrap_err();
    assert!(err.is(ErrorCode::NoReferencedRow));

    // columns outside the key may change
    row_update(&db, &mut thr, &parent, &[DField::int(5)], &[(1, DField::varchar("q"))]).unwrap();

    row_delete(&db, &mut thr, &child, &[DField::int(1)]).unwrap();
    row_delete(&db, &mut thr, &parent, &[DField::int(5)]).unwrap();
    thr.commit(&db).unwrap();

    db.purge_all().unwrap();
    db.check_table(&parent).unwrap();
    db.check_table(&child).unwrap();
}
