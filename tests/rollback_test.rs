mod test_utils;

use small_mvcc::{
    data::DField,
    row::{row_delete, row_insert, row_sel_index_entries, row_update},
    transaction::{trx_rollback_to_savepoint, TrxState},
    ErrorCode,
};
use test_utils::{
    insert_int_rows, int_of, new_indexed_table, new_int_table, scan_int_rows, setup,
};

// Rolling back a big transaction restores the tree it started from.
#[test]
fn test_rollback_all() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, (0..200).map(|k| (k * 3, k)));
    let before = scan_int_rows(&db, &table);

    let mut thr = db.begin();
    for k in 0..600 {
        if k % 3 == 0 {
            row_update(&db, &mut thr, &table, &[DField::int(k)], &[(1, DField::int(-1))]).unwrap();
        } else {
            row_insert(&db, &mut thr, &table, vec![DField::int(k), DField::int(k)]).unwrap();
        }
    }
    for k in (0..600).step_by(6) {
        row_delete(&db, &mut thr, &table, &[DField::int(k)]).unwrap();
    }
    assert!(db.stats().splits() > 0);
    thr.rollback(&db).unwrap();

    assert_eq!(thr.trx().state(), TrxState::RolledBack);
    assert_eq!(thr.trx().n_undo_recs(), 0);
    assert_eq!(db.lock_sys().n_locks(thr.trx().id()), 0);
    db.check_table(&table).unwrap();
    assert_eq!(scan_int_rows(&db, &table), before);

    // inserted records are gone for real, not only delete-marked
    let recs = row_sel_index_entries(&db, table.clust_index()).unwrap();
    assert_eq!(recs.len(), 200);
    assert!(recs.iter().all(|r| !r.is_delete_marked()));

    // rollback writes no history
    assert_eq!(db.trx_sys().kernel().history_len(), 0);
}

#[test]
fn test_savepoint() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 10)]);

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, vec![DField::int(2), DField::int(20)]).unwrap();
    thr.savepoint_take("sp");
    row_insert(&db, &mut thr, &table, vec![DField::int(3), DField::int(30)]).unwrap();
    row_update(&db, &mut thr, &table, &[DField::int(1)], &[(1, DField::int(11))]).unwrap();
    row_delete(&db, &mut thr, &table, &[DField::int(2)]).unwrap();

    trx_rollback_to_savepoint(&db, &mut thr, "sp").unwrap();
    assert!(thr.trx().is_active());

    row_insert(&db, &mut thr, &table, vec![DField::int(4), DField::int(40)]).unwrap();
    thr.commit(&db).unwrap();

    assert_eq!(scan_int_rows(&db, &table), vec![(1, 10), (2, 20), (4, 40)]);
    db.check_table(&table).unwrap();

    let mut thr = db.begin();
    let err = trx_rollback_to_savepoint(&db, &mut thr, "sp").unwrap_err();
    assert!(err.is(ErrorCode::RecordNotFound));
    thr.commit(&db).unwrap();
}

// A failed statement is rolled back alone, the transaction goes on.
#[test]
fn test_statement_rollback() {
    let db = setup();
    let table = new_indexed_table(&db, "t", true);

    let mut thr = db.begin();
    row_insert(
        &db,
        &mut thr,
        &table,
        vec![DField::int(1), DField::int(100), DField::varchar("a")],
    )
    .unwrap();

    // the clustered record goes in first, the unique index then refuses
    let err = row_insert(
        &db,
        &mut thr,
        &table,
        vec![DField::int(2), DField::int(100), DField::varchar("b")],
    )
    .unwrap_err();
    assert!(err.is(ErrorCode::DuplicateKey));
    assert_eq!(thr.error(), Some(ErrorCode::DuplicateKey));
    assert!(thr.trx().is_active());

    row_insert(
        &db,
        &mut thr,
        &table,
        vec![DField::int(2), DField::int(200), DField::varchar("c")],
    )
    .unwrap();
    thr.commit(&db).unwrap();

    let ids: Vec<i64> = row_sel_index_entries(&db, table.clust_index())
        .unwrap()
        .iter()
        .map(|r| int_of(&r.fields[0]))
        .collect();
    assert_eq!(ids, vec![1, 2]);
    db.check_table(&table).unwrap();
}

// Undo of an update moving a secondary key puts the old entry back.
#[test]
fn test_rollback_secondary() {
    let db = setup();
    let table = new_indexed_table(&db, "t", false);
    let index = &table.secondary_indexes()[0];

    let mut thr = db.begin();
    for id in 0..300 {
        row_insert(
            &db,
            &mut thr,
            &table,
            vec![DField::int(id), DField::int(id % 7), DField::null(table.columns()[2].dtype)],
        )
        .unwrap();
    }
    thr.commit(&db).unwrap();
    let before = row_sel_index_entries(&db, index).unwrap();

    let mut thr = db.begin();
    for id in 0..300 {
        row_update(&db, &mut thr, &table, &[DField::int(id)], &[(1, DField::int(1000 + id))])
            .unwrap();
    }
    let live = |recs: &[small_mvcc::storage::Rec]| {
        recs.iter().filter(|r| !r.is_delete_marked()).count()
    };
    let during = row_sel_index_entries(&db, index).unwrap();
    assert_eq!(during.len(), 600);
    assert_eq!(live(&during), 300);

    thr.rollback(&db).unwrap();
    db.check_table(&table).unwrap();

    let after = row_sel_index_entries(&db, index).unwrap();
    let live_after: Vec<_> = after.iter().filter(|r| !r.is_delete_marked()).cloned().collect();
    assert_eq!(live_after, before);

    // the clustered records carry the old keys again
    let ks: Vec<i64> = row_sel_index_entries(&db, table.clust_index())
        .unwrap()
        .iter()
        .map(|r| int_of(&r.fields[3]))
        .collect();
    assert_eq!(ks, (0..300).map(|id| id % 7).collect::<Vec<_>>());
}
