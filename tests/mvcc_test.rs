mod test_utils;

use small_mvcc::{
    data::DField,
    row::{
        row_delete, row_insert, row_sel_get_consistent, row_sel_get_with_view,
        row_sel_scan_consistent, row_update,
    },
    transaction::ReadView,
    ErrorCode,
};
use test_utils::{insert_int_rows, int_of, new_int_table, read_int, scan_int_rows, setup};

// A read view keeps seeing the rows as they were when it was opened.
#[test]
fn test_consistent_read() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, (0..100).map(|k| (k, k)));

    let mut reader = db.begin();
    assert_eq!(
        row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(7)])
            .unwrap()
            .map(|r| int_of(&r[1])),
        Some(7)
    );

    // two committed updates and a delete after the view was opened
    for v in &[70, 700] {
        let mut writer = db.begin();
        row_update(&db, &mut writer, &table, &[DField::int(7)], &[(1, DField::int(*v))]).unwrap();
        writer.commit(&db).unwrap();
    }
    let mut writer = db.begin();
    row_delete(&db, &mut writer, &table, &[DField::int(8)]).unwrap();
    row_insert(&db, &mut writer, &table, vec![DField::int(1000), DField::int(0)]).unwrap();
    writer.commit(&db).unwrap();

    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(7)]).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(7));
    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(8)]).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(8));
    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1000)]).unwrap();
    assert!(row.is_none());

    let rows = row_sel_scan_consistent(&db, &mut reader, &table).unwrap();
    assert_eq!(rows.len(), 100);
    assert!(rows.iter().all(|r| int_of(&r[0]) == int_of(&r[1])));
    reader.commit(&db).unwrap();

    // a new transaction sees everything
    assert_eq!(read_int(&db, &table, 7), Some(700));
    assert_eq!(read_int(&db, &table, 8), None);
    assert_eq!(read_int(&db, &table, 1000), Some(0));
}

// Uncommitted changes are only visible to their own transaction.
#[test]
fn test_uncommitted_invisible() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 10)]);

    let mut writer = db.begin();
    row_update(&db, &mut writer, &table, &[DField::int(1)], &[(1, DField::int(11))]).unwrap();
    row_insert(&db, &mut writer, &table, vec![DField::int(2), DField::int(20)]).unwrap();

    let own = row_sel_get_consistent(&db, &mut writer, &table, &[DField::int(1)]).unwrap();
    assert_eq!(own.map(|r| int_of(&r[1])), Some(11));

    assert_eq!(read_int(&db, &table, 1), Some(10));
    assert_eq!(read_int(&db, &table, 2), None);
    assert_eq!(scan_int_rows(&db, &table), vec![(1, 10)]);

    writer.rollback(&db).unwrap();
    assert_eq!(scan_int_rows(&db, &table), vec![(1, 10)]);
}

// Closing the read view lets the next read see newer commits.
#[test]
fn test_close_read_view() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 10)]);

    let mut reader = db.begin();
    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1)]).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(10));
    assert_eq!(db.trx_sys().kernel().n_views(), 1);

    let mut writer = db.begin();
    row_update(&db, &mut writer, &table, &[DField::int(1)], &[(1, DField::int(11))]).unwrap();
    writer.commit(&db).unwrap();

    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1)]).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(10));

    reader.trx_mut().close_read_view(&db);
    assert_eq!(db.trx_sys().kernel().n_views(), 0);
    let row = row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(1)]).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(11));

    assert_eq!(db.trx_sys().kernel().n_active(), 1);
    reader.commit(&db).unwrap();
    assert_eq!(db.trx_sys().kernel().n_active(), 0);
    assert_eq!(db.trx_sys().kernel().n_views(), 0);
}

// An open read view holds back purge of the history it may need.
#[test]
fn test_view_blocks_purge() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, (0..50).map(|k| (k, 0)));

    let mut reader = db.begin();
    row_sel_get_consistent(&db, &mut reader, &table, &[DField::int(0)]).unwrap();

    let mut writer = db.begin();
    for k in 0..50 {
        row_update(&db, &mut writer, &table, &[DField::int(k)], &[(1, DField::int(1))]).unwrap();
    }
    writer.commit(&db).unwrap();
    assert_eq!(db.trx_sys().kernel().history_len(), 1);

    db.purge_all().unwrap();
    assert_eq!(db.trx_sys().kernel().history_len(), 1);

    let rows = row_sel_scan_consistent(&db, &mut reader, &table).unwrap();
    assert!(rows.iter().all(|r| int_of(&r[1]) == 0));
    reader.commit(&db).unwrap();

    let n_pages = db.undo_space().n_pages();
    db.purge_all().unwrap();
    assert_eq!(db.trx_sys().kernel().history_len(), 0);
    assert!(db.undo_space().n_pages() < n_pages);
    assert!(scan_int_rows(&db, &table).iter().all(|(_, v)| *v == 1));
}

// A view older than what purge kept cannot build old versions anymore.
#[test]
fn test_missing_history() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 10)]);

    // three committed updates, the view sees none of them
    let mut first_writer = None;
    for v in 11..14 {
        let mut writer = db.begin();
        first_writer.get_or_insert(writer.trx().id());
        row_update(&db, &mut writer, &table, &[DField::int(1)], &[(1, DField::int(v))]).unwrap();
        writer.commit(&db).unwrap();
    }
    let first_writer = first_writer.unwrap();
    let old_view = ReadView {
        creator: 0,
        low_limit_id: first_writer,
        up_limit_id: first_writer,
        ids: Vec::new(),
        low_limit_no: 0,
    };
    let row = row_sel_get_with_view(&db, &table, &[DField::int(1)], &old_view).unwrap();
    assert_eq!(row.map(|r| int_of(&r[1])), Some(10));

    db.purge_all().unwrap();

    let err = row_sel_get_with_view(&db, &table, &[DField::int(1)], &old_view).unwrap_err();
    assert!(err.is(ErrorCode::MissingHistory));
    assert_eq!(read_int(&db, &table, 1), Some(13));
}
