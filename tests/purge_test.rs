mod test_utils;

use small_mvcc::{
    data::{DField, DTuple},
    row::{row_delete, row_insert, row_sel_index_entries, row_upd, row_update, UpdNode, Update},
    transaction::UPD_NODE_NO_ORD_CHANGE,
};
use test_utils::{int_of, new_indexed_table, setup};

fn note(s: &str) -> DField {
    DField::varchar(s)
}

// Purge removes the secondary entries which lost their key and the
// delete-marked records, nothing a live row still needs.
#[test]
fn test_purge_secondary() {
    let db = setup();
    let table = new_indexed_table(&db, "t", false);
    let index = &table.secondary_indexes()[0];

    let mut thr = db.begin();
    for id in 0..200 {
        row_insert(&db, &mut thr, &table, vec![DField::int(id), DField::int(id), note("a")])
            .unwrap();
    }
    thr.commit(&db).unwrap();

    let mut thr = db.begin();
    for id in 0..100 {
        // a new key for the first half
        row_update(&db, &mut thr, &table, &[DField::int(id)], &[(1, DField::int(id + 1000))])
            .unwrap();
    }
    for id in 100..150 {
        // the key stays, only the note changes
        row_update(&db, &mut thr, &table, &[DField::int(id)], &[(2, note("b"))]).unwrap();
    }
    for id in 150..200 {
        row_delete(&db, &mut thr, &table, &[DField::int(id)]).unwrap();
    }
    thr.commit(&db).unwrap();

    assert_eq!(row_sel_index_entries(&db, index).unwrap().len(), 300);
    let n_pages = db.undo_space().n_pages();
    assert!(n_pages > 0);

    db.purge_all().unwrap();
    db.check_table(&table).unwrap();
    assert_eq!(db.undo_space().n_pages(), 0);
    assert_eq!(db.trx_sys().kernel().history_len(), 0);

    let entries = row_sel_index_entries(&db, index).unwrap();
    assert!(entries.iter().all(|r| !r.is_delete_marked()));
    let keys: Vec<(i64, i64)> = entries
        .iter()
        .map(|r| (int_of(&r.fields[0]), int_of(&r.fields[1])))
        .collect();
    let expected: Vec<(i64, i64)> = (100..150)
        .map(|id| (id, id))
        .chain((0..100).map(|id| (id + 1000, id)))
        .collect();
    assert_eq!(keys, expected);

    let clust = row_sel_index_entries(&db, table.clust_index()).unwrap();
    assert_eq!(clust.len(), 150);
}

// A key which is changed away and back keeps its entry through purge.
#[test]
fn test_purge_key_comes_back() {
    let db = setup();
    let table = new_indexed_table(&db, "t", false);
    let index = &table.secondary_indexes()[0];

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, vec![DField::int(1), DField::int(5), note("a")]).unwrap();
    thr.commit(&db).unwrap();

    for k in &[6, 5] {
        let mut thr = db.begin();
        row_update(&db, &mut thr, &table, &[DField::int(1)], &[(1, DField::int(*k))]).unwrap();
        thr.commit(&db).unwrap();
    }
    db.purge_all().unwrap();

    let entries = row_sel_index_entries(&db, index).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_delete_marked());
    assert_eq!(int_of(&entries[0].fields[0]), 5);
    db.check_table(&table).unwrap();
}

// Setting a key column to the value it already has is no key change: the
// index entries stay where they are.
#[test]
fn test_same_value_update() {
    let db = setup();
    let table = new_indexed_table(&db, "t", false);
    let index = &table.secondary_indexes()[0];

    let mut thr = db.begin();
    row_insert(&db, &mut thr, &table, vec![DField::int(1), DField::int(10), note("a")]).unwrap();
    thr.commit(&db).unwrap();

    let mut thr = db.begin();
    let update = Update::from_columns(&table, &[(1, DField::int(10)), (2, note("b"))]).unwrap();
    let mut node = UpdNode::new(&table, DTuple::new(vec![DField::int(1)]), update, false);
    row_upd(&db, &mut node, &mut thr).unwrap();
    assert_ne!(node.cmpl_info & UPD_NODE_NO_ORD_CHANGE, 0);

    // the primary key too
    row_update(&db, &mut thr, &table, &[DField::int(1)], &[(0, DField::int(1))]).unwrap();
    thr.commit(&db).unwrap();

    let entries = row_sel_index_entries(&db, index).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_delete_marked());
    let clust = row_sel_index_entries(&db, table.clust_index()).unwrap();
    assert_eq!(clust.len(), 1);
    assert!(!clust[0].is_delete_marked());
    assert_eq!(clust[0].fields[4].as_str(), Some("b"));

    db.purge_all().unwrap();
    db.check_table(&table).unwrap();
}
