mod test_utils;

use std::sync::Arc;

use rand::prelude::*;
use small_mvcc::{
    btree::{
        btr_check_integrity, btr_cur_search_to_nth_level, btr_draw_tree, btr_n_pages_at_level,
        btr_tree_height, BtrLatchMode, BtrPcur, BtrSearchMethod,
    },
    data::{DField, DTuple, DType},
    dict::{Index, TableDef},
    row::{row::row_get_clust_rec, row_delete, row_insert},
    storage::{MlogType, Mtr, PageCurMode},
    Config, Database,
};
use test_utils::{insert_int_rows, int_of, new_indexed_table, new_int_table, scan_int_rows, setup};

// Insert rows in random order until the tree has several levels, every
// row must be found again in key order.
#[test]
fn test_insert_split() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();

    let mut keys: Vec<i64> = (0..2000).collect();
    keys.shuffle(&mut rand::thread_rng());
    insert_int_rows(&db, &table, keys.iter().map(|k| (*k, k * 10)));

    assert!(btr_tree_height(&db, index).unwrap() >= 2);
    assert!(db.stats().splits() > 0);
    assert!(db.stats().root_raises() > 0);
    btr_check_integrity(&db, index).unwrap();
    let depiction = btr_draw_tree(&db, index, -1).unwrap();
    assert!(depiction.contains("leaf"));

    let rows = scan_int_rows(&db, &table);
    assert_eq!(rows.len(), 2000);
    for (i, (id, v)) in rows.iter().enumerate() {
        assert_eq!(*id, i as i64);
        assert_eq!(*v, id * 10);
    }
}

// A page holding a single record takes a second one without keeping the
// update reserve free.
#[test]
fn test_single_record_page_no_split() {
    let db = setup();
    let table = db
        .create_table(
            TableDef::new("t")
                .column("id", DType::int())
                .column("note", DType::varchar(0))
                .primary_key(&[0]),
        )
        .unwrap();
    let index = table.clust_index();
    let note = "x".repeat(400);

    let mut thr = db.begin();
    for id in 0..2 {
        row_insert(&db, &mut thr, &table, vec![DField::int(id), DField::varchar(&note)]).unwrap();
    }
    assert_eq!(db.stats().splits(), 0);
    assert_eq!(btr_tree_height(&db, index).unwrap(), 1);

    row_insert(&db, &mut thr, &table, vec![DField::int(2), DField::varchar(&note)]).unwrap();
    thr.commit(&db).unwrap();
    assert_eq!(btr_tree_height(&db, index).unwrap(), 2);
    btr_check_integrity(&db, index).unwrap();
}

// Sequential inserts fill pages from the left, the leaf count stays close
// to the minimum.
#[test]
fn test_insert_sequential() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();

    insert_int_rows(&db, &table, (0..1000).map(|k| (k, k)));
    btr_check_integrity(&db, index).unwrap();

    let n_leaves = btr_n_pages_at_level(&db, index, 0).unwrap();
    assert!(n_leaves > 1);

    // descending keys all land on the rightmost leaf
    insert_int_rows(&db, &table, (1000..1200).rev().map(|k| (k, k)));
    btr_check_integrity(&db, index).unwrap();
    assert!(btr_n_pages_at_level(&db, index, 0).unwrap() >= n_leaves);
}

// Deleting and purging most rows merges and discards pages.
#[test]
fn test_delete_merge() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();

    insert_int_rows(&db, &table, (0..1500).map(|k| (k, k)));
    let n_leaves = btr_n_pages_at_level(&db, index, 0).unwrap();

    let mut rng = rand::thread_rng();
    let mut victims: Vec<i64> = (0..1500).filter(|k| k % 10 != 0).collect();
    victims.shuffle(&mut rng);

    let mut thr = db.begin();
    for k in &victims {
        row_delete(&db, &mut thr, &table, &[DField::int(*k)]).unwrap();
    }
    thr.commit(&db).unwrap();

    // delete-marked records stay until purge
    assert_eq!(btr_n_pages_at_level(&db, index, 0).unwrap(), n_leaves);
    assert_eq!(scan_int_rows(&db, &table).len(), 150);

    db.purge_all().unwrap();
    btr_check_integrity(&db, index).unwrap();

    assert!(btr_n_pages_at_level(&db, index, 0).unwrap() < n_leaves);
    assert!(db.stats().merges() + db.stats().discards() > 0);

    let rows = scan_int_rows(&db, &table);
    assert_eq!(rows.len(), 150);
    assert!(rows.iter().all(|(id, _)| id % 10 == 0));
}

// Empty the whole table: the tree shrinks back to a single page.
#[test]
fn test_delete_all() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();

    insert_int_rows(&db, &table, (0..800).map(|k| (k, k)));
    assert!(btr_tree_height(&db, index).unwrap() >= 2);

    let mut thr = db.begin();
    for k in 0..800 {
        row_delete(&db, &mut thr, &table, &[DField::int(k)]).unwrap();
    }
    thr.commit(&db).unwrap();
    db.purge_all().unwrap();

    btr_check_integrity(&db, index).unwrap();
    assert!(scan_int_rows(&db, &table).is_empty());
    assert_eq!(btr_n_pages_at_level(&db, index, 0).unwrap(), 1);
    assert_eq!(btr_tree_height(&db, index).unwrap(), 1);
    assert!(db.stats().lifts() > 0);

    // the tree is usable afterwards
    insert_int_rows(&db, &table, (0..300).map(|k| (k, -k)));
    btr_check_integrity(&db, index).unwrap();
    assert_eq!(scan_int_rows(&db, &table).len(), 300);
}

// A stored cursor position survives splits caused by other inserts.
#[test]
fn test_pcur_restore() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();

    insert_int_rows(&db, &table, (0..400).map(|k| (k * 2, 0)));

    let mut mtr = Mtr::start(&db);
    let mut pcur =
        BtrPcur::open_at_index_side(true, index, BtrLatchMode::SearchLeaf, &mut mtr).unwrap();
    let mut seen = Vec::new();
    for _ in 0..100 {
        assert!(pcur.move_to_next_user_rec(&mut mtr).unwrap());
        seen.push(int_of(&pcur.get_rec(&mtr).unwrap().fields[0]));
    }
    pcur.store_position(&mtr).unwrap();
    pcur.commit_specify_mtr(mtr);

    // odd keys land between the ones already seen and the rest
    {
        let mut thr = db.begin();
        for k in 0..400 {
            row_insert(&db, &mut thr, &table, vec![DField::int(k * 2 + 1), DField::int(1)])
                .unwrap();
        }
        thr.commit(&db).unwrap();
    }
    assert!(db.stats().splits() > 0);

    let mut mtr = Mtr::start(&db);
    let same = pcur
        .restore_position(&db, BtrLatchMode::SearchLeaf, &mut mtr)
        .unwrap();
    assert!(same);
    assert_eq!(int_of(&pcur.get_rec(&mtr).unwrap().fields[0]), 198);

    while pcur.move_to_next_user_rec(&mut mtr).unwrap() {
        seen.push(int_of(&pcur.get_rec(&mtr).unwrap().fields[0]));
    }
    mtr.commit();

    let expected: Vec<i64> = (0..100).map(|k| k * 2).chain(199..800).collect();
    assert_eq!(seen, expected);
}

// Walking backwards from the right end crosses every leaf and sees the
// keys in descending order.
#[test]
fn test_pcur_backward_scan() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();
    insert_int_rows(&db, &table, (0..800).map(|k| (k, k + 1)));
    assert!(btr_n_pages_at_level(&db, index, 0).unwrap() > 2);

    let mut mtr = Mtr::start(&db);
    let mut pcur =
        BtrPcur::open_at_index_side(false, index, BtrLatchMode::SearchLeaf, &mut mtr).unwrap();
    assert!(pcur.is_after_last_in_tree(&mtr).unwrap());

    let mut seen = Vec::new();
    while pcur.move_to_prev_user_rec(&db, &mut mtr).unwrap() {
        let rec = pcur.get_rec(&mtr).unwrap();
        assert_eq!(int_of(&rec.fields[3]), int_of(&rec.fields[0]) + 1);
        seen.push(int_of(&rec.fields[0]));
    }
    assert!(pcur.is_before_first_in_tree(&mtr).unwrap());
    assert_eq!(pcur.latch_mode(), BtrLatchMode::SearchLeaf);
    mtr.commit();

    assert_eq!(seen, (0..800).rev().collect::<Vec<i64>>());
}

// A random position is always on a user record, and it can be stored
// and restored after the leaf latch was let go.
#[test]
fn test_open_at_rnd_pos() {
    let db = setup();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();
    insert_int_rows(&db, &table, (0..300).map(|k| (k, k * 3)));

    for _ in 0..20 {
        let mut mtr = Mtr::start(&db);
        let mut pcur = BtrPcur::open_at_rnd_pos(index, BtrLatchMode::SearchLeaf, &mut mtr).unwrap();
        assert!(pcur.is_on_user_rec(&mtr).unwrap());
        let (id, v) = {
            let rec = pcur.get_rec(&mtr).unwrap();
            (int_of(&rec.fields[0]), int_of(&rec.fields[3]))
        };
        assert_eq!(v, id * 3);
        pcur.store_position(&mtr).unwrap();
        pcur.release_leaf(&mut mtr);
        mtr.commit();

        let mut mtr = Mtr::start(&db);
        assert!(pcur
            .restore_position(&db, BtrLatchMode::SearchLeaf, &mut mtr)
            .unwrap());
        assert_eq!(int_of(&pcur.get_rec(&mtr).unwrap().fields[0]), id);
        mtr.commit();
    }
}

// A secondary entry leads back to its clustered record.
#[test]
fn test_clust_rec_from_secondary() {
    let db = setup();
    let table = new_indexed_table(&db, "t", false);
    let index = &table.secondary_indexes()[0];

    let mut thr = db.begin();
    for id in 0..100 {
        let row = vec![DField::int(id), DField::int(id % 7), DField::varchar("n")];
        row_insert(&db, &mut thr, &table, row).unwrap();
    }
    thr.commit(&db).unwrap();

    let mut mtr = Mtr::start(&db);
    let pcur = row_get_clust_rec(
        &db,
        &table,
        index,
        &[DField::int(42 % 7), DField::int(42)],
        BtrLatchMode::SearchLeaf,
        &mut mtr,
    )
    .unwrap()
    .unwrap();
    let rec = pcur.get_rec(&mtr).unwrap();
    assert_eq!(int_of(&rec.fields[0]), 42);
    assert_eq!(int_of(&rec.fields[3]), 0);

    let missing = row_get_clust_rec(
        &db,
        &table,
        index,
        &[DField::int(0), DField::int(1000)],
        BtrLatchMode::SearchLeaf,
        &mut mtr,
    )
    .unwrap();
    assert!(missing.is_none());
    mtr.commit();
}

// Every change of a page goes through the redo log.
#[test]
fn test_redo_records() {
    let db = setup();
    let table = new_int_table(&db, "t");

    let lsn = db.log_sys().lsn();
    insert_int_rows(&db, &table, vec![(1, 1), (2, 2)]);
    assert!(db.log_sys().count_since(lsn, MlogType::RecInsert) >= 2);
    assert_eq!(db.log_sys().count_since(lsn, MlogType::RecDelMark), 0);

    let lsn = db.log_sys().lsn();
    let mut thr = db.begin();
    row_delete(&db, &mut thr, &table, &[DField::int(1)]).unwrap();
    thr.commit(&db).unwrap();
    assert_eq!(db.log_sys().count_since(lsn, MlogType::RecDelMark), 1);
    assert!(db.log_sys().lsn() > lsn);
}

fn search_clust(db: &Database, index: &Arc<Index>, id: i64) -> (i64, BtrSearchMethod, u32) {
    let mut mtr = Mtr::start(db);
    let tuple = DTuple::new(vec![DField::int(id)]);
    let cur = btr_cur_search_to_nth_level(
        db,
        index,
        0,
        &tuple,
        PageCurMode::LE,
        BtrLatchMode::SearchLeaf,
        &mut mtr,
    )
    .unwrap();
    let found = int_of(&cur.user_rec(&mtr).unwrap().fields[0]);
    mtr.commit();
    (found, cur.method, cur.page_id.page_no)
}

// Point lookups go straight to the leaf once they have been seen, and
// entries left behind by splits are noticed and replaced.
#[test]
fn test_adaptive_hash_search() {
    small_mvcc::utils::init_log();
    let db = Database::new(Config {
        page_size: test_utils::SMALL_PAGE_SIZE,
        adaptive_hash: true,
        ..Config::default()
    })
    .unwrap();
    let table = new_int_table(&db, "t");
    let index = table.clust_index();
    insert_int_rows(&db, &table, (0..300).map(|k| (k * 2, 0)));

    for k in 0..300 {
        let (found, method, _) = search_clust(&db, index, k * 2);
        assert_eq!(found, k * 2);
        assert_eq!(method, BtrSearchMethod::Binary);
    }
    assert!(db.ahi().len() >= 300);

    let hits = db.ahi().hits();
    for k in 0..300 {
        let (found, method, page_no) = search_clust(&db, index, k * 2);
        assert_eq!(found, k * 2);
        assert_eq!(method, BtrSearchMethod::HashHit { page_no });
    }
    assert_eq!(db.ahi().hits(), hits + 300);

    // odd keys split the leaves, half of the records move
    let splits = db.stats().splits();
    insert_int_rows(&db, &table, (0..300).map(|k| (k * 2 + 1, 1)));
    assert!(db.stats().splits() > splits);
    btr_check_integrity(&db, index).unwrap();

    let (hits, misses) = (db.ahi().hits(), db.ahi().misses());
    let (mut n_hit, mut n_miss) = (0, 0);
    for k in 0..300 {
        let (found, method, page_no) = search_clust(&db, index, k * 2);
        assert_eq!(found, k * 2);
        match method {
            BtrSearchMethod::HashHit { page_no: hashed } => {
                assert_eq!(hashed, page_no);
                n_hit += 1;
            }
            BtrSearchMethod::HashMiss => n_miss += 1,
            other => panic!("lookup of {} used {:?}", k * 2, other),
        }
    }
    assert!(n_miss > 0);
    assert_eq!(db.ahi().hits(), hits + n_hit);
    assert_eq!(db.ahi().misses(), misses + n_miss);

    // a miss stores the new page
    let hits = db.ahi().hits();
    for k in 0..300 {
        let (_, method, _) = search_clust(&db, index, k * 2);
        assert!(matches!(method, BtrSearchMethod::HashHit { .. }));
    }
    assert_eq!(db.ahi().hits(), hits + 300);
}
