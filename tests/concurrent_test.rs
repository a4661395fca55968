mod test_utils;

use std::{
    sync::Arc,
    thread::{self, sleep},
    time::{Duration, Instant},
};

use log::debug;
use rand::prelude::*;
use small_mvcc::{
    data::DField,
    row::{row_delete, row_insert, row_sel_lock_for_update, row_update},
    transaction::TrxState,
    types::TrxId,
    Config, Database, ErrorCode,
};
use test_utils::{insert_int_rows, new_int_table, read_int, scan_int_rows, setup};

fn wait_until_waiting(db: &Database, trx_id: TrxId) {
    let start = Instant::now();
    while !db.lock_sys().is_waiting(trx_id) {
        assert!(start.elapsed() < Duration::from_secs(5), "tx_{} never waited", trx_id);
        sleep(Duration::from_millis(5));
    }
}

// Lots of inserts and deletes from several threads at once, the tree must
// stay consistent and every committed change must be there.
#[test]
fn test_concurrent_insert_delete() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, (0..1000).map(|k| (k * 10, 0)));

    let (sender, receiver) = crossbeam::channel::unbounded::<i64>();
    crossbeam::scope(|s| {
        for w in 0..4i64 {
            let db = &db;
            let table = &table;
            let sender = sender.clone();
            s.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let mut keys: Vec<i64> = (0..250).map(|i| (w * 250 + i) * 10 + 1).collect();
                keys.shuffle(&mut rng);
                for chunk in keys.chunks(25) {
                    let mut thr = db.begin();
                    for k in chunk {
                        row_insert(db, &mut thr, table, vec![DField::int(*k), DField::int(w)])
                            .unwrap();
                    }
                    thr.commit(db).unwrap();
                    for k in chunk {
                        sender.send(*k).unwrap();
                    }
                }
            });
        }
        for _ in 0..2 {
            let db = &db;
            let table = &table;
            let receiver = receiver.clone();
            s.spawn(move |_| {
                // delete the inserted keys of even rank
                for k in receiver.iter().filter(|k| (k / 10) % 2 == 0) {
                    let mut thr = db.begin();
                    row_delete(db, &mut thr, table, &[DField::int(k)]).unwrap();
                    thr.commit(db).unwrap();
                }
            });
        }
        drop(sender);

        let db = &db;
        s.spawn(move |_| {
            for _ in 0..20 {
                db.purge().unwrap();
                sleep(Duration::from_millis(10));
            }
        });
    })
    .unwrap();

    db.purge_all().unwrap();
    db.check_table(&table).unwrap();

    let rows = scan_int_rows(&db, &table);
    let n_inserted = rows.iter().filter(|(id, _)| id % 10 == 1).count();
    assert_eq!(rows.len() - n_inserted, 1000);
    assert_eq!(n_inserted, 500);
    debug!("{} rows after the concurrent run", rows.len());
}

// Two writers on one row: the second waits and goes on after the first
// commits.
#[test]
fn test_lock_wait() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 0)]);

    let mut first = db.begin();
    row_update(&db, &mut first, &table, &[DField::int(1)], &[(1, DField::int(1))]).unwrap();

    let second = {
        let db = Arc::clone(&db);
        let table = Arc::clone(&table);
        thread::spawn(move || {
            let mut thr = db.begin();
            let row = row_sel_lock_for_update(&db, &mut thr, &table, &[DField::int(1)]).unwrap();
            let v = row.unwrap()[1].as_int().unwrap();
            row_update(&db, &mut thr, &table, &[DField::int(1)], &[(1, DField::int(v + 10))])
                .unwrap();
            thr.commit(&db).unwrap();
            thr
        })
    };

    // the second transaction started after the first one
    wait_until_waiting(&db, first.trx().id() + 1);
    first.commit(&db).unwrap();

    let second = second.join().unwrap();
    assert_eq!(second.trx().state(), TrxState::Committed);
    assert_eq!(read_int(&db, &table, 1), Some(11));
}

// Two transactions locking two rows in opposite order: one of them is
// chosen as the victim and rolled back, the other one finishes.
#[test]
fn test_deadlock() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 0), (2, 0)]);

    let mut t1 = db.begin();
    let mut t2 = db.begin();
    row_update(&db, &mut t1, &table, &[DField::int(1)], &[(1, DField::int(1))]).unwrap();
    row_update(&db, &mut t2, &table, &[DField::int(2)], &[(1, DField::int(2))]).unwrap();

    let t1_id = t1.trx().id();
    let handle = {
        let db = Arc::clone(&db);
        let table = Arc::clone(&table);
        thread::spawn(move || {
            row_update(&db, &mut t1, &table, &[DField::int(2)], &[(1, DField::int(1))]).unwrap();
            t1.commit(&db).unwrap();
            t1
        })
    };
    wait_until_waiting(&db, t1_id);

    let err = row_update(&db, &mut t2, &table, &[DField::int(1)], &[(1, DField::int(2))])
        .unwrap_err();
    assert!(err.is(ErrorCode::Deadlock));
    assert_eq!(t2.trx().state(), TrxState::RolledBack);
    assert_eq!(t2.error(), Some(ErrorCode::Deadlock));

    let t1 = handle.join().unwrap();
    assert_eq!(t1.trx().state(), TrxState::Committed);
    assert_eq!(scan_int_rows(&db, &table), vec![(1, 1), (2, 1)]);
}

// A waiter gives up after the configured timeout, only its statement is
// rolled back.
#[test]
fn test_lock_wait_timeout() {
    small_mvcc::utils::init_log();
    let db = Database::new(Config {
        page_size: test_utils::SMALL_PAGE_SIZE,
        lock_wait_timeout: Duration::from_millis(100),
        ..Config::default()
    })
    .unwrap();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(1, 0), (2, 0)]);

    let mut holder = db.begin();
    row_update(&db, &mut holder, &table, &[DField::int(1)], &[(1, DField::int(1))]).unwrap();

    let mut waiter = db.begin();
    row_update(&db, &mut waiter, &table, &[DField::int(2)], &[(1, DField::int(2))]).unwrap();
    let err = row_delete(&db, &mut waiter, &table, &[DField::int(1)]).unwrap_err();
    assert!(err.is(ErrorCode::LockWaitTimeout));
    assert!(waiter.trx().is_active());
    waiter.commit(&db).unwrap();
    holder.commit(&db).unwrap();

    assert_eq!(scan_int_rows(&db, &table), vec![(1, 1), (2, 2)]);
}
