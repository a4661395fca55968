mod test_utils;

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use small_mvcc::{
    data::DField,
    row::{row_delete, row_insert, row_sel_index_entries},
    srv::{PurgeWorker, Task, TaskQueue},
    transaction::TrxState,
};
use test_utils::{insert_int_rows, new_int_table, scan_int_rows, setup};

#[test]
fn test_purge_worker() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, (0..300).map(|k| (k, k)));

    let worker = PurgeWorker::start(&db, Duration::from_millis(10));

    let mut thr = db.begin();
    for k in 0..300 {
        row_delete(&db, &mut thr, &table, &[DField::int(k)]).unwrap();
    }
    thr.commit(&db).unwrap();

    let start = Instant::now();
    while db.trx_sys().kernel().history_len() > 0 {
        assert!(start.elapsed() < Duration::from_secs(10));
        sleep(Duration::from_millis(10));
    }
    assert!(worker.stop() > 0);

    assert!(row_sel_index_entries(&db, table.clust_index()).unwrap().is_empty());
    db.check_table(&table).unwrap();
}

#[test]
fn test_task_queue() {
    let db = setup();
    let table = new_int_table(&db, "t");
    insert_int_rows(&db, &table, vec![(0, 0)]);

    let queue = TaskQueue::new(&db, 2);

    // hand unfinished transactions to the workers for rollback
    for i in 1..=4 {
        let mut thr = db.begin();
        for k in 0..50 {
            row_insert(&db, &mut thr, &table, vec![DField::int(i * 100 + k), DField::int(i)])
                .unwrap();
        }
        queue.submit(Task::Rollback(thr)).unwrap();
    }
    for _ in 0..4 {
        let done = queue.recv_done(Duration::from_secs(10)).unwrap();
        assert_eq!(done.name, "rollback");
        done.result.unwrap();
        assert_eq!(done.thr.unwrap().trx().state(), TrxState::RolledBack);
    }
    assert_eq!(scan_int_rows(&db, &table), vec![(0, 0)]);

    let mut thr = db.begin();
    row_delete(&db, &mut thr, &table, &[DField::int(0)]).unwrap();
    thr.commit(&db).unwrap();

    queue.submit(Task::PurgeAll).unwrap();
    let rest = queue.shutdown();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "purge_all");
    assert!(*rest[0].result.as_ref().unwrap() > 0);

    assert!(row_sel_index_entries(&db, table.clust_index()).unwrap().is_empty());
}
