use std::{cmp::Ordering, sync::Arc};

use log::debug;

use super::{
    row::{row_build_index_entry, row_cols_tuple},
    upd::{row_upd_build_difference_binary, row_upd_build_sec_rec_difference_binary},
};
use crate::{
    btree::{
        btr_cur_del_mark_set_sec_rec, btr_cur_optimistic_insert, btr_cur_optimistic_update,
        btr_cur_pessimistic_insert, btr_cur_pessimistic_update, btr_cur_search_to_nth_level,
        btr_store_big_rec_extern_fields, BtrCur, BtrLatchMode, BtrPcur, BTR_NO_LOCKING_FLAG,
        BTR_NO_UNDO_LOG_FLAG,
    },
    data::{cmp_dtuple_rec, DTuple},
    database::Database,
    dict::{Index, Table},
    error::{ErrorCode, SmallError},
    lock::{LockMode, RecLockKey},
    que::{with_lock_wait, QueThr},
    storage::{Mtr, PageCurMode},
    types::SmallResult,
    utils::HandyRwLock,
};

fn duplicate(index: &Index, entry: &DTuple) -> SmallError {
    SmallError::new(
        ErrorCode::DuplicateKey,
        &format!("duplicate {:?} in {}", entry, index.name()),
    )
}

/// Whether `index` holds a record which is not delete-marked and whose
/// first fields equal `values`. The records looked at are S-locked.
pub(crate) fn row_ins_foreign_has_match(
    db: &Database,
    index: &Arc<Index>,
    values: &DTuple,
    thr: &mut QueThr,
) -> Result<bool, SmallError> {
    let mut tuple = values.clone();
    tuple.set_n_fields_cmp(values.n_fields());

    with_lock_wait(db, thr, |thr| {
        let mut mtr = Mtr::start(db);
        let mut pcur = BtrPcur::open_on_user_rec(
            db,
            index,
            &tuple,
            PageCurMode::GE,
            BtrLatchMode::SearchLeaf,
            &mut mtr,
        )?;
        loop {
            if !pcur.is_on_user_rec(&mtr)? {
                return Ok(false);
            }
            let (key, deleted) = {
                let rec = pcur.get_rec(&mtr)?;
                if cmp_dtuple_rec(&tuple, &rec.fields, rec.info_bits) != Ordering::Equal {
                    return Ok(false);
                }
                (
                    RecLockKey::new(index.id(), &rec.to_tuple(), index.n_uniq()),
                    rec.is_delete_marked(),
                )
            };
            db.lock_sys().lock_rec(thr.trx().id(), key, LockMode::S)?;
            if !deleted {
                return Ok(true);
            }
            if !pcur.move_to_next_user_rec(&mut mtr)? {
                return Ok(false);
            }
        }
    })
}

/// Every foreign key of the table must find its parent row. Keys with a
/// NULL column are not checked.
fn row_ins_check_foreign_constraints(
    db: &Database,
    table: &Table,
    row: &DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    if table.foreign_keys().is_empty() {
        return Ok(());
    }
    let _guard = db.dict().foreign_check_latch().rl();
    for fk in table.foreign_keys() {
        let values = row_cols_tuple(row, &fk.child_cols);
        if values.contains_null() {
            continue;
        }
        if !row_ins_foreign_has_match(db, &fk.parent_index, &values, thr)? {
            return Err(SmallError::new(
                ErrorCode::NoReferencedRow,
                &format!("no parent {:?} for {}", values, fk.name),
            ));
        }
    }
    Ok(())
}

/// Look for a live record of a unique secondary index with the same
/// unique fields as `entry` but another primary key. The unique prefix
/// is x-locked first, the records found are S-locked.
fn row_ins_scan_sec_index_for_duplicate(
    db: &Database,
    index: &Arc<Index>,
    entry: &DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    let n_unique = index.n_unique_check();
    let prefix = entry.prefix(n_unique);
    if prefix.contains_null() {
        // NULLs never collide
        return Ok(());
    }

    with_lock_wait(db, thr, |thr| {
        let trx_id = thr.trx().id();
        db.lock_sys()
            .lock_rec(trx_id, RecLockKey::new(index.id(), &prefix, n_unique), LockMode::X)?;

        let mut mtr = Mtr::start(db);
        let mut pcur = BtrPcur::open_on_user_rec(
            db,
            index,
            &prefix,
            PageCurMode::GE,
            BtrLatchMode::SearchLeaf,
            &mut mtr,
        )?;
        loop {
            if !pcur.is_on_user_rec(&mtr)? {
                return Ok(());
            }
            let (key, deleted, same_entry) = {
                let rec = pcur.get_rec(&mtr)?;
                if cmp_dtuple_rec(&prefix, &rec.fields, rec.info_bits) != Ordering::Equal {
                    return Ok(());
                }
                let mut full = entry.clone();
                full.set_n_fields_cmp(index.n_uniq());
                (
                    RecLockKey::new(index.id(), &rec.to_tuple(), index.n_uniq()),
                    rec.is_delete_marked(),
                    cmp_dtuple_rec(&full, &rec.fields, rec.info_bits) == Ordering::Equal,
                )
            };
            db.lock_sys().lock_rec(trx_id, key, LockMode::S)?;
            if !deleted && !same_entry {
                return Err(duplicate(index, entry));
            }
            if !pcur.move_to_next_user_rec(&mut mtr)? {
                return Ok(());
            }
        }
    })
}

/// The entry equals a delete-marked record on the unique fields: turn
/// that record into the entry instead of inserting.
fn row_ins_index_entry_by_modify(
    db: &Database,
    flags: u32,
    latch_mode: BtrLatchMode,
    cur: &BtrCur,
    entry: &DTuple,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> SmallResult {
    let index = Arc::clone(&cur.index);
    let rec = cur.user_rec(mtr)?.clone();

    if !index.is_clustered() {
        let update = row_upd_build_sec_rec_difference_binary(entry, &rec);
        if !update.is_empty() {
            return Err(SmallError::internal(&format!(
                "{:?} and {:?} differ beyond their unique fields in {}",
                entry,
                rec,
                index.name()
            )));
        }
        return btr_cur_del_mark_set_sec_rec(db, flags, cur, false, thr, mtr);
    }

    let update = row_upd_build_difference_binary(&index, entry, &rec);
    debug!("{}: insert by modify on {}, {:?}", thr.trx(), index.name(), update);
    if latch_mode == BtrLatchMode::ModifyLeaf {
        return btr_cur_optimistic_update(db, flags, cur, &update, 0, thr, mtr).map_err(|e| {
            if e.is_retryable() {
                SmallError::new(ErrorCode::Fail, "insert by modify needs a tree update")
            } else {
                e
            }
        });
    }

    let mut cur = cur.clone();
    if let Some(big_rec) = btr_cur_pessimistic_update(db, flags, &mut cur, &update, 0, thr, mtr)? {
        btr_store_big_rec_extern_fields(db, &cur, &big_rec, mtr)?;
    }
    Ok(())
}

/// One attempt to insert `entry`, latching the leaf only or the whole
/// tree. `Fail` means the leaf attempt has to be repeated on the tree.
fn row_ins_index_entry_low(
    db: &Database,
    flags: u32,
    latch_mode: BtrLatchMode,
    index: &Arc<Index>,
    entry: &mut DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    let mut mtr = Mtr::start(db);
    let n_uniq = index.n_uniq();
    entry.set_n_fields_cmp(n_uniq);
    let cur = btr_cur_search_to_nth_level(
        db,
        index,
        0,
        entry,
        PageCurMode::LE,
        latch_mode,
        &mut mtr,
    )?;

    // step 1: a record with the same ordering key
    if cur.is_exact_match(&mtr, n_uniq)? {
        let (key, deleted) = {
            let rec = cur.user_rec(&mtr)?;
            (
                RecLockKey::new(index.id(), &rec.to_tuple(), n_uniq),
                rec.is_delete_marked(),
            )
        };
        if flags & BTR_NO_LOCKING_FLAG == 0 {
            db.lock_sys().lock_rec(thr.trx().id(), key, LockMode::X)?;
        }
        if !deleted {
            return Err(duplicate(index, entry));
        }
        row_ins_index_entry_by_modify(db, flags, latch_mode, &cur, entry, thr, &mut mtr)?;
        mtr.commit();
        return Ok(());
    }

    // step 2: a fresh record
    let mut flags = flags;
    if !index.is_clustered() {
        flags |= BTR_NO_UNDO_LOG_FLAG;
    }
    let (new_cur, big_rec) = if latch_mode == BtrLatchMode::ModifyTree {
        btr_cur_pessimistic_insert(db, flags, &cur, entry, thr, &mut mtr)?
    } else {
        btr_cur_optimistic_insert(db, flags, &cur, entry, thr, &mut mtr)?
    };
    if let Some(big_rec) = big_rec {
        btr_store_big_rec_extern_fields(db, &new_cur, &big_rec, &mut mtr)?;
    }
    mtr.commit();
    Ok(())
}

pub(crate) fn row_ins_index_entry_with_flags(
    db: &Database,
    flags: u32,
    index: &Arc<Index>,
    entry: &mut DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    if !index.is_clustered() && index.is_unique() && flags & BTR_NO_LOCKING_FLAG == 0 {
        row_ins_scan_sec_index_for_duplicate(db, index, entry, thr)?;
    }

    with_lock_wait(db, thr, |thr| {
        match row_ins_index_entry_low(db, flags, BtrLatchMode::ModifyLeaf, index, entry, thr) {
            Err(e) if e.is(ErrorCode::Fail) => {
                row_ins_index_entry_low(db, flags, BtrLatchMode::ModifyTree, index, entry, thr)
            }
            r => r,
        }
    })
}

/// Insert an entry into an index, checking uniqueness. An entry equal
/// to a delete-marked record on the unique fields takes that record
/// over.
pub fn row_ins_index_entry(
    db: &Database,
    index: &Arc<Index>,
    entry: &mut DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    row_ins_index_entry_with_flags(db, 0, index, entry, thr)
}

/// Insert a row, given by column, into every index of the table.
pub fn row_ins(db: &Database, table: &Table, row: DTuple, thr: &mut QueThr) -> SmallResult {
    if row.n_fields() != table.n_cols() {
        return Err(SmallError::internal(&format!(
            "{} has {} columns, got {}",
            table.name(),
            table.n_cols(),
            row.n_fields()
        )));
    }
    let mut row = row;
    for (field, column) in row.fields_mut().iter_mut().zip(table.columns()) {
        field.set_dtype(column.dtype);
        field.check()?;
    }

    // step 1: parents first
    row_ins_check_foreign_constraints(db, table, &row, thr)?;

    // step 2: clustered index
    let mut entry = row_build_index_entry(&row, table.clust_index())?;
    row_ins_index_entry(db, table.clust_index(), &mut entry, thr)?;

    // step 3: secondary indexes
    for index in table.secondary_indexes() {
        let mut entry = row_build_index_entry(&row, index)?;
        row_ins_index_entry(db, index, &mut entry, thr)?;
    }

    debug!("{}: inserted {:?} into {}", thr.trx(), row, table.name());
    Ok(())
}
