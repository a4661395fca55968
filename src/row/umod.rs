use std::sync::Arc;

use log::{debug, warn};

use super::{
    ins::row_ins_index_entry_with_flags,
    row::{
        row_build, row_build_index_entry, row_get_rec_roll_ptr, row_remove_index_entry,
        row_search_index_entry, row_search_on_row_ref,
    },
    upd::{rec_apply_update, row_upd_changes_ord_field_binary, row_upd_clust_rec, Update},
    vers::row_vers_sec_entry_needed,
};
use crate::{
    btree::{
        btr_cur_del_mark_set_sec_rec, btr_cur_optimistic_delete, BtrLatchMode,
        BTR_KEEP_SYS_FLAG, BTR_NO_LOCKING_FLAG, BTR_NO_UNDO_LOG_FLAG,
    },
    data::DTuple,
    database::Database,
    dict::{Index, Table},
    error::SmallError,
    que::QueThr,
    storage::Mtr,
    transaction::{
        trx_undo_update_rec_get_update, RollPtr, TrxUndoRec, UndoRecType, UPD_NODE_NO_ORD_CHANGE,
    },
    types::SmallResult,
};

const UNDO_FLAGS: u32 = BTR_NO_LOCKING_FLAG | BTR_NO_UNDO_LOG_FLAG | BTR_KEEP_SYS_FLAG;

/// Remove an entry the undone change put into a secondary index, or
/// only delete-mark it when an older version of the row still has it.
fn row_undo_mod_del_mark_or_remove_sec(
    db: &Database,
    table: &Table,
    index: &Arc<Index>,
    entry: &DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    {
        let mut mtr = Mtr::start(db);
        let cur = match row_search_index_entry(db, index, entry, BtrLatchMode::ModifyLeaf, &mut mtr)? {
            Some(cur) => cur,
            None => return Ok(()),
        };
        if row_vers_sec_entry_needed(db, table, index, entry, false)? {
            btr_cur_del_mark_set_sec_rec(db, BTR_NO_LOCKING_FLAG, &cur, true, thr, &mut mtr)?;
            mtr.commit();
            return Ok(());
        }
        if btr_cur_optimistic_delete(db, &cur, &mut mtr)? {
            mtr.commit();
            return Ok(());
        }
    }

    row_remove_index_entry(db, index, entry, true, |_| {
        Ok(!row_vers_sec_entry_needed(db, table, index, entry, false)?)
    })?;
    Ok(())
}

/// Bring back an entry the undone change delete-marked, inserting it
/// again if it is gone.
fn row_undo_mod_del_unmark_sec(
    db: &Database,
    index: &Arc<Index>,
    entry: &DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    {
        let mut mtr = Mtr::start(db);
        if let Some(cur) = row_search_index_entry(db, index, entry, BtrLatchMode::ModifyLeaf, &mut mtr)? {
            if cur.user_rec(&mtr)?.is_delete_marked() {
                btr_cur_del_mark_set_sec_rec(db, BTR_NO_LOCKING_FLAG, &cur, false, thr, &mut mtr)?;
            }
            mtr.commit();
            return Ok(());
        }
    }

    warn!(
        "{}: entry {:?} of {} vanished before rollback, insert it again",
        thr.trx(),
        entry,
        index.name()
    );
    let mut entry = entry.clone();
    row_ins_index_entry_with_flags(
        db,
        BTR_NO_LOCKING_FLAG | BTR_NO_UNDO_LOG_FLAG,
        index,
        &mut entry,
        thr,
    )
}

/// A restored delete-marked record whose delete-marking nobody can see
/// the other side of anymore is removed, purge would never find it.
fn row_undo_mod_remove_clust_if_poss(
    db: &Database,
    clust: &Arc<Index>,
    ref_tuple: &DTuple,
    undo_rec: &TrxUndoRec,
) -> SmallResult {
    if db
        .purge_sys()
        .latch()
        .read_recursive()
        .update_undo_must_exist(undo_rec.old_trx_id)
    {
        return Ok(());
    }
    let removed = row_remove_index_entry(db, clust, ref_tuple, false, |rec| {
        Ok(rec.is_delete_marked())
    })?;
    if removed {
        debug!("removed restored delete-marked {:?}", ref_tuple);
    }
    Ok(())
}

/// Undo an update or delete-mark of a clustered record: fix the
/// secondary indexes, then restore the old version of the clustered
/// record. Nothing is done when the record no longer carries `roll_ptr`.
pub fn row_undo_mod(
    db: &Database,
    undo_rec: &TrxUndoRec,
    roll_ptr: RollPtr,
    thr: &mut QueThr,
) -> SmallResult {
    let table = match db.dict().get_table(undo_rec.table_id) {
        Some(table) => table,
        None => return Ok(()),
    };
    let clust = Arc::clone(table.clust_index());
    let mut ref_tuple = DTuple::new(undo_rec.ref_fields.clone());
    ref_tuple.set_n_fields_cmp(clust.n_uniq());
    let update = trx_undo_update_rec_get_update(&clust, undo_rec)?;

    // step 1: the current and the old row
    let (mut pcur, row, old_row) = {
        let mut mtr = Mtr::start(db);
        let mut pcur = match row_search_on_row_ref(
            db,
            &clust,
            &ref_tuple,
            BtrLatchMode::SearchLeaf,
            &mut mtr,
        )? {
            Some(pcur) => pcur,
            None => return Ok(()),
        };
        let rec = pcur.get_rec(&mtr)?;
        if row_get_rec_roll_ptr(&clust, rec)? != roll_ptr {
            debug!("undo of {:?}: record changed since, skip", ref_tuple);
            return Ok(());
        }
        let row = row_build(&table, rec)?;
        let mut old = rec.clone();
        rec_apply_update(&mut old, &update);
        let old_row = row_build(&table, &old)?;
        pcur.store_position(&mtr)?;
        pcur.commit_specify_mtr(mtr);
        (pcur, row, old_row)
    };

    // step 2: secondary indexes
    match undo_rec.rec_type {
        UndoRecType::DelMark => {
            for index in table.secondary_indexes() {
                let entry = row_build_index_entry(&row, index)?;
                row_undo_mod_del_unmark_sec(db, index, &entry, thr)?;
            }
        }
        UndoRecType::UpdDel => {
            for index in table.secondary_indexes() {
                let entry = row_build_index_entry(&row, index)?;
                row_undo_mod_del_mark_or_remove_sec(db, &table, index, &entry, thr)?;
            }
        }
        UndoRecType::UpdExist => {
            if undo_rec.cmpl_info & UPD_NODE_NO_ORD_CHANGE == 0 {
                let user_update = user_fields(&clust, &update);
                for index in table.secondary_indexes() {
                    let changed =
                        row_upd_changes_ord_field_binary(Some(&row), &clust, index, &user_update);
                    if !changed {
                        continue;
                    }
                    let entry = row_build_index_entry(&row, index)?;
                    row_undo_mod_del_mark_or_remove_sec(db, &table, index, &entry, thr)?;
                    let old_entry = row_build_index_entry(&old_row, index)?;
                    row_undo_mod_del_unmark_sec(db, index, &old_entry, thr)?;
                }
            }
        }
        UndoRecType::Insert => {
            return Err(SmallError::internal("insert undo record in modify undo"));
        }
    }

    // step 3: the clustered record
    row_upd_clust_rec(db, UNDO_FLAGS, &mut pcur, &update, undo_rec.cmpl_info, thr)?;
    if undo_rec.rec_type == UndoRecType::UpdDel {
        row_undo_mod_remove_clust_if_poss(db, &clust, &ref_tuple, undo_rec)?;
    }

    debug!(
        "{}: undo {:?} no {} on {:?} done",
        thr.trx(),
        undo_rec.rec_type,
        undo_rec.undo_no,
        ref_tuple
    );
    Ok(())
}

/// The update without its system fields.
fn user_fields(clust: &Index, update: &Update) -> Update {
    let mut user = Update::new(update.info_bits);
    for f in update.fields.iter().filter(|f| !clust.field(f.field_no).is_sys()) {
        user.push(f.field_no, f.new_val.clone());
    }
    user
}
