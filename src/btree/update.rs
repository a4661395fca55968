use std::sync::Arc;

use log::debug;

use super::{
    cursor::BtrCur,
    delete::btr_cur_compress_if_useful,
    ext::{btr_cur_unmark_extern_fields, btr_rec_free_updated_extern_fields},
    insert::btr_cur_pessimistic_insert,
    BTR_KEEP_SYS_FLAG, BTR_NO_LOCKING_FLAG, BTR_NO_UNDO_LOG_FLAG,
};
use crate::{
    data::{dtuple_convert_big_rec, BigRec, DField},
    database::Database,
    dict::{Index, DATA_TRX_ID_LEN},
    error::{ErrorCode, SmallError},
    io::SmallWriter,
    lock::{LockMode, RecLockKey},
    que::QueThr,
    row::upd::{rec_apply_update, row_upd_changes_field_size_or_external, Update},
    storage::{page_max_rec_size, MlogType, Mtr, Rec},
    transaction::{trx_undo_report_row_operation, RollPtr, UndoOp},
    types::{SmallResult, TrxId},
};

/// Write DB_TRX_ID and DB_ROLL_PTR into the fields of a clustered index
/// record.
pub(crate) fn row_upd_rec_sys_fields(
    index: &Index,
    fields: &mut [DField],
    trx_id: TrxId,
    roll_ptr: &RollPtr,
) -> SmallResult {
    match (index.trx_id_pos(), index.roll_ptr_pos()) {
        (Some(t), Some(r)) if r < fields.len() => {
            fields[t] = DField::sys_u64(trx_id, DATA_TRX_ID_LEN);
            fields[r] = roll_ptr.to_field();
            Ok(())
        }
        _ => Err(SmallError::internal(&format!(
            "no system fields in {}",
            index.name()
        ))),
    }
}

fn rec_body(cur: &BtrCur) -> Vec<u8> {
    let mut writer = SmallWriter::new();
    writer.write_u32(cur.page_id.page_no);
    writer.write_u16(cur.slot as u16);
    writer.into_bytes()
}

fn rec_lock_key(index: &Index, rec: &Rec) -> RecLockKey {
    RecLockKey::new(index.id(), &rec.to_tuple(), index.n_uniq())
}

/// X-lock the clustered record under the cursor and write the undo
/// record of its update.
fn btr_cur_upd_lock_and_undo(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    update: &Update,
    cmpl_info: u8,
    thr: &mut QueThr,
    mtr: &Mtr,
) -> Result<Option<RollPtr>, SmallError> {
    let index = &cur.index;
    if !index.is_clustered() {
        return Err(SmallError::internal(&format!(
            "update of a secondary index record in {}",
            index.name()
        )));
    }
    let rec = cur.user_rec(mtr)?;
    if flags & BTR_NO_LOCKING_FLAG == 0 {
        db.lock_sys()
            .lock_rec(thr.trx().id(), rec_lock_key(index, rec), LockMode::X)?;
    }
    trx_undo_report_row_operation(
        db,
        thr.trx_mut(),
        flags,
        index,
        UndoOp::Modify {
            rec,
            update: Some(update),
            cmpl_info,
        },
    )
}

/// Update a clustered record in place. No field may change its size and
/// no external field may be updated.
pub fn btr_cur_update_in_place(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    update: &Update,
    cmpl_info: u8,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> SmallResult {
    if row_upd_changes_field_size_or_external(cur.user_rec(mtr)?, update) {
        return Err(SmallError::new(
            ErrorCode::Fail,
            "in-place update would change the record size",
        ));
    }

    let roll_ptr = btr_cur_upd_lock_and_undo(db, flags, cur, update, cmpl_info, thr, mtr)?;

    let index = Arc::clone(&cur.index);
    let trx_id = thr.trx().id();
    let slot = cur.slot;
    let rec = cur
        .page_mut(mtr)?
        .rec_mut(slot)
        .ok_or_else(|| SmallError::internal("update on a page boundary"))?;
    let was_delete_marked = rec.is_delete_marked();
    rec_apply_update(rec, update);
    if let (Some(roll_ptr), true) = (roll_ptr, flags & BTR_KEEP_SYS_FLAG == 0) {
        row_upd_rec_sys_fields(&index, &mut rec.fields, trx_id, &roll_ptr)?;
    }
    let reowns = was_delete_marked && !rec.is_delete_marked() && rec.has_ext();
    mtr.log(MlogType::RecUpdateInPlace, cur.page_id, rec_body(cur));

    // an undeleted record owns its external fields again
    if reowns {
        btr_cur_unmark_extern_fields(cur, mtr)?;
    }
    debug!(
        "tx_{}: in-place update of {} fields on {} slot {}",
        trx_id,
        update.fields.len(),
        cur.page_id,
        slot
    );
    Ok(())
}

/// Update a clustered record without touching the tree structure.
///
/// Returns `Overflow` when the new version does not fit in the page or
/// the record has external fields, `Underflow` when the page would
/// become a merge candidate. Nothing is changed in those cases.
pub fn btr_cur_optimistic_update(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    update: &Update,
    cmpl_info: u8,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> SmallResult {
    let rec = cur.user_rec(mtr)?.clone();
    if !row_upd_changes_field_size_or_external(&rec, update) {
        return btr_cur_update_in_place(db, flags, cur, update, cmpl_info, thr, mtr);
    }

    let mut new_rec = rec.clone();
    rec_apply_update(&mut new_rec, update);
    if rec.has_ext() || new_rec.has_ext() {
        return Err(SmallError::new(
            ErrorCode::Overflow,
            "update of a record with external fields",
        ));
    }

    // step 1: check the space
    let page_size = db.config().page_size;
    let (old_size, new_size) = (rec.size(), new_rec.size());
    let (free, data_size) = {
        let page = cur.page(mtr)?;
        (page.free_space(page_size), page.data_size())
    };
    if new_size > page_max_rec_size(page_size) || new_size > free + old_size {
        return Err(SmallError::new(
            ErrorCode::Overflow,
            &format!("{} -> {} bytes, {} free", old_size, new_size, free),
        ));
    }
    if data_size - old_size + new_size < db.config().compress_limit() && !cur.is_root() {
        return Err(SmallError::new(
            ErrorCode::Underflow,
            &format!("{} would drop to {} bytes", cur.page_id, data_size - old_size + new_size),
        ));
    }

    // step 2: locks and undo
    let roll_ptr = btr_cur_upd_lock_and_undo(db, flags, cur, update, cmpl_info, thr, mtr)?;

    // step 3: replace
    if let (Some(roll_ptr), true) = (roll_ptr, flags & BTR_KEEP_SYS_FLAG == 0) {
        row_upd_rec_sys_fields(&cur.index, &mut new_rec.fields, thr.trx().id(), &roll_ptr)?;
    }
    let slot = cur.slot;
    cur.page_mut(mtr)?.replace_rec(slot, new_rec);
    mtr.log(MlogType::RecUpdateInPlace, cur.page_id, rec_body(cur));
    Ok(())
}

/// Update a clustered record, moving it or splitting its page when the
/// new version does not fit.
///
/// The cursor must have been positioned with `ModifyTree` and is left on
/// the new version. Returns the fields moved off the new version, which
/// the caller stores with `btr_store_big_rec_extern_fields`.
///
/// With `BTR_NO_UNDO_LOG_FLAG` (rollback) the external fields which the
/// update replaces are freed unless they were inherited.
pub fn btr_cur_pessimistic_update(
    db: &Database,
    flags: u32,
    cur: &mut BtrCur,
    update: &Update,
    cmpl_info: u8,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> Result<Option<BigRec>, SmallError> {
    match btr_cur_optimistic_update(db, flags, cur, update, cmpl_info, thr, mtr) {
        Err(e) if e.is(ErrorCode::Overflow) || e.is(ErrorCode::Underflow) => {}
        r => return r.map(|_| None),
    }

    let index = Arc::clone(&cur.index);
    let roll_ptr = btr_cur_upd_lock_and_undo(db, flags, cur, update, cmpl_info, thr, mtr)?;

    let height = mtr.page(&index.root())?.level() + 1;
    let _reservation = db.fsp().reserve_free_extents(height + 2)?;

    if flags & BTR_NO_UNDO_LOG_FLAG != 0 {
        btr_rec_free_updated_extern_fields(db, cur, update, true, mtr)?;
    }

    // step 1: the new version
    let mut new_rec = cur.user_rec(mtr)?.clone();
    rec_apply_update(&mut new_rec, update);
    if let (Some(roll_ptr), true) = (roll_ptr, flags & BTR_KEEP_SYS_FLAG == 0) {
        row_upd_rec_sys_fields(&index, &mut new_rec.fields, thr.trx().id(), &roll_ptr)?;
    }
    let mut entry = new_rec.to_tuple();
    let max_size = page_max_rec_size(db.config().page_size);
    let big_rec = if entry.get_converted_size() > max_size {
        Some(dtuple_convert_big_rec(&index, &mut entry, max_size)?)
    } else {
        None
    };

    // step 2: delete the old version, insert the new one at its place
    let slot = cur.slot;
    cur.page_mut(mtr)?.delete_rec(slot);
    mtr.log(MlogType::RecDelete, cur.page_id, rec_body(cur));
    cur.slot = slot - 1;

    let page_size = db.config().page_size;
    let fits = cur.page(mtr)?.free_space(page_size) >= entry.get_converted_size();
    if fits {
        let rec = Rec::from_tuple(&entry);
        let new_slot = cur.page_mut(mtr)?.insert_after(cur.slot, rec);
        cur.slot = new_slot;
        mtr.log(MlogType::RecInsert, cur.page_id, rec_body(cur));
    } else {
        let flags = BTR_NO_UNDO_LOG_FLAG | BTR_NO_LOCKING_FLAG | BTR_KEEP_SYS_FLAG;
        let (new_cur, extra) = btr_cur_pessimistic_insert(db, flags, cur, &mut entry, thr, mtr)?;
        if extra.is_some() {
            return Err(SmallError::internal("entry converted twice"));
        }
        *cur = new_cur;
    }

    // step 3: the new version owns its external fields
    if !entry.is_delete_marked() && !entry.ext_fields().is_empty() {
        btr_cur_unmark_extern_fields(cur, mtr)?;
    }

    if fits && big_rec.is_none() {
        btr_cur_compress_if_useful(db, cur, mtr)?;
    }
    debug!(
        "pessimistic update on {}: now {} slot {}",
        index.name(),
        cur.page_id,
        cur.slot
    );
    Ok(big_rec)
}

/// Set or clear the delete mark of a clustered record, writing the undo
/// record and stamping the system fields.
pub fn btr_cur_del_mark_set_clust_rec(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    val: bool,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> SmallResult {
    let index = Arc::clone(&cur.index);
    if !index.is_clustered() {
        return Err(SmallError::internal("clustered del-mark on a secondary index"));
    }

    let rec = cur.user_rec(mtr)?;
    if flags & BTR_NO_LOCKING_FLAG == 0 {
        db.lock_sys()
            .lock_rec(thr.trx().id(), rec_lock_key(&index, rec), LockMode::X)?;
    }
    let roll_ptr = trx_undo_report_row_operation(
        db,
        thr.trx_mut(),
        flags,
        &index,
        UndoOp::Modify {
            rec,
            update: None,
            cmpl_info: 0,
        },
    )?;

    let trx_id = thr.trx().id();
    let slot = cur.slot;
    let rec = cur
        .page_mut(mtr)?
        .rec_mut(slot)
        .ok_or_else(|| SmallError::internal("del-mark on a page boundary"))?;
    rec.set_delete_mark(val);
    if let Some(roll_ptr) = roll_ptr {
        row_upd_rec_sys_fields(&index, &mut rec.fields, trx_id, &roll_ptr)?;
    }
    mtr.log(MlogType::RecDelMark, cur.page_id, rec_body(cur));
    debug!("tx_{}: del-mark {} on {} slot {}", trx_id, val, cur.page_id, slot);
    Ok(())
}

/// Set or clear the delete mark of a secondary index record.
pub fn btr_cur_del_mark_set_sec_rec(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    val: bool,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> SmallResult {
    let index = Arc::clone(&cur.index);
    if flags & BTR_NO_LOCKING_FLAG == 0 {
        let key = rec_lock_key(&index, cur.user_rec(mtr)?);
        db.lock_sys().lock_rec(thr.trx().id(), key, LockMode::X)?;
    }

    let slot = cur.slot;
    cur.page_mut(mtr)?
        .rec_mut(slot)
        .ok_or_else(|| SmallError::internal("del-mark on a page boundary"))?
        .set_delete_mark(val);
    mtr.log(MlogType::RecDelMark, cur.page_id, rec_body(cur));
    Ok(())
}
