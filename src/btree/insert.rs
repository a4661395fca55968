use std::sync::Arc;

use log::debug;

use super::{
    cursor::BtrCur,
    tree::{btr_page_split_and_insert, btr_root_raise_and_insert},
    update::row_upd_rec_sys_fields,
    BTR_KEEP_SYS_FLAG, BTR_NO_LOCKING_FLAG,
};
use crate::{
    data::{dtuple_convert_back_big_rec, dtuple_convert_big_rec, BigRec, DTuple},
    database::Database,
    dict::Index,
    error::{ErrorCode, SmallError},
    io::SmallWriter,
    lock::{LockMode, RecLockKey},
    que::QueThr,
    storage::{page_max_rec_size, MlogType, Mtr, Rec},
    transaction::{trx_undo_report_row_operation, UndoOp},
    types::SmallResult,
};

/// Part of a clustered leaf page kept free for future updates of its
/// records, as a divisor of the page size.
const BTR_CLUST_SPACE_RESERVE_DIV: usize = 16;

/// Move fields of an oversized entry off-page. Only clustered index
/// records may have external fields.
fn btr_cur_convert_big_rec(
    index: &Index,
    entry: &mut DTuple,
    max_size: usize,
) -> Result<Option<BigRec>, SmallError> {
    if entry.get_converted_size() <= max_size {
        return Ok(None);
    }
    if !index.is_clustered() {
        return Err(SmallError::new(
            ErrorCode::TooBigRecord,
            &format!(
                "secondary entry of {} bytes in {}",
                entry.get_converted_size(),
                index.name()
            ),
        ));
    }
    dtuple_convert_big_rec(index, entry, max_size).map(Some)
}

fn convert_back(entry: &mut DTuple, big_rec: Option<BigRec>) {
    if let Some(big_rec) = big_rec {
        dtuple_convert_back_big_rec(entry, big_rec);
    }
}

/// Lock the new record and write its insert undo record, the entry gets
/// the roll pointer.
fn btr_cur_ins_lock_and_undo(
    db: &Database,
    flags: u32,
    index: &Index,
    entry: &mut DTuple,
    thr: &mut QueThr,
) -> SmallResult {
    if flags & BTR_NO_LOCKING_FLAG == 0 {
        let key = RecLockKey::new(index.id(), entry, index.n_uniq());
        db.lock_sys().lock_rec(thr.trx().id(), key, LockMode::X)?;
    }

    if index.is_clustered() {
        let roll_ptr =
            trx_undo_report_row_operation(db, thr.trx_mut(), flags, index, UndoOp::Insert { entry })?;
        if let (Some(roll_ptr), true) = (roll_ptr, flags & BTR_KEEP_SYS_FLAG == 0) {
            row_upd_rec_sys_fields(index, entry.fields_mut(), thr.trx().id(), &roll_ptr)?;
        }
    }
    Ok(())
}

fn btr_cur_insert_low(cur: &BtrCur, rec: Rec, mtr: &mut Mtr) -> Result<BtrCur, SmallError> {
    let slot = cur.page_mut(mtr)?.insert_after(cur.slot, rec);
    let mut writer = SmallWriter::new();
    writer.write_u32(cur.page_id.page_no);
    writer.write_u16(slot as u16);
    mtr.log(MlogType::RecInsert, cur.page_id, writer.into_bytes());

    let mut new_cur = cur.clone();
    new_cur.slot = slot;
    Ok(new_cur)
}

/// Insert `entry` after the cursor position if the page has room for
/// it without reorganization.
///
/// Returns a cursor on the new record, plus the fields which were moved
/// off the entry and still have to be stored with
/// `btr_store_big_rec_extern_fields`. `Fail` means the page is too full,
/// the entry is left unchanged then.
pub fn btr_cur_optimistic_insert(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    entry: &mut DTuple,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> Result<(BtrCur, Option<BigRec>), SmallError> {
    let index = Arc::clone(&cur.index);
    let page_size = db.config().page_size;

    // step 1: big record conversion
    let big_rec = btr_cur_convert_big_rec(&index, entry, page_max_rec_size(page_size))?;

    // step 2: room on the page
    let rec_size = entry.get_converted_size();
    let (free, n_recs, level) = {
        let page = cur.page(mtr)?;
        (page.free_space(page_size), page.n_recs(), page.level())
    };
    let reserve = if index.is_clustered() && level == 0 && n_recs >= 2 {
        page_size / BTR_CLUST_SPACE_RESERVE_DIV
    } else {
        0
    };
    if free < rec_size + reserve {
        convert_back(entry, big_rec);
        return Err(SmallError::new(
            ErrorCode::Fail,
            &format!(
                "{} bytes do not fit in {} ({} free)",
                rec_size, cur.page_id, free
            ),
        ));
    }

    // step 3: locks and undo
    if let Err(e) = btr_cur_ins_lock_and_undo(db, flags, &index, entry, thr) {
        convert_back(entry, big_rec);
        return Err(e);
    }

    // step 4: the record itself
    let new_cur = btr_cur_insert_low(cur, Rec::from_tuple(entry), mtr)?;
    Ok((new_cur, big_rec))
}

/// Insert `entry` after the cursor position, splitting pages as needed.
///
/// The cursor must have been positioned with `ModifyTree`. Returns like
/// `btr_cur_optimistic_insert`.
pub fn btr_cur_pessimistic_insert(
    db: &Database,
    flags: u32,
    cur: &BtrCur,
    entry: &mut DTuple,
    thr: &mut QueThr,
    mtr: &mut Mtr,
) -> Result<(BtrCur, Option<BigRec>), SmallError> {
    match btr_cur_optimistic_insert(db, flags, cur, entry, thr, mtr) {
        Err(e) if e.is(ErrorCode::Fail) => {}
        r => return r,
    }

    let index = Arc::clone(&cur.index);
    btr_cur_ins_lock_and_undo(db, flags, &index, entry, thr)?;

    // a split may allocate one page per level plus a new root
    let height = mtr.page(&index.root())?.level() + 1;
    let _reservation = db.fsp().reserve_free_extents(height + 2)?;

    let big_rec = btr_cur_convert_big_rec(
        &index,
        entry,
        page_max_rec_size(db.config().page_size),
    )?;

    let rec = Rec::from_tuple(entry);
    let result = if cur.is_root() {
        btr_root_raise_and_insert(db, cur, rec, mtr)
    } else {
        btr_page_split_and_insert(db, cur, rec, mtr)
    };
    match result {
        Ok(new_cur) => {
            debug!(
                "pessimistic insert into {}: {} slot {}",
                index.name(),
                new_cur.page_id,
                new_cur.slot
            );
            Ok((new_cur, big_rec))
        }
        Err(e) => {
            convert_back(entry, big_rec);
            Err(e)
        }
    }
}
