use log::debug;

use super::{umod::row_undo_mod, uins::row_undo_ins};
use crate::{
    database::Database,
    error::SmallError,
    que::QueThr,
    transaction::{trx_undo_get_undo_rec, UndoKind, UndoRecRef, UndoRecType},
};

/// The newest undo record of the transaction, from either log.
fn row_undo_fetch_newest(thr: &QueThr) -> Option<(UndoKind, UndoRecRef)> {
    let trx = thr.trx();
    let ins = trx.insert_undo.as_ref().and_then(|l| l.top()).copied();
    let upd = trx.update_undo.as_ref().and_then(|l| l.top()).copied();
    match (ins, upd) {
        (Some(i), Some(u)) if i.undo_no > u.undo_no => Some((UndoKind::Insert, i)),
        (_, Some(u)) => Some((UndoKind::Update, u)),
        (Some(i), None) => Some((UndoKind::Insert, i)),
        (None, None) => None,
    }
}

/// Undo the newest change of the transaction whose undo number is at
/// least the roll limit of `thr`, then drop its undo record.
///
/// Returns false when there is nothing left to undo.
pub fn row_undo_step(db: &Database, thr: &mut QueThr) -> Result<bool, SmallError> {
    let (kind, rec_ref) = match row_undo_fetch_newest(thr) {
        Some(newest) => newest,
        None => return Ok(false),
    };
    if rec_ref.undo_no < thr.roll_limit {
        return Ok(false);
    }

    let undo_rec = trx_undo_get_undo_rec(db, &rec_ref.roll_ptr)?;
    debug!(
        "{}: undo {:?} no {}",
        thr.trx(),
        undo_rec.rec_type,
        undo_rec.undo_no
    );
    match undo_rec.rec_type {
        UndoRecType::Insert => row_undo_ins(db, &undo_rec, rec_ref.roll_ptr)?,
        _ => row_undo_mod(db, &undo_rec, rec_ref.roll_ptr, thr)?,
    }

    thr.trx_mut().undo_log_mut(kind).recs.pop();
    Ok(true)
}
