use log::{debug, info};

use super::trx::trx_finish_rollback;
use crate::{
    database::Database,
    error::{ErrorCode, SmallError},
    que::QueThr,
    row::undo::row_undo_step,
    types::{SmallResult, UndoNo},
};

/// Roll back the whole transaction and finish it.
pub fn trx_rollback(db: &Database, thr: &mut QueThr) -> SmallResult {
    trx_rollback_to_undo_no(db, thr, 0)?;
    trx_finish_rollback(db, thr.trx_mut());
    Ok(())
}

/// Undo every change of the transaction with undo number >= `limit`,
/// newest first. The transaction stays active.
pub fn trx_rollback_to_undo_no(db: &Database, thr: &mut QueThr, limit: UndoNo) -> SmallResult {
    debug!(
        "{}: rollback to undo no {}, {} undo recs",
        thr.trx(),
        limit,
        thr.trx().n_undo_recs()
    );
    thr.roll_limit = limit;
    thr.is_rolling_back = true;

    let mut n_undone = 0;
    let result = loop {
        match row_undo_step(db, thr) {
            Ok(true) => n_undone += 1,
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    thr.is_rolling_back = false;
    result?;

    let trx = thr.trx_mut();
    trx.undo_no = limit;
    trx.savepoints.retain(|(_, undo_no)| *undo_no <= limit);
    info!("{}: {} changes rolled back", trx, n_undone);
    Ok(())
}

/// Roll back to a named savepoint, keeping the savepoint itself.
pub fn trx_rollback_to_savepoint(db: &Database, thr: &mut QueThr, name: &str) -> SmallResult {
    let limit = thr.trx().savepoint(name).ok_or_else(|| {
        SmallError::new(
            ErrorCode::RecordNotFound,
            &format!("{}: no savepoint {}", thr.trx(), name),
        )
    })?;
    trx_rollback_to_undo_no(db, thr, limit)
}
