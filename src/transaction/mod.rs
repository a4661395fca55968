mod purge;
mod read_view;
mod rollback;
mod trx;
mod trx_sys;
pub mod undo;
pub mod undo_rec;

pub use purge::{trx_purge, trx_purge_all, PurgeState, PurgeSys};
pub(crate) use purge::trx_purge_batch;
pub use read_view::ReadView;
pub use rollback::{trx_rollback, trx_rollback_to_savepoint, trx_rollback_to_undo_no};
pub use trx::{trx_commit, trx_start, Trx, TrxState};
pub(crate) use trx::trx_finish_rollback;
pub use trx_sys::{KernelGuard, TrxSys, TrxSysState};
pub use undo::{HistoryLog, RollPtr, UndoKind, UndoLog, UndoRecRef, UndoSpace, UNDO_SPACE_ID};
pub use undo_rec::{
    trx_undo_get_undo_rec, trx_undo_prev_version_build, trx_undo_report_row_operation,
    trx_undo_update_rec_get_update, TrxUndoRec, UndoOp, UndoRecType,
    UPD_NODE_NO_ORD_CHANGE, UPD_NODE_NO_SIZE_CHANGE,
};
