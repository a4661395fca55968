//! Row operations on top of the B-tree: insert, update and delete of
//! rows, their rollback, multi-version reads and purge.

pub mod ins;
pub mod purge;
pub mod row;
pub mod sel;
pub mod uins;
pub mod umod;
pub mod undo;
pub mod upd;
pub mod vers;

use std::sync::Arc;

pub use ins::{row_ins, row_ins_index_entry};
pub use sel::{
    row_sel_get_consistent, row_sel_get_with_view, row_sel_index_entries,
    row_sel_lock_for_update, row_sel_scan_consistent,
};
pub use upd::{row_upd, UpdNode, UpdNodeState, Update};
pub use vers::{row_vers_build_for_consistent_read, row_vers_old_has_index_entry};

use crate::{
    data::{DField, DTuple},
    database::Database,
    dict::Table,
    que::{run_statement, QueThr},
    types::SmallResult,
};

/// Insert a row given by column, as one statement.
pub fn row_insert(
    db: &Database,
    thr: &mut QueThr,
    table: &Table,
    values: Vec<DField>,
) -> SmallResult {
    run_statement(db, thr, |thr| row_ins(db, table, DTuple::new(values), thr))
}

/// Set some columns, given as `(column, value)`, of the row with primary
/// key `pk`, as one statement.
pub fn row_update(
    db: &Database,
    thr: &mut QueThr,
    table: &Arc<Table>,
    pk: &[DField],
    values: &[(usize, DField)],
) -> SmallResult {
    run_statement(db, thr, |thr| {
        let update = Update::from_columns(table, values)?;
        let mut node = UpdNode::new(table, DTuple::new(pk.to_vec()), update, false);
        row_upd(db, &mut node, thr)
    })
}

/// Delete the row with primary key `pk`, as one statement.
pub fn row_delete(
    db: &Database,
    thr: &mut QueThr,
    table: &Arc<Table>,
    pk: &[DField],
) -> SmallResult {
    run_statement(db, thr, |thr| {
        let mut node = UpdNode::new(table, DTuple::new(pk.to_vec()), Update::new(0), true);
        row_upd(db, &mut node, thr)
    })
}
