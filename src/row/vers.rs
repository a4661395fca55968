use std::sync::Arc;

use super::row::{
    dtuple_data_eq, row_build, row_build_index_entry, row_build_row_ref, row_get_rec_trx_id,
    row_search_on_row_ref,
};
use crate::{
    btree::BtrLatchMode,
    data::DTuple,
    database::Database,
    dict::{Index, Table},
    error::{ErrorCode, SmallError},
    storage::{Mtr, Rec},
    transaction::{trx_undo_prev_version_build, ReadView},
};

/// Walk back the version chain of a clustered record to the newest
/// version `view` sees. Returns `None` if the row did not exist for the
/// view. The returned version may be delete-marked.
pub fn row_vers_build_for_consistent_read(
    db: &Database,
    index: &Index,
    rec: &Rec,
    view: &ReadView,
) -> Result<Option<Rec>, SmallError> {
    let purge = db.purge_sys().latch().read_recursive();

    let mut version = rec.clone();
    loop {
        let trx_id = row_get_rec_trx_id(index, &version)?;
        if view.changes_visible(trx_id) {
            return Ok(Some(version));
        }
        match trx_undo_prev_version_build(db, index, &version, &purge)? {
            Some(prev) => version = prev,
            None => return Ok(None),
        }
    }
}

/// Whether some version of the clustered record `rec` which is not
/// delete-marked has `entry` as its entry in the secondary `index`. The
/// current version is only looked at with `also_curr`. Versions older
/// than what purge keeps count as absent.
pub fn row_vers_old_has_index_entry(
    db: &Database,
    also_curr: bool,
    rec: &Rec,
    table: &Table,
    index: &Index,
    entry: &DTuple,
) -> Result<bool, SmallError> {
    let clust = table.clust_index();
    let purge = db.purge_sys().latch().read_recursive();

    if also_curr && !rec.is_delete_marked() {
        let row = row_build(table, rec)?;
        if dtuple_data_eq(&row_build_index_entry(&row, index)?, entry) {
            return Ok(true);
        }
    }

    let mut version = rec.clone();
    loop {
        let prev = match trx_undo_prev_version_build(db, clust, &version, &purge) {
            Ok(Some(prev)) => prev,
            Ok(None) => return Ok(false),
            Err(e) if e.is(ErrorCode::MissingHistory) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !prev.is_delete_marked() {
            let row = row_build(table, &prev)?;
            if dtuple_data_eq(&row_build_index_entry(&row, index)?, entry) {
                return Ok(true);
            }
        }
        version = prev;
    }
}

/// Whether the row a secondary index entry points to still needs the
/// entry in some version. A missing clustered record needs nothing.
pub(crate) fn row_vers_sec_entry_needed(
    db: &Database,
    table: &Table,
    index: &Arc<Index>,
    entry: &DTuple,
    also_curr: bool,
) -> Result<bool, SmallError> {
    let ref_tuple = row_build_row_ref(table, index, entry.fields())?;
    let mut mtr = Mtr::start(db);
    let pcur = match row_search_on_row_ref(
        db,
        table.clust_index(),
        &ref_tuple,
        BtrLatchMode::SearchLeaf,
        &mut mtr,
    )? {
        Some(pcur) => pcur,
        None => return Ok(false),
    };
    let needed = row_vers_old_has_index_entry(
        db,
        also_curr,
        pcur.get_rec(&mtr)?,
        table,
        index,
        entry,
    )?;
    mtr.commit();
    Ok(needed)
}
