use std::sync::Arc;

use log::debug;

use super::row::{
    row_build, row_build_index_entry, row_get_rec_roll_ptr, row_remove_index_entry,
    row_search_on_row_ref,
};
use crate::{
    btree::BtrLatchMode,
    data::DTuple,
    database::Database,
    storage::Mtr,
    transaction::{RollPtr, TrxUndoRec},
    types::SmallResult,
};

/// Undo a fresh insert: remove the secondary index entries of the row,
/// then the clustered record. Nothing is done when the clustered record
/// no longer carries `roll_ptr`.
pub fn row_undo_ins(db: &Database, undo_rec: &TrxUndoRec, roll_ptr: RollPtr) -> SmallResult {
    let table = match db.dict().get_table(undo_rec.table_id) {
        Some(table) => table,
        None => return Ok(()),
    };
    let clust = Arc::clone(table.clust_index());
    let mut ref_tuple = DTuple::new(undo_rec.ref_fields.clone());
    ref_tuple.set_n_fields_cmp(clust.n_uniq());

    // step 1: the row as inserted
    let row = {
        let mut mtr = Mtr::start(db);
        let pcur = match row_search_on_row_ref(
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
            debug!("undo insert of {:?}: record changed since, skip", ref_tuple);
            return Ok(());
        }
        row_build(&table, rec)?
    };

    // step 2: secondary entries
    for index in table.secondary_indexes() {
        let entry = row_build_index_entry(&row, index)?;
        row_remove_index_entry(db, index, &entry, true, |_| Ok(true))?;
    }

    // step 3: the clustered record, inherited external fields survive
    row_remove_index_entry(db, &clust, &ref_tuple, true, |rec| {
        Ok(row_get_rec_roll_ptr(&clust, rec)? == roll_ptr)
    })?;
    debug!("undo insert of {:?} into {} done", ref_tuple, table.name());
    Ok(())
}
