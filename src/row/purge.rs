use std::sync::Arc;

use log::debug;

use super::{
    row::{row_get_rec_roll_ptr, row_remove_index_entry},
    upd::{row_upd_changes_ord_field_binary, Update},
    vers::row_vers_sec_entry_needed,
};
use crate::{
    btree::btr_free_externally_stored_field,
    data::{DField, DTuple, ExternRef},
    database::Database,
    dict::{Index, Table},
    error::SmallError,
    storage::Mtr,
    transaction::{RollPtr, TrxUndoRec, UndoRecType, UPD_NODE_NO_ORD_CHANGE},
    types::SmallResult,
};

/// The entry of a secondary index as it was before the logged change,
/// built from the ordering columns and the key in the undo record.
fn row_purge_build_sec_entry(
    table: &Table,
    index: &Index,
    undo_rec: &TrxUndoRec,
) -> Result<DTuple, SmallError> {
    let fields = index
        .fields()
        .iter()
        .map(|ifield| {
            let col = ifield.col.ok_or_else(|| {
                SmallError::internal(&format!("system field in {}", index.name()))
            })?;
            if let Some(value) = undo_rec.ord_col(col) {
                return Ok(value.clone());
            }
            table
                .pk()
                .iter()
                .position(|c| *c == col)
                .and_then(|i| undo_rec.ref_fields.get(i))
                .cloned()
                .ok_or_else(|| {
                    SmallError::internal(&format!(
                        "undo record lacks column {} of {}",
                        col,
                        index.name()
                    ))
                })
        })
        .collect::<Result<Vec<DField>, _>>()?;
    let mut entry = DTuple::new(fields);
    entry.set_n_fields_cmp(index.n_uniq());
    Ok(entry)
}

/// Remove a delete-marked secondary entry no version of its row needs.
fn row_purge_remove_sec_if_poss(
    db: &Database,
    table: &Table,
    index: &Arc<Index>,
    entry: &DTuple,
) -> SmallResult {
    let removed = row_remove_index_entry(db, index, entry, false, |rec| {
        Ok(rec.is_delete_marked() && !row_vers_sec_entry_needed(db, table, index, entry, true)?)
    })?;
    if removed {
        debug!("purge removed {:?} from {}", entry, index.name());
    }
    Ok(())
}

/// Remove the clustered record if it is still the delete-marked version
/// this undo record was written for.
fn row_purge_remove_clust_if_poss(
    db: &Database,
    table: &Table,
    undo_rec: &TrxUndoRec,
    roll_ptr: RollPtr,
) -> SmallResult {
    let clust = table.clust_index();
    let mut ref_tuple = DTuple::new(undo_rec.ref_fields.clone());
    ref_tuple.set_n_fields_cmp(clust.n_uniq());
    let removed = row_remove_index_entry(db, clust, &ref_tuple, false, |rec| {
        Ok(rec.is_delete_marked() && row_get_rec_roll_ptr(clust, rec)? == roll_ptr)
    })?;
    if removed {
        debug!("purge removed {:?} from {}", ref_tuple, table.name());
    }
    Ok(())
}

fn row_purge_del_mark(
    db: &Database,
    table: &Table,
    undo_rec: &TrxUndoRec,
    roll_ptr: RollPtr,
) -> SmallResult {
    for index in table.secondary_indexes() {
        let entry = row_purge_build_sec_entry(table, index, undo_rec)?;
        row_purge_remove_sec_if_poss(db, table, index, &entry)?;
    }
    row_purge_remove_clust_if_poss(db, table, undo_rec, roll_ptr)
}

/// An update: the old entries of the secondary indexes whose ordering
/// fields changed go away, and so do the old values of updated external
/// fields.
fn row_purge_upd_exist_or_extern(
    db: &Database,
    table: &Table,
    undo_rec: &TrxUndoRec,
) -> SmallResult {
    let clust = table.clust_index();

    // step 1: secondary indexes
    if undo_rec.cmpl_info & UPD_NODE_NO_ORD_CHANGE == 0 {
        let mut update = Update::new(0);
        for (field_no, old) in &undo_rec.update {
            update.push(*field_no, old.clone());
        }
        for index in table.secondary_indexes() {
            if !row_upd_changes_ord_field_binary(None, clust, index, &update) {
                continue;
            }
            let entry = row_purge_build_sec_entry(table, index, undo_rec)?;
            row_purge_remove_sec_if_poss(db, table, index, &entry)?;
        }
    }

    // step 2: external fields of the old version
    for (field_no, old) in undo_rec.update.iter().filter(|(_, f)| f.is_ext()) {
        let mut r = ExternRef::from_field(old)?;
        let mut mtr = Mtr::start(db);
        btr_free_externally_stored_field(db, &mut r, false, &mut mtr)?;
        mtr.commit();
        debug!("purge freed external field {} of {:?}", field_no, undo_rec.ref_fields);
    }
    Ok(())
}

/// Purge one undo record of a committed transaction: physically remove
/// what the change made obsolete and nobody can see anymore.
pub fn row_purge(db: &Database, undo_rec: &TrxUndoRec, roll_ptr: RollPtr) -> SmallResult {
    let table = match db.dict().get_table(undo_rec.table_id) {
        Some(table) => table,
        None => return Ok(()),
    };

    match undo_rec.rec_type {
        UndoRecType::DelMark => row_purge_del_mark(db, &table, undo_rec, roll_ptr),
        UndoRecType::UpdExist | UndoRecType::UpdDel => {
            row_purge_upd_exist_or_extern(db, &table, undo_rec)
        }
        UndoRecType::Insert => Ok(()),
    }
}
