use std::sync::Arc;

use log::debug;

use crate::{
    btree::{
        btr_copy_externally_stored_field, btr_cur_optimistic_delete, btr_cur_pessimistic_delete,
        btr_cur_search_to_nth_level, BtrCur, BtrLatchMode, BtrPcur,
    },
    data::{DField, DTuple, ExternRef},
    database::Database,
    dict::{Index, SysCol, Table, DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN},
    error::{ErrorCode, SmallError},
    storage::{Mtr, PageCurMode, Rec},
    transaction::RollPtr,
    types::TrxId,
    utils::Retry,
};

/// Build the row, indexed by column number, of a clustered index record.
/// External fields stay references.
pub fn row_build(table: &Table, rec: &Rec) -> Result<DTuple, SmallError> {
    let clust = table.clust_index();
    let fields = (0..table.n_cols())
        .map(|col| {
            clust
                .col_pos(col)
                .and_then(|pos| rec.fields.get(pos))
                .cloned()
                .ok_or_else(|| {
                    SmallError::new(
                        ErrorCode::Corruption,
                        &format!("{:?} lacks column {} of {}", rec, col, table.name()),
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DTuple::new(fields))
}

/// Build the entry of `index` for a row. The system fields of a
/// clustered entry are zero, the insert stamps them.
pub fn row_build_index_entry(row: &DTuple, index: &Index) -> Result<DTuple, SmallError> {
    let mut fields = Vec::with_capacity(index.n_fields());
    for ifield in index.fields() {
        let field = match (ifield.col, ifield.sys) {
            (Some(col), _) if col < row.n_fields() => row.get_nth_field(col).clone(),
            (_, Some(SysCol::TrxId)) => DField::sys_u64(0, DATA_TRX_ID_LEN),
            (_, Some(SysCol::RollPtr)) => DField::sys_u64(0, DATA_ROLL_PTR_LEN),
            _ => {
                return Err(SmallError::internal(&format!(
                    "no value for field {} of {}",
                    ifield.name,
                    index.name()
                )))
            }
        };
        fields.push(field);
    }
    let mut entry = DTuple::new(fields);
    entry.set_n_fields_cmp(index.n_uniq());
    Ok(entry)
}

/// The primary key of the row an index record belongs to.
pub fn row_build_row_ref(
    table: &Table,
    index: &Index,
    fields: &[DField],
) -> Result<DTuple, SmallError> {
    let ref_fields = table
        .pk()
        .iter()
        .map(|col| {
            index
                .col_pos(*col)
                .and_then(|pos| fields.get(pos))
                .cloned()
                .ok_or_else(|| {
                    SmallError::internal(&format!(
                        "{} lacks primary key column {}",
                        index.name(),
                        col
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DTuple::new(ref_fields))
}

/// Values of some columns of a row.
pub fn row_cols_tuple(row: &DTuple, cols: &[usize]) -> DTuple {
    DTuple::new(cols.iter().map(|c| row.get_nth_field(*c).clone()).collect())
}

/// Field by field binary equality, info bits are ignored.
pub fn dtuple_data_eq(a: &DTuple, b: &DTuple) -> bool {
    a.n_fields() == b.n_fields()
        && a
            .fields()
            .iter()
            .zip(b.fields())
            .all(|(x, y)| x.data_eq(y))
}

pub fn row_get_rec_trx_id(index: &Index, rec: &Rec) -> Result<TrxId, SmallError> {
    index
        .trx_id_pos()
        .and_then(|pos| rec.fields.get(pos))
        .and_then(|f| f.as_u64())
        .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "record without DB_TRX_ID"))
}

pub fn row_get_rec_roll_ptr(index: &Index, rec: &Rec) -> Result<RollPtr, SmallError> {
    let field = index
        .roll_ptr_pos()
        .and_then(|pos| rec.fields.get(pos))
        .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "record without DB_ROLL_PTR"))?;
    RollPtr::from_field(field)
}

/// Position a persistent cursor on the clustered record of a primary key.
/// Returns `None` when there is no such record, latches stay in `mtr`
/// either way.
pub fn row_search_on_row_ref(
    db: &Database,
    clust: &Arc<Index>,
    ref_tuple: &DTuple,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<Option<BtrPcur>, SmallError> {
    let mut tuple = ref_tuple.clone();
    tuple.set_n_fields_cmp(clust.n_uniq());
    let pcur = BtrPcur::open(db, clust, &tuple, PageCurMode::LE, latch_mode, mtr)?;
    if pcur.btr_cur().is_exact_match(mtr, clust.n_uniq())? {
        Ok(Some(pcur))
    } else {
        Ok(None)
    }
}

/// Position on the clustered record a secondary index record points to.
pub fn row_get_clust_rec(
    db: &Database,
    table: &Table,
    index: &Index,
    sec_fields: &[DField],
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<Option<BtrPcur>, SmallError> {
    let ref_tuple = row_build_row_ref(table, index, sec_fields)?;
    row_search_on_row_ref(db, table.clust_index(), &ref_tuple, latch_mode, mtr)
}

/// Search an index for a record equal to `entry` on the unique fields.
pub fn row_search_index_entry(
    db: &Database,
    index: &Arc<Index>,
    entry: &DTuple,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<Option<BtrCur>, SmallError> {
    let mut tuple = entry.clone();
    tuple.set_n_fields_cmp(index.n_uniq());
    let cur = btr_cur_search_to_nth_level(db, index, 0, &tuple, PageCurMode::LE, latch_mode, mtr)?;
    if cur.is_exact_match(mtr, index.n_uniq())? {
        Ok(Some(cur))
    } else {
        Ok(None)
    }
}

/// Replace the external references of a row by the stored values.
pub fn row_fetch_extern_fields(fields: &mut [DField], mtr: &mut Mtr) -> Result<(), SmallError> {
    for field in fields.iter_mut().filter(|f| f.is_ext()) {
        let r = ExternRef::from_field(field)?;
        let data = btr_copy_externally_stored_field(&r, mtr)?;
        field.set_data(Some(data));
        field.set_ext(false);
    }
    Ok(())
}

/// Physically remove the record of `index` equal to `entry`, if
/// `should_remove` agrees once the record is latched. A leaf-only delete
/// is tried first, then a tree delete which is retried while the file
/// space is exhausted.
///
/// Returns whether a record was removed.
pub(crate) fn row_remove_index_entry<F>(
    db: &Database,
    index: &Arc<Index>,
    entry: &DTuple,
    rollback: bool,
    mut should_remove: F,
) -> Result<bool, SmallError>
where
    F: FnMut(&Rec) -> Result<bool, SmallError>,
{
    // step 1: inside the leaf
    {
        let mut mtr = Mtr::start(db);
        let cur = match row_search_index_entry(db, index, entry, BtrLatchMode::ModifyLeaf, &mut mtr)? {
            Some(cur) => cur,
            None => return Ok(false),
        };
        if !should_remove(cur.user_rec(&mtr)?)? {
            return Ok(false);
        }
        if btr_cur_optimistic_delete(db, &cur, &mut mtr)? {
            mtr.commit();
            return Ok(true);
        }
    }

    // step 2: the tree may shrink
    let config = db.config();
    let retry = Retry::new(
        config.delete_retry_attempts,
        config.delete_retry_sleep,
        ErrorCode::OutOfFileSpace,
    );
    retry.run(|attempt| {
        let mut mtr = Mtr::start(db);
        let cur = match row_search_index_entry(db, index, entry, BtrLatchMode::ModifyTree, &mut mtr)? {
            Some(cur) => cur,
            None => return Ok(false),
        };
        if !should_remove(cur.user_rec(&mtr)?)? {
            return Ok(false);
        }
        btr_cur_pessimistic_delete(db, &cur, false, rollback, &mut mtr)?;
        mtr.commit();
        debug!(
            "removed {:?} from {} with a tree delete, attempt {}",
            entry,
            index.name(),
            attempt
        );
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtuple_data_eq() {
        let a = DTuple::new(vec![DField::int(1), DField::varchar("x")]);
        let mut b = a.clone();
        b.set_info_bits(crate::data::REC_INFO_DELETED_FLAG);
        assert!(dtuple_data_eq(&a, &b));

        let c = DTuple::new(vec![DField::int(1), DField::varchar("y")]);
        assert!(!dtuple_data_eq(&a, &c));
        assert!(!dtuple_data_eq(&a, &DTuple::new(vec![DField::int(1)])));
    }
}
