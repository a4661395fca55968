use std::{fmt, sync::Arc};

use log::{debug, warn};

use super::{
    ins::{row_ins_foreign_has_match, row_ins_index_entry},
    row::{row_build, row_build_index_entry, row_cols_tuple},
};
use crate::{
    btree::{
        btr_cur_del_mark_set_clust_rec, btr_cur_del_mark_set_sec_rec,
        btr_cur_disown_inherited_fields, btr_cur_mark_dtuple_inherited_extern,
        btr_cur_optimistic_update, btr_cur_pessimistic_update, btr_cur_search_to_nth_level,
        btr_store_big_rec_extern_fields, BtrLatchMode, BtrPcur,
    },
    data::{DField, DTuple},
    database::Database,
    dict::{Index, Table},
    error::{ErrorCode, SmallError},
    lock::{LockMode, RecLockKey},
    que::{with_lock_wait, QueThr},
    storage::{Mtr, PageCurMode, Rec},
    transaction::{UPD_NODE_NO_ORD_CHANGE, UPD_NODE_NO_SIZE_CHANGE},
    types::SmallResult,
    utils::HandyRwLock,
};

/// New value of one field of a clustered index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdField {
    pub field_no: usize,
    pub new_val: DField,
}

/// Update vector: new values by clustered index field position, plus
/// the info bits the record gets.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub info_bits: u8,
    pub fields: Vec<UpdField>,
}

impl Update {
    pub fn new(info_bits: u8) -> Self {
        Self {
            info_bits,
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, field_no: usize, new_val: DField) {
        self.fields.push(UpdField { field_no, new_val });
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_field_updated(&self, field_no: usize) -> bool {
        self.fields.iter().any(|f| f.field_no == field_no)
    }

    /// Build the update of a row from new column values.
    pub fn from_columns(table: &Table, values: &[(usize, DField)]) -> Result<Self, SmallError> {
        let clust = table.clust_index();
        let mut update = Update::new(0);
        for (col, value) in values {
            let column = table.columns().get(*col).ok_or_else(|| {
                SmallError::internal(&format!("{} has no column {}", table.name(), col))
            })?;
            let field_no = clust.col_pos(*col).ok_or_else(|| {
                SmallError::internal(&format!("column {} is not in {}", col, clust.name()))
            })?;
            if update.is_field_updated(field_no) {
                return Err(SmallError::internal(&format!(
                    "column {} updated twice",
                    column.name
                )));
            }
            let mut value = value.clone();
            value.set_dtype(column.dtype);
            value.check()?;
            update.push(field_no, value);
        }
        Ok(update)
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "upd<info {:#x}", self.info_bits)?;
        for field in &self.fields {
            write!(f, ", {} = {:?}", field.field_no, field.new_val)?;
        }
        write!(f, ">")
    }
}

/// Write the new values and info bits of `update` into a record.
pub fn rec_apply_update(rec: &mut Rec, update: &Update) {
    rec.info_bits = update.info_bits;
    for field in &update.fields {
        rec.fields[field.field_no] = field.new_val.clone();
    }
}

/// Apply a clustered index update to a row, which is indexed by column.
pub fn row_upd_replace(row: &mut DTuple, clust: &Index, update: &Update) {
    for field in &update.fields {
        if let Some(col) = clust.field(field.field_no).col {
            *row.get_nth_field_mut(col) = field.new_val.clone();
        }
    }
}

/// Whether the update changes the size of a field, or touches an
/// external field, so that the record cannot be updated in place.
pub fn row_upd_changes_field_size_or_external(rec: &Rec, update: &Update) -> bool {
    update.fields.iter().any(|f| {
        let old = &rec.fields[f.field_no];
        old.len() != f.new_val.len()
            || old.is_null() != f.new_val.is_null()
            || old.is_ext()
            || f.new_val.is_ext()
    })
}

/// The fields of a clustered index `entry` which differ from `rec`.
/// System fields are left out, the info bits are taken from the entry.
pub fn row_upd_build_difference_binary(index: &Index, entry: &DTuple, rec: &Rec) -> Update {
    let mut update = Update::new(entry.info_bits());
    for (i, field) in entry.fields().iter().enumerate() {
        if index.field(i).is_sys() {
            continue;
        }
        if !field.data_eq(&rec.fields[i]) {
            update.push(i, field.clone());
        }
    }
    update
}

/// The fields of a secondary index `entry` which differ from `rec`, the
/// record is undeleted.
pub fn row_upd_build_sec_rec_difference_binary(entry: &DTuple, rec: &Rec) -> Update {
    let mut update = Update::new(rec.info_bits & !crate::data::REC_INFO_DELETED_FLAG);
    for (i, field) in entry.fields().iter().enumerate() {
        if !field.data_eq(&rec.fields[i]) {
            update.push(i, field.clone());
        }
    }
    update
}

/// Whether the update changes an ordering field of `index`.
///
/// With the `row` the update applies to, a field counts only if its new
/// value differs from the one in the row. Without it every updated
/// ordering field counts.
pub fn row_upd_changes_ord_field_binary(
    row: Option<&DTuple>,
    clust: &Index,
    index: &Index,
    update: &Update,
) -> bool {
    update.fields.iter().any(|f| match clust.field(f.field_no).col {
        Some(col) if index.is_ord_col(col) => match row {
            Some(row) if col < row.n_fields() => !row.get_nth_field(col).data_eq(&f.new_val),
            _ => true,
        },
        _ => false,
    })
}

/// Whether the update changes an ordering field of any index of the
/// table.
pub fn row_upd_changes_some_index_ord_field_binary(
    table: &Table,
    row: Option<&DTuple>,
    update: &Update,
) -> bool {
    let clust = table.clust_index();
    std::iter::once(clust)
        .chain(table.secondary_indexes().iter())
        .any(|index| row_upd_changes_ord_field_binary(row, clust, index, update))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdNodeState {
    /// The clustered record is next.
    UpdateClustered,
    /// Every secondary index needs a new entry.
    UpdateAllSec,
    /// Only the secondary indexes whose ordering fields change.
    UpdateSomeSec,
    Done,
}

/// An update or delete of one row, identified by its primary key.
pub struct UpdNode {
    pub table: Arc<Table>,
    pub is_delete: bool,

    /// Primary key of the row.
    pub ref_tuple: DTuple,
    pub update: Update,
    pub cmpl_info: u8,

    /// Stored position on the clustered record.
    pub pcur: Option<BtrPcur>,

    /// The row before and after the update, by column.
    pub row: Option<DTuple>,
    pub upd_row: Option<DTuple>,

    pub state: UpdNodeState,
}

impl UpdNode {
    pub fn new(table: &Arc<Table>, pk: DTuple, update: Update, is_delete: bool) -> Self {
        Self {
            table: Arc::clone(table),
            is_delete,
            ref_tuple: pk,
            update,
            cmpl_info: 0,
            pcur: None,
            row: None,
            upd_row: None,
            state: UpdNodeState::UpdateClustered,
        }
    }
}

fn node_row(row: &Option<DTuple>) -> Result<&DTuple, SmallError> {
    row.as_ref()
        .ok_or_else(|| SmallError::internal("update node without a row"))
}

fn restore_clust_pcur(
    db: &Database,
    pcur: &mut BtrPcur,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> SmallResult {
    if !pcur.restore_position(db, latch_mode, mtr)? {
        return Err(SmallError::internal(&format!(
            "clustered record of {:?} vanished",
            pcur
        )));
    }
    Ok(())
}

/// Update the clustered record the cursor is stored on: inside the leaf
/// if possible, else with a tree operation. Off-page fields of the new
/// version are stored before returning.
pub(crate) fn row_upd_clust_rec(
    db: &Database,
    flags: u32,
    pcur: &mut BtrPcur,
    update: &Update,
    cmpl_info: u8,
    thr: &mut QueThr,
) -> SmallResult {
    // step 1: in the leaf
    let mut mtr = Mtr::start(db);
    restore_clust_pcur(db, pcur, BtrLatchMode::ModifyLeaf, &mut mtr)?;
    let cur = pcur.btr_cur().clone();
    match btr_cur_optimistic_update(db, flags, &cur, update, cmpl_info, thr, &mut mtr) {
        Ok(()) => {
            pcur.store_position(&mtr)?;
            pcur.commit_specify_mtr(mtr);
            return Ok(());
        }
        Err(e) if e.is_retryable() => {}
        Err(e) => return Err(e),
    }
    pcur.commit_specify_mtr(mtr);

    // step 2: the tree may change
    let mut mtr = Mtr::start(db);
    restore_clust_pcur(db, pcur, BtrLatchMode::ModifyTree, &mut mtr)?;
    let mut cur = pcur.btr_cur().clone();
    let big_rec = btr_cur_pessimistic_update(db, flags, &mut cur, update, cmpl_info, thr, &mut mtr)?;
    if let Some(big_rec) = big_rec {
        btr_store_big_rec_extern_fields(db, &cur, &big_rec, &mut mtr)?;
    }

    // the page may have been merged, the stored position stays the key
    *pcur.btr_cur_mut() = cur;
    pcur.commit_specify_mtr(mtr);
    Ok(())
}

/// Position on the clustered record, x-lock it and remember the row.
fn row_upd_lock_clust_rec(db: &Database, node: &mut UpdNode, thr: &mut QueThr) -> SmallResult {
    let table = Arc::clone(&node.table);
    let clust = Arc::clone(table.clust_index());
    if node.ref_tuple.n_fields() != clust.n_uniq() {
        return Err(SmallError::internal(&format!(
            "{} needs {} key fields, got {}",
            table.name(),
            clust.n_uniq(),
            node.ref_tuple.n_fields()
        )));
    }

    let ref_tuple = &node.ref_tuple;
    let update = &node.update;
    let (pcur, row, no_size_change) = with_lock_wait(db, thr, |thr| {
        let mut mtr = Mtr::start(db);
        let mut pcur = BtrPcur::open(
            db,
            &clust,
            ref_tuple,
            PageCurMode::LE,
            BtrLatchMode::ModifyLeaf,
            &mut mtr,
        )?;
        if !pcur.btr_cur().is_exact_match(&mtr, clust.n_uniq())? {
            return Err(SmallError::new(
                ErrorCode::RecordNotFound,
                &format!("no row {:?} in {}", ref_tuple, table.name()),
            ));
        }

        let rec = pcur.get_rec(&mtr)?;
        let key = RecLockKey::new(clust.id(), &rec.to_tuple(), clust.n_uniq());
        db.lock_sys().lock_rec(thr.trx().id(), key, LockMode::X)?;
        if rec.is_delete_marked() {
            return Err(SmallError::new(
                ErrorCode::RecordNotFound,
                &format!("row {:?} of {} is deleted", ref_tuple, table.name()),
            ));
        }
        let row = row_build(&table, rec)?;
        let no_size_change = !row_upd_changes_field_size_or_external(rec, update);

        pcur.store_position(&mtr)?;
        pcur.commit_specify_mtr(mtr);
        Ok((pcur, row, no_size_change))
    })?;

    let mut cmpl_info = 0;
    if !row_upd_changes_some_index_ord_field_binary(&table, Some(&row), &node.update) {
        cmpl_info |= UPD_NODE_NO_ORD_CHANGE;
    }
    if no_size_change {
        cmpl_info |= UPD_NODE_NO_SIZE_CHANGE;
    }

    let mut upd_row = row.clone();
    row_upd_replace(&mut upd_row, &clust, &node.update);

    node.cmpl_info = cmpl_info;
    node.pcur = Some(pcur);
    node.row = Some(row);
    node.upd_row = Some(upd_row);
    Ok(())
}

fn row_upd_changes_cols(row: &DTuple, upd_row: &DTuple, cols: &[usize]) -> bool {
    cols.iter()
        .any(|c| !row.get_nth_field(*c).data_eq(upd_row.get_nth_field(*c)))
}

/// Referential checks: rows of child tables may not lose their parent,
/// a changed foreign key must point to an existing parent.
fn row_upd_check_references_constraints(
    db: &Database,
    node: &UpdNode,
    thr: &mut QueThr,
) -> SmallResult {
    let row = node_row(&node.row)?;
    let upd_row = node_row(&node.upd_row)?;
    let _guard = db.dict().foreign_check_latch().rl();

    // step 1: the row as a parent
    for fk in db.dict().referencing(node.table.id()) {
        if !node.is_delete && !row_upd_changes_cols(row, upd_row, &fk.parent_cols) {
            continue;
        }
        let values = row_cols_tuple(row, &fk.parent_cols);
        if values.contains_null() {
            continue;
        }
        if row_ins_foreign_has_match(db, &fk.child_index, &values, thr)? {
            return Err(SmallError::new(
                ErrorCode::RowIsReferenced,
                &format!("{:?} is referenced through {}", values, fk.name),
            ));
        }
    }

    // step 2: the row as a child
    if node.is_delete {
        return Ok(());
    }
    for fk in node.table.foreign_keys() {
        if !row_upd_changes_cols(row, upd_row, &fk.child_cols) {
            continue;
        }
        let values = row_cols_tuple(upd_row, &fk.child_cols);
        if values.contains_null() {
            continue;
        }
        if !row_ins_foreign_has_match(db, &fk.parent_index, &values, thr)? {
            return Err(SmallError::new(
                ErrorCode::NoReferencedRow,
                &format!("no parent {:?} for {}", values, fk.name),
            ));
        }
    }
    Ok(())
}

fn row_upd_del_mark_clust_rec(db: &Database, node: &mut UpdNode, thr: &mut QueThr) -> SmallResult {
    let pcur = node
        .pcur
        .as_mut()
        .ok_or_else(|| SmallError::internal("update node is not positioned"))?;
    let mut mtr = Mtr::start(db);
    restore_clust_pcur(db, pcur, BtrLatchMode::ModifyLeaf, &mut mtr)?;
    btr_cur_del_mark_set_clust_rec(db, 0, pcur.btr_cur(), true, thr, &mut mtr)?;
    pcur.store_position(&mtr)?;
    pcur.commit_specify_mtr(mtr);
    Ok(())
}

/// The ordering key changes: delete-mark the old clustered record and
/// insert the new version as a new record. The new record takes over the
/// external fields which the update does not replace.
fn row_upd_clust_rec_by_insert(
    db: &Database,
    node: &mut UpdNode,
    thr: &mut QueThr,
) -> SmallResult {
    let clust = Arc::clone(node.table.clust_index());
    let pcur = node
        .pcur
        .as_mut()
        .ok_or_else(|| SmallError::internal("update node is not positioned"))?;

    // step 1: the old version
    let mut mtr = Mtr::start(db);
    restore_clust_pcur(db, pcur, BtrLatchMode::ModifyLeaf, &mut mtr)?;
    btr_cur_del_mark_set_clust_rec(db, 0, pcur.btr_cur(), true, thr, &mut mtr)?;
    if pcur.get_rec(&mtr)?.has_ext() {
        btr_cur_disown_inherited_fields(pcur.btr_cur(), &node.update, &mut mtr)?;
    }
    pcur.store_position(&mtr)?;
    pcur.commit_specify_mtr(mtr);

    // step 2: the new version
    let mut entry = row_build_index_entry(node_row(&node.upd_row)?, &clust)?;
    btr_cur_mark_dtuple_inherited_extern(&mut entry, &node.update)?;
    debug!("{}: update by insert of {:?}", thr.trx(), entry);
    row_ins_index_entry(db, &clust, &mut entry, thr)
}

fn row_upd_clust_step(db: &Database, node: &mut UpdNode, thr: &mut QueThr) -> SmallResult {
    let clust = Arc::clone(node.table.clust_index());

    if node.is_delete {
        row_upd_del_mark_clust_rec(db, node, thr)?;
        node.state = UpdNodeState::UpdateAllSec;
        return Ok(());
    }

    if row_upd_changes_ord_field_binary(node.row.as_ref(), &clust, &clust, &node.update) {
        row_upd_clust_rec_by_insert(db, node, thr)?;
        node.state = UpdNodeState::UpdateAllSec;
        return Ok(());
    }

    let pcur = node
        .pcur
        .as_mut()
        .ok_or_else(|| SmallError::internal("update node is not positioned"))?;
    row_upd_clust_rec(db, 0, pcur, &node.update, node.cmpl_info, thr)?;

    node.state = if node.cmpl_info & UPD_NODE_NO_ORD_CHANGE != 0 {
        UpdNodeState::Done
    } else {
        UpdNodeState::UpdateSomeSec
    };
    Ok(())
}

/// Delete-mark the entry of the old row in a secondary index and, unless
/// the row is deleted, insert the entry of the new row.
fn row_upd_sec_index_entry(
    db: &Database,
    node: &UpdNode,
    index: &Arc<Index>,
    thr: &mut QueThr,
) -> SmallResult {
    let old_entry = row_build_index_entry(node_row(&node.row)?, index)?;

    // step 1: the old entry
    with_lock_wait(db, thr, |thr| {
        let mut mtr = Mtr::start(db);
        let cur = btr_cur_search_to_nth_level(
            db,
            index,
            0,
            &old_entry,
            PageCurMode::LE,
            BtrLatchMode::ModifyLeaf,
            &mut mtr,
        )?;
        if !cur.is_exact_match(&mtr, index.n_uniq())? {
            warn!(
                "{}: entry {:?} missing from {} on update",
                thr.trx(),
                old_entry,
                index.name()
            );
            return Ok(());
        }
        if !cur.user_rec(&mtr)?.is_delete_marked() {
            btr_cur_del_mark_set_sec_rec(db, 0, &cur, true, thr, &mut mtr)?;
        }
        mtr.commit();
        Ok(())
    })?;

    // step 2: the new entry
    if node.is_delete {
        return Ok(());
    }
    let mut entry = row_build_index_entry(node_row(&node.upd_row)?, index)?;
    row_ins_index_entry(db, index, &mut entry, thr)
}

fn row_upd_sec_step(db: &Database, node: &UpdNode, thr: &mut QueThr) -> SmallResult {
    let clust = node.table.clust_index();
    for index in node.table.secondary_indexes() {
        let row = node.row.as_ref();
        if node.state == UpdNodeState::UpdateAllSec
            || row_upd_changes_ord_field_binary(row, clust, index, &node.update)
        {
            row_upd_sec_index_entry(db, node, index, thr)?;
        }
    }
    Ok(())
}

/// Update or delete the row of `node`: lock it, check the referential
/// constraints, change the clustered record, then the secondary
/// indexes.
pub fn row_upd(db: &Database, node: &mut UpdNode, thr: &mut QueThr) -> SmallResult {
    if !node.is_delete && node.update.is_empty() {
        node.state = UpdNodeState::Done;
        return Ok(());
    }

    // step 1: the clustered record, x-locked
    row_upd_lock_clust_rec(db, node, thr)?;

    // step 2: foreign keys
    row_upd_check_references_constraints(db, node, thr)?;

    // step 3: clustered index
    row_upd_clust_step(db, node, thr)?;

    // step 4: secondary indexes
    if matches!(
        node.state,
        UpdNodeState::UpdateAllSec | UpdNodeState::UpdateSomeSec
    ) {
        row_upd_sec_step(db, node, thr)?;
    }

    debug!(
        "{}: {} of {:?} in {} done, cmpl_info {}",
        thr.trx(),
        if node.is_delete { "delete" } else { "update" },
        node.ref_tuple,
        node.table.name(),
        node.cmpl_info
    );
    node.state = UpdNodeState::Done;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(fields: Vec<DField>) -> Rec {
        Rec {
            info_bits: 0,
            fields,
        }
    }

    #[test]
    fn test_size_change() {
        let r = rec(vec![DField::int(1), DField::varchar("abc")]);

        let mut same = Update::new(0);
        same.push(1, DField::varchar("xyz"));
        assert!(!row_upd_changes_field_size_or_external(&r, &same));

        let mut longer = Update::new(0);
        longer.push(1, DField::varchar("abcd"));
        assert!(row_upd_changes_field_size_or_external(&r, &longer));

        let mut ext = DField::binary(vec![0u8; 20]);
        ext.set_ext(true);
        let mut external = Update::new(0);
        external.push(1, ext);
        assert!(row_upd_changes_field_size_or_external(&r, &external));
    }

    #[test]
    fn test_apply_update() {
        let mut r = rec(vec![DField::int(1), DField::varchar("abc")]);
        r.set_delete_mark(true);

        let mut update = Update::new(0);
        update.push(1, DField::varchar("new"));
        assert!(update.is_field_updated(1));
        assert!(!update.is_field_updated(0));

        rec_apply_update(&mut r, &update);
        assert!(!r.is_delete_marked());
        assert_eq!(r.fields[1].as_str(), Some("new"));
    }
}
