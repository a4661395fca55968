use std::sync::Arc;

use log::debug;

use super::{
    row::{row_build, row_fetch_extern_fields, row_get_rec_trx_id},
    vers::row_vers_build_for_consistent_read,
};
use crate::{
    btree::{btr_cur_search_to_nth_level, BtrLatchMode, BtrPcur},
    data::{DField, DTuple},
    database::Database,
    dict::{Index, Table},
    error::SmallError,
    lock::{LockMode, RecLockKey},
    que::{with_lock_wait, QueThr},
    storage::{Mtr, PageCurMode, Rec},
    transaction::ReadView,
};

/// A scan gives up its latches after this many records and continues
/// from the stored position.
const SEL_RESTORE_INTERVAL: usize = 64;

fn pk_tuple(table: &Table, pk: &[DField]) -> Result<DTuple, SmallError> {
    let n_uniq = table.clust_index().n_uniq();
    if pk.len() != n_uniq {
        return Err(SmallError::internal(&format!(
            "{} needs {} key fields, got {}",
            table.name(),
            n_uniq,
            pk.len()
        )));
    }
    Ok(DTuple::new(pk.to_vec()))
}

/// The version of a clustered record `view` sees, `None` if the row is
/// deleted or did not exist for the view.
fn row_sel_visible_version(
    db: &Database,
    clust: &Index,
    rec: &Rec,
    view: &ReadView,
) -> Result<Option<Rec>, SmallError> {
    let version = if view.changes_visible(row_get_rec_trx_id(clust, rec)?) {
        Some(rec.clone())
    } else {
        row_vers_build_for_consistent_read(db, clust, rec, view)?
    };
    Ok(version.filter(|v| !v.is_delete_marked()))
}

fn row_sel_fetch_row(table: &Table, rec: &Rec, mtr: &mut Mtr) -> Result<Vec<DField>, SmallError> {
    let mut row = row_build(table, rec)?;
    row_fetch_extern_fields(row.fields_mut(), mtr)?;
    Ok(row.into_fields())
}

/// Read the row of a primary key as seen by `view`.
pub fn row_sel_get_with_view(
    db: &Database,
    table: &Table,
    pk: &[DField],
    view: &ReadView,
) -> Result<Option<Vec<DField>>, SmallError> {
    let clust = table.clust_index();
    let ref_tuple = pk_tuple(table, pk)?;

    let mut mtr = Mtr::start(db);
    let cur = btr_cur_search_to_nth_level(
        db,
        clust,
        0,
        &ref_tuple,
        PageCurMode::LE,
        BtrLatchMode::SearchLeaf,
        &mut mtr,
    )?;
    if !cur.is_exact_match(&mtr, clust.n_uniq())? {
        return Ok(None);
    }
    let version = row_sel_visible_version(db, clust, cur.user_rec(&mtr)?, view)?;
    let row = match version {
        Some(v) => Some(row_sel_fetch_row(table, &v, &mut mtr)?),
        None => None,
    };
    mtr.commit();
    Ok(row)
}

/// Consistent read of one row with the read view of the transaction.
pub fn row_sel_get_consistent(
    db: &Database,
    thr: &mut QueThr,
    table: &Table,
    pk: &[DField],
) -> Result<Option<Vec<DField>>, SmallError> {
    let view = thr.trx_mut().assign_read_view(db).clone();
    row_sel_get_with_view(db, table, pk, &view)
}

/// Consistent read of the whole table in primary key order.
pub fn row_sel_scan_consistent(
    db: &Database,
    thr: &mut QueThr,
    table: &Table,
) -> Result<Vec<Vec<DField>>, SmallError> {
    let view = thr.trx_mut().assign_read_view(db).clone();
    let clust = table.clust_index();

    let mut rows = Vec::new();
    let mut mtr = Mtr::start(db);
    let mut pcur = BtrPcur::open_at_index_side(true, clust, BtrLatchMode::SearchLeaf, &mut mtr)?;
    let mut n_seen = 0;
    while pcur.move_to_next_user_rec(&mut mtr)? {
        let version = row_sel_visible_version(db, clust, pcur.get_rec(&mtr)?, &view)?;
        if let Some(v) = version {
            rows.push(row_sel_fetch_row(table, &v, &mut mtr)?);
        }

        n_seen += 1;
        if n_seen % SEL_RESTORE_INTERVAL == 0 {
            pcur.store_position(&mtr)?;
            pcur.commit_specify_mtr(mtr);
            mtr = Mtr::start(db);
            pcur.restore_position(db, BtrLatchMode::SearchLeaf, &mut mtr)?;
        }
    }
    mtr.commit();

    debug!(
        "{}: consistent scan of {}: {} of {} records visible",
        thr.trx(),
        table.name(),
        rows.len(),
        n_seen
    );
    Ok(rows)
}

/// Every record of an index in order, delete-marked ones included.
pub fn row_sel_index_entries(db: &Database, index: &Arc<Index>) -> Result<Vec<Rec>, SmallError> {
    let mut mtr = Mtr::start(db);
    let mut pcur = BtrPcur::open_at_index_side(true, index, BtrLatchMode::SearchLeaf, &mut mtr)?;
    let mut recs = Vec::new();
    while pcur.move_to_next_user_rec(&mut mtr)? {
        recs.push(pcur.get_rec(&mtr)?.clone());
    }
    mtr.commit();
    Ok(recs)
}

/// Locking read: x-lock the row of a primary key and return its latest
/// version, `None` if there is no such row.
pub fn row_sel_lock_for_update(
    db: &Database,
    thr: &mut QueThr,
    table: &Table,
    pk: &[DField],
) -> Result<Option<Vec<DField>>, SmallError> {
    let clust = table.clust_index();
    let ref_tuple = pk_tuple(table, pk)?;

    with_lock_wait(db, thr, |thr| {
        let mut mtr = Mtr::start(db);
        let cur = btr_cur_search_to_nth_level(
            db,
            clust,
            0,
            &ref_tuple,
            PageCurMode::LE,
            BtrLatchMode::SearchLeaf,
            &mut mtr,
        )?;
        if !cur.is_exact_match(&mtr, clust.n_uniq())? {
            return Ok(None);
        }
        let rec = cur.user_rec(&mtr)?.clone();
        db.lock_sys().lock_rec(
            thr.trx().id(),
            RecLockKey::new(clust.id(), &rec.to_tuple(), clust.n_uniq()),
            LockMode::X,
        )?;
        if rec.is_delete_marked() {
            return Ok(None);
        }
        let row = row_sel_fetch_row(table, &rec, &mut mtr)?;
        mtr.commit();
        Ok(Some(row))
    })
}
