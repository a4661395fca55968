use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use super::{read_view::ReadView, undo::HistoryLog, undo_rec::TrxUndoRec};
use crate::{
    database::Database,
    error::SmallError,
    io::Decodeable,
    row::purge::row_purge,
    types::{TrxId, TrxNo, UndoNo},
};

pub struct PurgeState {
    /// Copy of the oldest read view at the start of the last batch.
    /// Versions this view sees may have lost their older history.
    pub view: Option<ReadView>,

    /// Next undo record to handle: commit number of its log and undo
    /// number inside the log. Only ever moves forward.
    pub pointer: (TrxNo, UndoNo),

    pub n_pages_handled: usize,
    pub n_recs_handled: usize,
}

impl PurgeState {
    /// Whether the undo log of the given transaction may not have been
    /// purged yet.
    pub fn update_undo_must_exist(&self, trx_id: TrxId) -> bool {
        match &self.view {
            None => true,
            Some(view) => !view.changes_visible(trx_id),
        }
    }
}

/// The purge system. Readers building old versions hold `latch` shared,
/// purge advances its view and frees undo pages holding it exclusively.
pub struct PurgeSys {
    latch: RwLock<PurgeState>,

    // one purge batch at a time
    run: Mutex<()>,
}

impl PurgeSys {
    pub fn new() -> Self {
        Self {
            latch: RwLock::new(PurgeState {
                view: None,
                pointer: (0, 0),
                n_pages_handled: 0,
                n_recs_handled: 0,
            }),
            run: Mutex::new(()),
        }
    }

    pub fn latch(&self) -> &RwLock<PurgeState> {
        &self.latch
    }
}

/// Run one purge batch of at most `purge_batch_size` undo records.
///
/// Returns the number of undo pages freed.
pub fn trx_purge(db: &Database) -> Result<usize, SmallError> {
    let (_, n_pages) = trx_purge_batch(db, db.config().purge_batch_size)?;
    Ok(n_pages)
}

/// Purge until no committed log is left which the oldest view does not
/// need. Returns the number of undo pages freed.
pub fn trx_purge_all(db: &Database) -> Result<usize, SmallError> {
    let mut total = 0;
    loop {
        let (n_recs, n_pages) = trx_purge_batch(db, db.config().purge_batch_size)?;
        total += n_pages;
        if n_recs == 0 && n_pages == 0 {
            return Ok(total);
        }
    }
}

/// Returns `(undo records handled, undo pages freed)`.
pub(crate) fn trx_purge_batch(db: &Database, batch_size: usize) -> Result<(usize, usize), SmallError> {
    let _run = db.purge_sys().run.lock();

    // step 1: take a copy of the oldest view, then install it
    let view = db.trx_sys().kernel().oldest_view();
    db.purge_sys().latch.write().view = Some(view.clone());

    let mut n_recs = 0;
    let mut n_pages = 0;

    // step 2: handle committed logs in commit order
    loop {
        let hist: HistoryLog = match db.trx_sys().kernel().next_purgeable(&view) {
            Some(hist) => hist,
            None => break,
        };

        let (ptr_no, ptr_undo_no) = db.purge_sys().latch.read().pointer;
        let start = if ptr_no == hist.trx_no { ptr_undo_no } else { 0 };

        for r in hist.log.recs.iter().filter(|r| r.undo_no >= start) {
            if n_recs >= batch_size {
                debug!(
                    "purge batch full: {} recs, {} pages, stop at ({}, {})",
                    n_recs, n_pages, hist.trx_no, r.undo_no
                );
                return Ok((n_recs, n_pages));
            }

            let bytes = db.undo_space().read(&r.roll_ptr)?;
            let undo_rec = TrxUndoRec::from_bytes(&bytes)?;
            row_purge(db, &undo_rec, r.roll_ptr)?;

            n_recs += 1;
            let mut state = db.purge_sys().latch.write();
            state.pointer = (hist.trx_no, r.undo_no + 1);
            state.n_recs_handled += 1;
        }

        // step 3: the whole log is handled, free its pages
        {
            let mut state = db.purge_sys().latch.write();
            let freed = db.undo_space().free_log(&hist.log);
            n_pages += freed;
            state.n_pages_handled += freed;
            state.pointer = (hist.trx_no + 1, 0);
        }
        db.trx_sys().kernel().remove_history(hist.trx_no);
        debug!("purged undo log of trx no {}", hist.trx_no);
    }

    if n_recs > 0 || n_pages > 0 {
        info!("purge: {} undo recs, {} undo pages freed", n_recs, n_pages);
    }
    Ok((n_recs, n_pages))
}
