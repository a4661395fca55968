use std::fmt;

use log::debug;

use super::{
    read_view::ReadView,
    undo::{UndoKind, UndoLog},
};
use crate::{
    database::Database,
    types::{SmallResult, TrxId, TrxNo, UndoNo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

pub struct Trx {
    id: TrxId,

    // commit number, assigned at commit
    no: Option<TrxNo>,

    state: TrxState,

    /// Number of the next undo record.
    pub(crate) undo_no: UndoNo,

    pub(crate) insert_undo: Option<UndoLog>,
    pub(crate) update_undo: Option<UndoLog>,

    read_view: Option<ReadView>,

    pub(crate) savepoints: Vec<(String, UndoNo)>,
}

impl Trx {
    pub(crate) fn new(id: TrxId) -> Self {
        Self {
            id,
            no: None,
            state: TrxState::NotStarted,
            undo_no: 0,
            insert_undo: None,
            update_undo: None,
            read_view: None,
            savepoints: Vec::new(),
        }
    }

    pub fn id(&self) -> TrxId {
        self.id
    }

    pub fn no(&self) -> Option<TrxNo> {
        self.no
    }

    pub fn state(&self) -> TrxState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TrxState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state == TrxState::Active
    }

    pub fn undo_no(&self) -> UndoNo {
        self.undo_no
    }

    pub fn read_view(&self) -> Option<&ReadView> {
        self.read_view.as_ref()
    }

    /// The consistent read view of the transaction, opened on first use.
    pub fn assign_read_view(&mut self, db: &Database) -> &ReadView {
        let id = self.id;
        self.read_view.get_or_insert_with(|| {
            let view = db.trx_sys().kernel().open_view(id);
            debug!("tx_{}: open {:?}", id, view);
            view
        })
    }

    /// Close the read view, the next consistent read opens a new one.
    pub fn close_read_view(&mut self, db: &Database) {
        if self.read_view.take().is_some() {
            db.trx_sys().kernel().close_view(self.id);
        }
    }

    pub(crate) fn undo_log_mut(&mut self, kind: UndoKind) -> &mut UndoLog {
        let id = self.id;
        let slot = match kind {
            UndoKind::Insert => &mut self.insert_undo,
            UndoKind::Update => &mut self.update_undo,
        };
        slot.get_or_insert_with(|| UndoLog::new(kind, id))
    }

    /// Undo records still to be processed by a rollback.
    pub fn n_undo_recs(&self) -> usize {
        self.insert_undo.as_ref().map_or(0, |l| l.recs.len())
            + self.update_undo.as_ref().map_or(0, |l| l.recs.len())
    }

    /// Remember the current undo position under a name.
    pub fn savepoint_take(&mut self, name: &str) {
        self.savepoints.retain(|(n, _)| n != name);
        self.savepoints.push((name.to_string(), self.undo_no));
    }

    pub(crate) fn savepoint(&self, name: &str) -> Option<UndoNo> {
        self.savepoints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, undo_no)| *undo_no)
    }
}

impl fmt::Display for Trx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Trx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tx_{}<{:?}, undo_no {}, no {:?}>",
            self.id, self.state, self.undo_no, self.no
        )
    }
}

/// Start a transaction.
pub fn trx_start(db: &Database) -> Trx {
    let id = db.trx_sys().kernel().start_trx();
    let mut trx = Trx::new(id);
    trx.set_state(TrxState::Active);
    debug!("{}: started", trx);
    trx
}

/// Commit: assign the commit number and hand the update undo log to the
/// history list under the kernel mutex, then free the insert undo log
/// and release the locks.
pub fn trx_commit(db: &Database, trx: &mut Trx) -> SmallResult {
    // step 1: commit in the transaction system
    let update_undo = trx.update_undo.take();
    let trx_no = db.trx_sys().kernel().commit(trx.id, update_undo);
    trx.no = Some(trx_no);
    trx.read_view = None;

    // step 2: insert undo is only needed for rollback
    if let Some(log) = trx.insert_undo.take() {
        db.undo_space().free_log(&log);
    }

    // step 3: release the locks
    db.lock_sys().release_all(trx.id);

    trx.savepoints.clear();
    trx.set_state(TrxState::Committed);
    debug!("{}: committed as no {}", trx, trx_no);
    Ok(())
}

/// Finish a transaction whose undo records have all been processed.
pub(crate) fn trx_finish_rollback(db: &Database, trx: &mut Trx) {
    db.trx_sys().kernel().remove(trx.id);
    trx.read_view = None;

    for log in [trx.insert_undo.take(), trx.update_undo.take()].iter().flatten() {
        db.undo_space().free_log(log);
    }

    db.lock_sys().release_all(trx.id);
    trx.savepoints.clear();
    trx.set_state(TrxState::RolledBack);
    debug!("{}: rolled back", trx);
}
