use log::{debug, warn};

use crate::{
    database::Database,
    error::{ErrorCode, SmallError},
    transaction::{trx_commit, trx_rollback, trx_rollback_to_undo_no, Trx},
    types::{SmallResult, UndoNo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueThrState {
    Running,
    /// Suspended on a record lock.
    LockWait,
    Completed,
}

/// Execution context of one client: the transaction plus the state of the
/// statement being run for it.
pub struct QueThr {
    trx: Trx,
    state: QueThrState,

    /// Undo records with undo number >= this are rolled back by the
    /// running rollback.
    pub(crate) roll_limit: UndoNo,
    pub(crate) is_rolling_back: bool,

    /// Error of the last failed statement.
    error: Option<ErrorCode>,
}

impl QueThr {
    pub fn new(trx: Trx) -> Self {
        Self {
            trx,
            state: QueThrState::Running,
            roll_limit: 0,
            is_rolling_back: false,
            error: None,
        }
    }

    pub fn trx(&self) -> &Trx {
        &self.trx
    }

    pub fn trx_mut(&mut self) -> &mut Trx {
        &mut self.trx
    }

    pub fn state(&self) -> QueThrState {
        self.state
    }

    pub fn is_rolling_back(&self) -> bool {
        self.is_rolling_back
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    /// Suspend until the lock request which returned `LockWait` is
    /// granted. No latch may be held by the caller.
    pub fn lock_wait(&mut self, db: &Database) -> SmallResult {
        self.state = QueThrState::LockWait;
        debug!("{}: suspended on lock wait", self.trx);
        let result = db
            .lock_sys()
            .wait(self.trx.id(), db.config().lock_wait_timeout);
        self.state = QueThrState::Running;
        result
    }

    pub fn savepoint_take(&mut self, name: &str) {
        self.trx.savepoint_take(name);
    }

    pub fn commit(&mut self, db: &Database) -> SmallResult {
        trx_commit(db, &mut self.trx)?;
        self.state = QueThrState::Completed;
        Ok(())
    }

    pub fn rollback(&mut self, db: &Database) -> SmallResult {
        trx_rollback(db, self)?;
        self.state = QueThrState::Completed;
        Ok(())
    }
}

/// Run `step`, suspending and retrying it as long as it ends in a lock
/// wait. The step must have released its latches when it returns.
pub fn with_lock_wait<T, F>(db: &Database, thr: &mut QueThr, mut step: F) -> Result<T, SmallError>
where
    F: FnMut(&mut QueThr) -> Result<T, SmallError>,
{
    loop {
        match step(thr) {
            Err(e) if e.is(ErrorCode::LockWait) => thr.lock_wait(db)?,
            r => return r,
        }
    }
}

/// Run one statement. On error the statement is rolled back to where it
/// started, a deadlock victim is rolled back completely.
pub fn run_statement<T, F>(db: &Database, thr: &mut QueThr, stmt: F) -> Result<T, SmallError>
where
    F: FnOnce(&mut QueThr) -> Result<T, SmallError>,
{
    if !thr.trx.is_active() {
        return Err(SmallError::internal(&format!(
            "{} is not active ({:?})",
            thr.trx,
            thr.trx.state()
        )));
    }

    let savept = thr.trx.undo_no();
    thr.error = None;
    match stmt(thr) {
        Ok(v) => Ok(v),
        Err(e) => {
            thr.error = Some(e.code());
            if e.is(ErrorCode::Deadlock) {
                warn!("{}: deadlock victim, roll back the transaction", thr.trx);
                thr.rollback(db)?;
            } else {
                debug!("{}: statement failed with {}, roll back to {}", thr.trx, e, savept);
                trx_rollback_to_undo_no(db, thr, savept)?;
            }
            Err(e)
        }
    }
}
