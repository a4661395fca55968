use std::{
    collections::{BTreeMap, BTreeSet},
    ops::{Deref, DerefMut},
};

use parking_lot::{Mutex, MutexGuard};

use super::{
    read_view::ReadView,
    undo::{HistoryLog, UndoLog},
};
use crate::{
    sync::set_kernel_mutex_own,
    types::{TrxId, TrxNo},
};

/// State protected by the kernel mutex.
pub struct TrxSysState {
    next_trx_id: TrxId,
    next_trx_no: TrxNo,
    active: BTreeSet<TrxId>,

    // one entry per transaction holding a read view
    views: Vec<ReadView>,

    // committed update undo logs by commit number, consumed by purge
    history: BTreeMap<TrxNo, HistoryLog>,
}

impl TrxSysState {
    pub fn start_trx(&mut self) -> TrxId {
        let id = self.next_trx_id;
        self.next_trx_id += 1;
        self.active.insert(id);
        id
    }

    fn build_view(&self, creator: TrxId) -> ReadView {
        let ids: Vec<TrxId> = self
            .active
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        ReadView {
            creator,
            low_limit_id: self.next_trx_id,
            up_limit_id: ids.first().copied().unwrap_or(self.next_trx_id),
            ids,
            low_limit_no: self.next_trx_no,
        }
    }

    /// Open (or return the already open) read view of a transaction.
    pub fn open_view(&mut self, creator: TrxId) -> ReadView {
        if let Some(view) = self.views.iter().find(|v| v.creator == creator) {
            return view.clone();
        }
        let view = self.build_view(creator);
        self.views.push(view.clone());
        view
    }

    pub fn close_view(&mut self, creator: TrxId) {
        self.views.retain(|v| v.creator != creator);
    }

    pub fn n_views(&self) -> usize {
        self.views.len()
    }

    /// A copy of the oldest view in the system: a fresh view folded
    /// with every open one. Nothing this view cannot see may be purged.
    pub fn oldest_view(&self) -> ReadView {
        self.views
            .iter()
            .map(|v| {
                // the purge view must not see the creator's own changes
                let mut v = v.clone();
                if let Err(pos) = v.ids.binary_search(&v.creator) {
                    v.ids.insert(pos, v.creator);
                }
                v.up_limit_id = v.up_limit_id.min(v.creator);
                v.creator = 0;
                v
            })
            .fold(self.build_view(0), ReadView::oldest)
    }

    /// Move a transaction to the committed state, returns its commit
    /// number.
    pub fn commit(&mut self, trx_id: TrxId, update_undo: Option<UndoLog>) -> TrxNo {
        let trx_no = self.next_trx_no;
        self.next_trx_no += 1;
        self.active.remove(&trx_id);
        self.views.retain(|v| v.creator != trx_id);
        if let Some(log) = update_undo {
            if !log.is_empty() {
                self.history.insert(trx_no, HistoryLog { trx_no, log });
            }
        }
        trx_no
    }

    /// Forget a rolled back transaction.
    pub fn remove(&mut self, trx_id: TrxId) {
        self.active.remove(&trx_id);
        self.views.retain(|v| v.creator != trx_id);
    }

    pub fn is_active(&self, trx_id: TrxId) -> bool {
        self.active.contains(&trx_id)
    }

    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    /// The oldest committed log which `view` does not need anymore.
    pub fn next_purgeable(&self, view: &ReadView) -> Option<HistoryLog> {
        self.history
            .values()
            .next()
            .filter(|h| h.trx_no < view.low_limit_no)
            .cloned()
    }

    pub fn remove_history(&mut self, trx_no: TrxNo) -> Option<HistoryLog> {
        self.history.remove(&trx_no)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// The transaction system. Its state is only reachable through
/// `kernel()`, which marks the calling thread as the kernel mutex owner.
pub struct TrxSys {
    state: Mutex<TrxSysState>,
}

impl TrxSys {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrxSysState {
                next_trx_id: 1,
                next_trx_no: 1,
                active: BTreeSet::new(),
                views: Vec::new(),
                history: BTreeMap::new(),
            }),
        }
    }

    pub fn kernel(&self) -> KernelGuard<'_> {
        let guard = self.state.lock();
        set_kernel_mutex_own(true);
        KernelGuard { guard }
    }
}

/// Holder of the kernel mutex. Page and tree latches must not be
/// requested while one is alive.
pub struct KernelGuard<'a> {
    guard: MutexGuard<'a, TrxSysState>,
}

impl Deref for KernelGuard<'_> {
    type Target = TrxSysState;

    fn deref(&self) -> &TrxSysState {
        &self.guard
    }
}

impl DerefMut for KernelGuard<'_> {
    fn deref_mut(&mut self) -> &mut TrxSysState {
        &mut self.guard
    }
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        set_kernel_mutex_own(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sync::kernel_mutex_own,
        transaction::undo::{RollPtr, UndoKind, UndoRecRef},
    };

    #[test]
    fn test_view_and_history() {
        let trx_sys = TrxSys::new();
        let mut kernel = trx_sys.kernel();
        assert!(kernel_mutex_own());

        let t1 = kernel.start_trx();
        let t2 = kernel.start_trx();
        let view = kernel.open_view(t2);
        assert!(!view.changes_visible(t1));
        assert!(view.changes_visible(t2));

        let mut log = UndoLog::new(UndoKind::Update, t1);
        log.pages.push(1);
        log.recs.push(UndoRecRef {
            undo_no: 0,
            roll_ptr: RollPtr::from_u64(1 << 16),
        });
        let no = kernel.commit(t1, Some(log));

        // t2's view was opened before t1 committed
        let oldest = kernel.oldest_view();
        assert!(kernel.next_purgeable(&oldest).is_none());

        kernel.close_view(t2);
        let oldest = kernel.oldest_view();
        assert_eq!(kernel.next_purgeable(&oldest).map(|h| h.trx_no), Some(no));

        drop(kernel);
        assert!(!kernel_mutex_own());
    }
}
