use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::wait_for_graph::WaitForGraph;
use crate::{
    data::DTuple,
    error::{ErrorCode, SmallError},
    sync::assert_no_kernel_mutex,
    types::{IndexId, SmallResult, TrxId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    S,
    X,
}

impl LockMode {
    fn compatible(&self, other: &LockMode) -> bool {
        *self == LockMode::S && *other == LockMode::S
    }

    fn covers(&self, other: &LockMode) -> bool {
        *self == LockMode::X || *other == LockMode::S
    }
}

/// Identity of a locked record: the index and the unique prefix of the
/// entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecLockKey {
    index_id: IndexId,
    key: Vec<u8>,
}

impl RecLockKey {
    pub fn new(index_id: IndexId, entry: &DTuple, n_uniq: usize) -> Self {
        Self {
            index_id,
            key: entry.encode_prefix(n_uniq),
        }
    }
}

impl fmt::Debug for RecLockKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rec<{}:{}>", self.index_id, hex::encode(&self.key))
    }
}

#[derive(Debug)]
struct LockRequest {
    trx_id: TrxId,
    mode: LockMode,
    granted: bool,
}

struct LockSysState {
    // requests in arrival order
    queues: HashMap<RecLockKey, Vec<LockRequest>>,

    trx_locks: HashMap<TrxId, HashSet<RecLockKey>>,

    // the only request each suspended transaction is waiting for
    waiting: HashMap<TrxId, RecLockKey>,

    wait_for_graph: WaitForGraph,
}

impl LockSysState {
    /// Transactions whose requests ahead of `pos` conflict with a request
    /// of `trx_id` in `mode`.
    fn conflicts(queue: &[LockRequest], pos: usize, trx_id: TrxId, mode: LockMode) -> Vec<TrxId> {
        queue[..pos]
            .iter()
            .filter(|r| r.trx_id != trx_id && !r.mode.compatible(&mode))
            .map(|r| r.trx_id)
            .collect()
    }

    /// Grant waiting requests of the queue which no longer conflict.
    fn grant_waiters(&mut self, key: &RecLockKey) {
        let queue = match self.queues.get_mut(key) {
            Some(q) => q,
            None => return,
        };

        let mut granted = Vec::new();
        for i in 0..queue.len() {
            if queue[i].granted {
                continue;
            }
            let trx_id = queue[i].trx_id;
            let mode = queue[i].mode;
            if Self::conflicts(queue, i, trx_id, mode).is_empty() {
                queue[i].granted = true;
                granted.push(trx_id);
            }
        }

        // a waiter waits on this key only, its edges follow the queue
        let still_waiting: Vec<(TrxId, Vec<TrxId>)> = queue
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.granted)
            .map(|(i, r)| (r.trx_id, Self::conflicts(queue, i, r.trx_id, r.mode)))
            .collect();

        for trx_id in granted {
            debug!("tx_{}: granted waiting lock on {:?}", trx_id, key);
            self.waiting.remove(&trx_id);
            self.wait_for_graph.remove_waiter(trx_id);
        }
        for (trx_id, blockers) in still_waiting {
            self.wait_for_graph.remove_waiter(trx_id);
            for b in blockers {
                self.wait_for_graph.add_edge(trx_id, b);
            }
        }
    }

    /// Withdraw the waiting request of a transaction and grant what it
    /// was holding back.
    fn cancel_wait(&mut self, trx_id: TrxId, key: &RecLockKey) {
        let mut holds_key = false;
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|r| !(r.trx_id == trx_id && !r.granted));
            holds_key = queue.iter().any(|r| r.trx_id == trx_id);
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
        if !holds_key {
            if let Some(keys) = self.trx_locks.get_mut(&trx_id) {
                keys.remove(key);
            }
        }
        self.waiting.remove(&trx_id);
        self.wait_for_graph.remove_waiter(trx_id);
        self.grant_waiters(key);
    }
}

/// Record lock table with FIFO queues and deadlock detection on a
/// wait-for graph.
///
/// Only record locks are implemented, there are no gap locks.
pub struct LockSys {
    state: Mutex<LockSysState>,
    cond: Condvar,
}

impl LockSys {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockSysState {
                queues: HashMap::new(),
                trx_locks: HashMap::new(),
                waiting: HashMap::new(),
                wait_for_graph: WaitForGraph::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Request a lock on a record. Never blocks.
    ///
    /// Returns `LockWait` when the request was queued behind conflicting
    /// ones, the caller must then suspend through `wait`. Returns
    /// `Deadlock` when queueing would close a cycle, in that case the
    /// request is not kept.
    pub fn lock_rec(&self, trx_id: TrxId, key: RecLockKey, mode: LockMode) -> SmallResult {
        assert_no_kernel_mutex("lock_rec");
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let queue = state.queues.entry(key.clone()).or_insert_with(Vec::new);
        if queue
            .iter()
            .any(|r| r.trx_id == trx_id && r.granted && r.mode.covers(&mode))
        {
            return Ok(());
        }

        let blockers = LockSysState::conflicts(queue, queue.len(), trx_id, mode);
        if blockers.is_empty() {
            queue.push(LockRequest {
                trx_id,
                mode,
                granted: true,
            });
            state.trx_locks.entry(trx_id).or_insert_with(HashSet::new).insert(key);
            return Ok(());
        }

        queue.push(LockRequest {
            trx_id,
            mode,
            granted: false,
        });
        for b in &blockers {
            state.wait_for_graph.add_edge(trx_id, *b);
        }

        if state.wait_for_graph.exists_cycle_from(trx_id) {
            warn!(
                "tx_{}: deadlock requesting {:?} on {:?}, blockers {:?}",
                trx_id, mode, key, blockers
            );
            if let Some(queue) = state.queues.get_mut(&key) {
                queue.retain(|r| !(r.trx_id == trx_id && !r.granted));
            }
            state.wait_for_graph.remove_waiter(trx_id);
            return Err(SmallError::new(
                ErrorCode::Deadlock,
                &format!("tx_{} chosen as deadlock victim", trx_id),
            ));
        }

        debug!(
            "tx_{}: {:?} lock on {:?} waits for {:?}",
            trx_id, mode, key, blockers
        );
        state.trx_locks.entry(trx_id).or_insert_with(HashSet::new).insert(key.clone());
        state.waiting.insert(trx_id, key);
        Err(SmallError::new(
            ErrorCode::LockWait,
            &format!("tx_{} waits for {:?}", trx_id, blockers),
        ))
    }

    /// Suspend until the queued request of the transaction is granted.
    ///
    /// On timeout the request is withdrawn.
    pub fn wait(&self, trx_id: TrxId, timeout: Duration) -> SmallResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let key = match state.waiting.get(&trx_id) {
                None => return Ok(()),
                Some(key) => key.clone(),
            };

            let now = Instant::now();
            if now >= deadline {
                state.cancel_wait(trx_id, &key);
                drop(state);
                self.cond.notify_all();
                warn!("tx_{}: lock wait timeout on {:?}", trx_id, key);
                return Err(SmallError::new(
                    ErrorCode::LockWaitTimeout,
                    &format!("tx_{} timed out waiting for {:?}", trx_id, key),
                ));
            }
            self.cond.wait_for(&mut state, deadline - now);
        }
    }

    /// Release every lock of the transaction and wake up the waiters.
    pub fn release_all(&self, trx_id: TrxId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let keys = state.trx_locks.remove(&trx_id).unwrap_or_default();
        for key in &keys {
            if let Some(queue) = state.queues.get_mut(key) {
                queue.retain(|r| r.trx_id != trx_id);
                if queue.is_empty() {
                    state.queues.remove(key);
                }
            }
        }
        state.waiting.remove(&trx_id);
        state.wait_for_graph.remove_transaction(trx_id);
        for key in &keys {
            state.grant_waiters(key);
        }
        debug!("tx_{}: released {} record locks", trx_id, keys.len());
        drop(guard);
        self.cond.notify_all();
    }

    pub fn has_lock(&self, trx_id: TrxId, key: &RecLockKey, mode: LockMode) -> bool {
        let state = self.state.lock();
        state.queues.get(key).map_or(false, |queue| {
            queue
                .iter()
                .any(|r| r.trx_id == trx_id && r.granted && r.mode.covers(&mode))
        })
    }

    /// Number of records the transaction holds or waits for a lock on.
    pub fn n_locks(&self, trx_id: TrxId) -> usize {
        self.state.lock().trx_locks.get(&trx_id).map_or(0, |s| s.len())
    }

    pub fn is_waiting(&self, trx_id: TrxId) -> bool {
        self.state.lock().waiting.contains_key(&trx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DField;

    fn key(k: i64) -> RecLockKey {
        RecLockKey::new(1, &DTuple::new(vec![DField::int(k)]), 1)
    }

    #[test]
    fn test_shared_then_exclusive() {
        let lock_sys = LockSys::new();
        lock_sys.lock_rec(1, key(5), LockMode::S).unwrap();
        lock_sys.lock_rec(2, key(5), LockMode::S).unwrap();
        let err = lock_sys.lock_rec(3, key(5), LockMode::X).unwrap_err();
        assert!(err.is(ErrorCode::LockWait));

        lock_sys.release_all(1);
        assert!(lock_sys.is_waiting(3));
        lock_sys.release_all(2);
        assert!(!lock_sys.is_waiting(3));
        assert!(lock_sys.has_lock(3, &key(5), LockMode::X));
        lock_sys.wait(3, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_deadlock_victim() {
        let lock_sys = LockSys::new();
        lock_sys.lock_rec(1, key(1), LockMode::X).unwrap();
        lock_sys.lock_rec(2, key(2), LockMode::X).unwrap();
        assert!(lock_sys
            .lock_rec(1, key(2), LockMode::X)
            .unwrap_err()
            .is(ErrorCode::LockWait));
        assert!(lock_sys
            .lock_rec(2, key(1), LockMode::X)
            .unwrap_err()
            .is(ErrorCode::Deadlock));
        assert!(!lock_sys.is_waiting(2));
    }

    #[test]
    fn test_wait_timeout() {
        let lock_sys = LockSys::new();
        lock_sys.lock_rec(1, key(1), LockMode::X).unwrap();
        lock_sys.lock_rec(2, key(1), LockMode::S).unwrap_err();
        let err = lock_sys.wait(2, Duration::from_millis(20)).unwrap_err();
        assert!(err.is(ErrorCode::LockWaitTimeout));
        assert!(!lock_sys.is_waiting(2));
        assert_eq!(lock_sys.n_locks(2), 0);
    }

    // A compatible request queued behind a timed out one is granted at
    // once.
    #[test]
    fn test_timeout_grants_queue() {
        let lock_sys = LockSys::new();
        lock_sys.lock_rec(1, key(1), LockMode::S).unwrap();
        assert!(lock_sys
            .lock_rec(2, key(1), LockMode::X)
            .unwrap_err()
            .is(ErrorCode::LockWait));
        assert!(lock_sys
            .lock_rec(3, key(1), LockMode::S)
            .unwrap_err()
            .is(ErrorCode::LockWait));

        let err = lock_sys.wait(2, Duration::from_millis(20)).unwrap_err();
        assert!(err.is(ErrorCode::LockWaitTimeout));
        assert!(!lock_sys.is_waiting(3));
        assert!(lock_sys.has_lock(3, &key(1), LockMode::S));
        lock_sys.wait(3, Duration::from_millis(10)).unwrap();
    }

    // A waiter stops waiting for a request which timed out ahead of it.
    #[test]
    fn test_timeout_clears_wait_edges() {
        let lock_sys = LockSys::new();
        lock_sys.lock_rec(1, key(1), LockMode::X).unwrap();
        lock_sys.lock_rec(3, key(3), LockMode::X).unwrap();
        lock_sys.lock_rec(2, key(1), LockMode::X).unwrap_err();
        lock_sys.lock_rec(3, key(1), LockMode::S).unwrap_err();

        lock_sys.wait(2, Duration::from_millis(20)).unwrap_err();
        assert!(lock_sys.is_waiting(3));

        // tx_3 only waits for tx_1 now
        assert!(lock_sys
            .lock_rec(2, key(3), LockMode::S)
            .unwrap_err()
            .is(ErrorCode::LockWait));
    }
}
