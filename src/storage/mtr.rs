use std::sync::Arc;

use log::error;
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock,
};

use super::{
    buf::BufPool,
    log_sys::{LogRec, LogSys, MlogType},
    page::{Page, PageId},
};
use crate::{
    database::Database,
    dict::Index,
    error::SmallError,
    sync::assert_no_kernel_mutex,
    types::{IndexId, Lsn, SmallResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    S,
    X,
}

enum MemoSlot {
    PageS(PageId, ArcRwLockReadGuard<RawRwLock, Page>),
    PageX(PageId, ArcRwLockWriteGuard<RawRwLock, Page>),
    TreeS(IndexId, ArcRwLockReadGuard<RawRwLock, ()>),
    TreeX(IndexId, ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Mini-transaction: owns the latches of one atomic page-level step and
/// the redo records it produced.
///
/// Page views handed out by `page`/`page_mut` borrow the mtr, so they
/// cannot outlive the latch. Commit (or drop) appends the redo records
/// to the log as one group and releases the latches in reverse order.
pub struct Mtr {
    memo: Vec<MemoSlot>,
    log: Vec<LogRec>,
    buf: Arc<BufPool>,
    log_sys: Arc<LogSys>,
}

impl Mtr {
    pub fn start(db: &Database) -> Self {
        Self {
            memo: Vec::new(),
            log: Vec::new(),
            buf: Arc::clone(&db.buf),
            log_sys: Arc::clone(&db.log_sys),
        }
    }

    fn find_page(&self, pid: &PageId) -> Option<usize> {
        self.memo.iter().position(|slot| match slot {
            MemoSlot::PageS(p, _) | MemoSlot::PageX(p, _) => p == pid,
            _ => false,
        })
    }

    fn find_tree(&self, index_id: IndexId) -> Option<usize> {
        self.memo.iter().position(|slot| match slot {
            MemoSlot::TreeS(id, _) | MemoSlot::TreeX(id, _) => *id == index_id,
            _ => false,
        })
    }

    /// Latch a page. Latching a page twice in the same mode is a no-op,
    /// upgrading a shared latch is refused.
    pub fn latch_page(&mut self, pid: &PageId, mode: RwMode) -> SmallResult {
        if let Some(held) = self.page_latch_mode(pid) {
            if held == RwMode::S && mode == RwMode::X {
                return Err(SmallError::internal(&format!(
                    "cannot upgrade latch on {}",
                    pid
                )));
            }
            return Ok(());
        }

        assert_no_kernel_mutex("page latch");
        let latch = self.buf.get(pid)?;
        let slot = match mode {
            RwMode::S => MemoSlot::PageS(*pid, latch.read_arc()),
            RwMode::X => MemoSlot::PageX(*pid, latch.write_arc()),
        };
        self.memo.push(slot);
        Ok(())
    }

    /// X-latch a page about to be initialized, creating its frame if it
    /// was never used.
    pub(crate) fn latch_new_page(&mut self, pid: &PageId) -> SmallResult {
        if self.find_page(pid).is_some() {
            return self.latch_page(pid, RwMode::X);
        }
        assert_no_kernel_mutex("page latch");
        let latch = self.buf.get_or_create(pid);
        self.memo.push(MemoSlot::PageX(*pid, latch.write_arc()));
        Ok(())
    }

    pub fn page_latch_mode(&self, pid: &PageId) -> Option<RwMode> {
        match self.find_page(pid).map(|i| &self.memo[i]) {
            Some(MemoSlot::PageS(..)) => Some(RwMode::S),
            Some(MemoSlot::PageX(..)) => Some(RwMode::X),
            _ => None,
        }
    }

    pub fn page(&self, pid: &PageId) -> Result<&Page, SmallError> {
        match self.find_page(pid).map(|i| &self.memo[i]) {
            Some(MemoSlot::PageS(_, g)) => Ok(&**g),
            Some(MemoSlot::PageX(_, g)) => Ok(&**g),
            _ => Err(SmallError::internal(&format!("{} is not latched", pid))),
        }
    }

    pub fn page_mut(&mut self, pid: &PageId) -> Result<&mut Page, SmallError> {
        match self.find_page(pid) {
            Some(i) => match &mut self.memo[i] {
                MemoSlot::PageX(_, g) => Ok(&mut **g),
                _ => Err(SmallError::internal(&format!("{} is not x-latched", pid))),
            },
            None => Err(SmallError::internal(&format!("{} is not latched", pid))),
        }
    }

    pub fn release_page(&mut self, pid: &PageId) {
        if let Some(i) = self.find_page(pid) {
            self.memo.remove(i);
        }
    }

    pub fn latch_tree(&mut self, index: &Index, mode: RwMode) -> SmallResult {
        if let Some(held) = self.tree_latch_mode(index.id()) {
            if held == RwMode::S && mode == RwMode::X {
                return Err(SmallError::internal(&format!(
                    "cannot upgrade tree latch of index {}",
                    index.name()
                )));
            }
            return Ok(());
        }

        assert_no_kernel_mutex("tree latch");
        let slot = match mode {
            RwMode::S => MemoSlot::TreeS(index.id(), index.tree_latch().read_arc()),
            RwMode::X => MemoSlot::TreeX(index.id(), index.tree_latch().write_arc()),
        };
        self.memo.push(slot);
        Ok(())
    }

    pub fn tree_latch_mode(&self, index_id: IndexId) -> Option<RwMode> {
        match self.find_tree(index_id).map(|i| &self.memo[i]) {
            Some(MemoSlot::TreeS(..)) => Some(RwMode::S),
            Some(MemoSlot::TreeX(..)) => Some(RwMode::X),
            _ => None,
        }
    }

    pub fn release_tree(&mut self, index_id: IndexId) {
        if let Some(i) = self.find_tree(index_id) {
            self.memo.remove(i);
        }
    }

    pub fn log(&mut self, kind: MlogType, page_id: PageId, body: Vec<u8>) {
        self.log.push(LogRec {
            kind,
            page_id,
            body,
        });
    }

    pub fn commit(mut self) -> Lsn {
        self.commit_low()
    }

    fn commit_low(&mut self) -> Lsn {
        let lsn = if self.log.is_empty() {
            self.log_sys.lsn()
        } else {
            let recs = std::mem::take(&mut self.log);
            self.log_sys.append(&recs)
        };

        // release in reverse order of acquisition
        while let Some(slot) = self.memo.pop() {
            drop(slot);
        }
        lsn
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        if !self.log.is_empty() && std::thread::panicking() {
            error!("mtr dropped during panic with {} redo records", self.log.len());
        }
        self.commit_low();
    }
}
