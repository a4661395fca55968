use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use super::page::{Page, PageId};
use crate::error::{ErrorCode, SmallError};

/// A page together with its latch.
pub type PageLatch = Arc<RwLock<Page>>;

/// In-memory page table. Pages are never evicted, a freed page stays in
/// the table (kind `Free`) so that its modify clock keeps growing when
/// it gets reused.
pub struct BufPool {
    pages: RwLock<HashMap<PageId, PageLatch>>,
    page_size: usize,
}

impl BufPool {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch a page by identity, the caller latches it.
    pub fn get(&self, pid: &PageId) -> Result<PageLatch, SmallError> {
        match self.pages.read().get(pid) {
            Some(latch) => Ok(Arc::clone(latch)),
            None => Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("page {} does not exist", pid),
            )),
        }
    }

    /// Fetch a page which is going to be (re)initialized, creating the
    /// frame if the page was never used.
    pub fn get_or_create(&self, pid: &PageId) -> PageLatch {
        let mut pages = self.pages.write();
        let latch = pages
            .entry(*pid)
            .or_insert_with(|| Arc::new(RwLock::new(Page::new_free(*pid))));
        Arc::clone(latch)
    }

}
