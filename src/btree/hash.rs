use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::debug;
use parking_lot::RwLock;

use crate::types::IndexId;

/// Adaptive hash index: maps the unique prefix of a leaf record to the
/// page it was last found on.
///
/// Entries are hints only. A hit is used after the page has been latched
/// and the record found there, a stale entry just costs a miss.
pub struct AdaptiveHash {
    enabled: bool,
    map: RwLock<HashMap<(IndexId, Vec<u8>), u32>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl AdaptiveHash {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            map: RwLock::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn search(&self, index_id: IndexId, key: &[u8]) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        self.map.read().get(&(index_id, key.to_vec())).copied()
    }

    pub fn insert(&self, index_id: IndexId, key: Vec<u8>, page_no: u32) {
        if !self.enabled {
            return;
        }
        self.map.write().insert((index_id, key), page_no);
    }

    pub fn remove(&self, index_id: IndexId, key: &[u8]) {
        self.map.write().remove(&(index_id, key.to_vec()));
    }

    /// Forget every entry pointing to a freed page.
    pub fn drop_page(&self, page_no: u32) {
        if !self.enabled {
            return;
        }
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, p| *p != page_no);
        if map.len() != before {
            debug!("ahi: dropped {} entries of page {}", before - map.len(), page_no);
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_answers() {
        let ahi = AdaptiveHash::new(false);
        ahi.insert(1, vec![1, 2], 7);
        assert_eq!(ahi.search(1, &[1, 2]), None);
        assert!(ahi.is_empty());
    }

    #[test]
    fn test_drop_page() {
        let ahi = AdaptiveHash::new(true);
        ahi.insert(1, vec![1], 7);
        ahi.insert(1, vec![2], 8);
        ahi.drop_page(7);
        assert_eq!(ahi.search(1, &[1]), None);
        assert_eq!(ahi.search(1, &[2]), Some(8));
    }
}
