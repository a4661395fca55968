use bit_vec::BitVec;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{ErrorCode, SmallError};

/// Page 0 of a space is its header and never handed out.
const FSP_HDR_PAGE_NO: u32 = 0;

struct FspState {
    // bit i is set when page i is in use
    used: BitVec,
    n_used: usize,
    reserved: usize,
}

/// Page allocation of one tablespace.
pub struct Fsp {
    space: u32,
    max_pages: usize,
    state: Mutex<FspState>,
}

impl Fsp {
    pub fn new(space: u32, max_pages: usize) -> Self {
        let mut used = BitVec::from_elem(64, false);
        used.set(FSP_HDR_PAGE_NO as usize, true);
        Self {
            space,
            max_pages,
            state: Mutex::new(FspState {
                used,
                n_used: 1,
                reserved: 0,
            }),
        }
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn alloc_page(&self) -> Result<u32, SmallError> {
        let mut state = self.state.lock();
        if state.n_used >= self.max_pages {
            warn!("space {} is full ({} pages)", self.space, self.max_pages);
            return Err(SmallError::new(
                ErrorCode::OutOfFileSpace,
                &format!("space {} is full", self.space),
            ));
        }

        let page_no = match state.used.iter().position(|bit| !bit) {
            Some(i) => i,
            None => {
                let i = state.used.len();
                state.used.grow(i.max(64), false);
                i
            }
        };
        state.used.set(page_no, true);
        state.n_used += 1;
        Ok(page_no as u32)
    }

    pub fn free_page(&self, page_no: u32) {
        let mut state = self.state.lock();
        let i = page_no as usize;
        if i < state.used.len() && state.used[i] && page_no != FSP_HDR_PAGE_NO {
            state.used.set(i, false);
            state.n_used -= 1;
        } else {
            warn!("space {}: free of unused page {}", self.space, page_no);
        }
    }

    pub fn n_used(&self) -> usize {
        self.state.lock().n_used
    }

    /// Reserve `n_pages` free pages for an operation which must not run
    /// out of space half-way. The reservation is released when the
    /// returned guard is dropped.
    pub fn reserve_free_extents(&self, n_pages: usize) -> Result<Reservation<'_>, SmallError> {
        let mut state = self.state.lock();
        let free = self.max_pages.saturating_sub(state.n_used);
        if free < state.reserved + n_pages {
            debug!(
                "space {}: cannot reserve {} pages, free {}, reserved {}",
                self.space, n_pages, free, state.reserved
            );
            return Err(SmallError::new(
                ErrorCode::OutOfFileSpace,
                &format!("cannot reserve {} pages in space {}", n_pages, self.space),
            ));
        }
        state.reserved += n_pages;
        Ok(Reservation {
            fsp: self,
            n_pages,
        })
    }
}

pub struct Reservation<'a> {
    fsp: &'a Fsp,
    n_pages: usize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.fsp.state.lock().reserved -= self.n_pages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuse() {
        let fsp = Fsp::new(0, 4);
        let a = fsp.alloc_page().unwrap();
        let b = fsp.alloc_page().unwrap();
        assert_eq!((a, b), (1, 2));
        fsp.free_page(a);
        assert_eq!(fsp.alloc_page().unwrap(), 1);
        fsp.alloc_page().unwrap();
        assert!(fsp.alloc_page().unwrap_err().is(ErrorCode::OutOfFileSpace));
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let fsp = Fsp::new(0, 4);
        {
            let _r = fsp.reserve_free_extents(3).unwrap();
            assert!(fsp.reserve_free_extents(1).is_err());
        }
        assert!(fsp.reserve_free_extents(3).is_ok());
    }
}
