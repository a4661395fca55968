use std::{fmt, sync::Arc};

use log::debug;

use super::{
    cursor::{
        btr_cur_open_at_index_side, btr_cur_open_at_rnd_pos, btr_cur_search_to_nth_level, BtrCur,
    },
    BtrLatchMode,
};
use crate::{
    data::DTuple,
    database::Database,
    dict::Index,
    error::SmallError,
    storage::{Mtr, PageCurMode, PageId, PageKind, Rec, RwMode, PAGE_INFIMUM_SLOT},
    types::SmallResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrPcurPosState {
    NotPositioned,
    /// The leaf is latched and the cursor points into it.
    IsPositioned,
    /// The latches are gone, only the stored position is valid.
    WasPositioned,
}

/// Where the cursor was relative to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrPcurRelPos {
    On,
    Before,
    After,
    /// The tree was empty when the position was stored.
    BeforeFirstInTree,
    AfterLastInTree,
}

/// Position stored before the latches are released.
#[derive(Clone)]
struct StoredPos {
    /// Ordering prefix of the record the position refers to.
    old_rec: Option<DTuple>,
    page_id: PageId,
    slot: usize,
    modify_clock: u64,
}

/// Persistent cursor: a tree cursor which can give up its latches and
/// find its way back later, even if the tree changed meanwhile.
pub struct BtrPcur {
    btr_cur: BtrCur,
    latch_mode: BtrLatchMode,
    pos_state: BtrPcurPosState,
    rel_pos: BtrPcurRelPos,
    search_mode: PageCurMode,
    stored: Option<StoredPos>,
}

impl fmt::Debug for BtrPcur {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pcur<{} slot {}, {:?}, {:?}, {:?}>",
            self.btr_cur.page_id, self.btr_cur.slot, self.latch_mode, self.pos_state, self.rel_pos
        )
    }
}

fn leaf_rw(latch_mode: BtrLatchMode) -> RwMode {
    if latch_mode.is_modify() {
        RwMode::X
    } else {
        RwMode::S
    }
}

impl BtrPcur {
    fn from_cur(btr_cur: BtrCur, latch_mode: BtrLatchMode, search_mode: PageCurMode) -> Self {
        Self {
            btr_cur,
            latch_mode,
            pos_state: BtrPcurPosState::IsPositioned,
            rel_pos: BtrPcurRelPos::On,
            search_mode,
            stored: None,
        }
    }

    /// Search the leaf level for `tuple`.
    pub fn open(
        db: &Database,
        index: &Arc<Index>,
        tuple: &DTuple,
        mode: PageCurMode,
        latch_mode: BtrLatchMode,
        mtr: &mut Mtr,
    ) -> Result<Self, SmallError> {
        let cur = btr_cur_search_to_nth_level(db, index, 0, tuple, mode, latch_mode, mtr)?;
        Ok(Self::from_cur(cur, latch_mode, mode))
    }

    /// Search for `tuple` and move to the nearest user record in the
    /// direction of the search mode, possibly on a neighbour page.
    pub fn open_on_user_rec(
        db: &Database,
        index: &Arc<Index>,
        tuple: &DTuple,
        mode: PageCurMode,
        latch_mode: BtrLatchMode,
        mtr: &mut Mtr,
    ) -> Result<Self, SmallError> {
        let mut pcur = Self::open(db, index, tuple, mode, latch_mode, mtr)?;
        match mode {
            PageCurMode::G | PageCurMode::GE => {
                if pcur.is_after_last_on_page(mtr)? {
                    pcur.move_to_next_user_rec(mtr)?;
                }
            }
            PageCurMode::L | PageCurMode::LE => {
                if pcur.is_before_first_on_page() {
                    pcur.move_to_prev_user_rec(db, mtr)?;
                }
            }
        }
        Ok(pcur)
    }

    pub fn open_at_index_side(
        from_left: bool,
        index: &Arc<Index>,
        latch_mode: BtrLatchMode,
        mtr: &mut Mtr,
    ) -> Result<Self, SmallError> {
        let cur = btr_cur_open_at_index_side(from_left, index, latch_mode, mtr)?;
        let mode = if from_left {
            PageCurMode::G
        } else {
            PageCurMode::L
        };
        Ok(Self::from_cur(cur, latch_mode, mode))
    }

    pub fn open_at_rnd_pos(
        index: &Arc<Index>,
        latch_mode: BtrLatchMode,
        mtr: &mut Mtr,
    ) -> Result<Self, SmallError> {
        let cur = btr_cur_open_at_rnd_pos(index, latch_mode, mtr)?;
        Ok(Self::from_cur(cur, latch_mode, PageCurMode::G))
    }

    pub fn btr_cur(&self) -> &BtrCur {
        &self.btr_cur
    }

    pub fn btr_cur_mut(&mut self) -> &mut BtrCur {
        &mut self.btr_cur
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.btr_cur.index
    }

    pub fn latch_mode(&self) -> BtrLatchMode {
        self.latch_mode
    }

    pub fn pos_state(&self) -> BtrPcurPosState {
        self.pos_state
    }

    pub fn rel_pos(&self) -> BtrPcurRelPos {
        self.rel_pos
    }

    pub fn search_mode(&self) -> PageCurMode {
        self.search_mode
    }

    fn check_positioned(&self) -> SmallResult {
        if self.pos_state != BtrPcurPosState::IsPositioned {
            return Err(SmallError::internal(&format!("{:?} is not positioned", self)));
        }
        Ok(())
    }

    pub fn get_rec<'a>(&self, mtr: &'a Mtr) -> Result<&'a Rec, SmallError> {
        self.btr_cur.user_rec(mtr)
    }

    pub fn is_on_user_rec(&self, mtr: &Mtr) -> Result<bool, SmallError> {
        self.btr_cur.is_on_user_rec(mtr)
    }

    pub fn is_before_first_on_page(&self) -> bool {
        self.btr_cur.slot == PAGE_INFIMUM_SLOT
    }

    pub fn is_after_last_on_page(&self, mtr: &Mtr) -> Result<bool, SmallError> {
        Ok(self.btr_cur.slot == self.btr_cur.page(mtr)?.supremum_slot())
    }

    pub fn is_before_first_in_tree(&self, mtr: &Mtr) -> Result<bool, SmallError> {
        Ok(self.is_before_first_on_page() && self.btr_cur.page(mtr)?.prev().is_none())
    }

    pub fn is_after_last_in_tree(&self, mtr: &Mtr) -> Result<bool, SmallError> {
        Ok(self.is_after_last_on_page(mtr)? && self.btr_cur.page(mtr)?.next().is_none())
    }

    /// Remember the position so that it can be restored after the
    /// latches are released.
    pub fn store_position(&mut self, mtr: &Mtr) -> SmallResult {
        self.check_positioned()?;
        let index = Arc::clone(&self.btr_cur.index);
        let page = self.btr_cur.page(mtr)?;
        let slot = self.btr_cur.slot;

        let rec = if page.is_empty() {
            // only the root of an empty tree can be empty
            self.rel_pos = if slot == page.supremum_slot() {
                BtrPcurRelPos::AfterLastInTree
            } else {
                BtrPcurRelPos::BeforeFirstInTree
            };
            None
        } else if slot == page.supremum_slot() {
            self.rel_pos = BtrPcurRelPos::After;
            page.rec(page.n_recs())
        } else if slot == PAGE_INFIMUM_SLOT {
            self.rel_pos = BtrPcurRelPos::Before;
            page.rec(1)
        } else {
            self.rel_pos = BtrPcurRelPos::On;
            page.rec(slot)
        };

        let old_rec = rec.map(|r| {
            let n = index.n_uniq().min(r.fields.len());
            DTuple::new(r.fields[..n].to_vec())
        });
        self.stored = Some(StoredPos {
            old_rec,
            page_id: self.btr_cur.page_id,
            slot,
            modify_clock: page.modify_clock(),
        });
        Ok(())
    }

    /// Latch the leaf again and put the cursor back where it was stored.
    ///
    /// If the page did not change the cursor goes back to the same slot.
    /// Otherwise the tree is searched again: on the last record less or
    /// equal to the stored one (`On`, `After`), or less than it
    /// (`Before`), so that moving forward continues at the first record
    /// not seen yet.
    ///
    /// Returns true only when the cursor is `On` a record whose ordering
    /// prefix equals the stored one.
    pub fn restore_position(
        &mut self,
        db: &Database,
        latch_mode: BtrLatchMode,
        mtr: &mut Mtr,
    ) -> Result<bool, SmallError> {
        let stored = match (&self.stored, self.pos_state) {
            (Some(s), BtrPcurPosState::IsPositioned | BtrPcurPosState::WasPositioned) => {
                s.clone()
            }
            _ => {
                return Err(SmallError::internal(&format!(
                    "restore of {:?} without a stored position",
                    self
                )))
            }
        };
        let index = Arc::clone(&self.btr_cur.index);
        self.latch_mode = latch_mode;

        if let BtrPcurRelPos::BeforeFirstInTree | BtrPcurRelPos::AfterLastInTree = self.rel_pos {
            let from_left = self.rel_pos == BtrPcurRelPos::BeforeFirstInTree;
            self.btr_cur = btr_cur_open_at_index_side(from_left, &index, latch_mode, mtr)?;
            self.pos_state = BtrPcurPosState::IsPositioned;
            return Ok(false);
        }

        // step 1: optimistic, the page did not change
        if matches!(latch_mode, BtrLatchMode::SearchLeaf | BtrLatchMode::ModifyLeaf)
            && mtr.page_latch_mode(&stored.page_id).is_none()
        {
            mtr.latch_page(&stored.page_id, leaf_rw(latch_mode))?;
            let unchanged = {
                let page = mtr.page(&stored.page_id)?;
                page.kind() == PageKind::Index
                    && page.index_id() == index.id()
                    && page.is_leaf()
                    && page.modify_clock() == stored.modify_clock
            };
            if unchanged {
                self.btr_cur = BtrCur::new(&index, stored.page_id, stored.slot);
                self.pos_state = BtrPcurPosState::IsPositioned;
                return Ok(self.rel_pos == BtrPcurRelPos::On);
            }
            mtr.release_page(&stored.page_id);
        }

        // step 2: search again
        let mut tuple = stored
            .old_rec
            .clone()
            .ok_or_else(|| SmallError::internal("stored position without a record"))?;
        let n = tuple.n_fields();
        tuple.set_n_fields_cmp(n);
        let mode = match self.rel_pos {
            BtrPcurRelPos::Before => PageCurMode::L,
            _ => PageCurMode::LE,
        };
        self.btr_cur = btr_cur_search_to_nth_level(db, &index, 0, &tuple, mode, latch_mode, mtr)?;
        self.pos_state = BtrPcurPosState::IsPositioned;

        if self.rel_pos == BtrPcurRelPos::On
            && self.btr_cur.is_on_user_rec(mtr)?
            && self.btr_cur.low_match >= n
        {
            // the record may be on another page now, keep the old prefix
            let page = self.btr_cur.page(mtr)?;
            self.stored = Some(StoredPos {
                old_rec: stored.old_rec,
                page_id: self.btr_cur.page_id,
                slot: self.btr_cur.slot,
                modify_clock: page.modify_clock(),
            });
            return Ok(true);
        }

        debug!("{:?} restored on a different record", self);
        self.store_position(mtr)?;
        Ok(false)
    }

    /// Commit the mtr holding the cursor latches. The stored position
    /// remains.
    pub fn commit_specify_mtr(&mut self, mtr: Mtr) {
        self.pos_state = BtrPcurPosState::WasPositioned;
        mtr.commit();
    }

    /// Release the latch on the leaf only.
    pub fn release_leaf(&mut self, mtr: &mut Mtr) {
        mtr.release_page(&self.btr_cur.page_id);
        self.pos_state = BtrPcurPosState::WasPositioned;
    }

    pub fn close(&mut self) {
        self.stored = None;
        self.pos_state = BtrPcurPosState::NotPositioned;
    }

    /// Move to the infimum of the next leaf page. Leaves are latched left
    /// to right so no latch order is broken.
    pub fn move_to_next_page(&mut self, mtr: &mut Mtr) -> SmallResult {
        self.check_positioned()?;
        let next = self.btr_cur.page(mtr)?.next().ok_or_else(|| {
            SmallError::internal(&format!("{:?} is on the last page", self))
        })?;
        let next_pid = PageId::new(self.btr_cur.page_id.space, next);
        mtr.latch_page(&next_pid, leaf_rw(self.latch_mode))?;
        if mtr.page(&next_pid)?.prev() != Some(self.btr_cur.page_id.page_no) {
            return Err(SmallError::new(
                crate::error::ErrorCode::Corruption,
                &format!("{} does not link back to {}", next_pid, self.btr_cur.page_id),
            ));
        }
        mtr.release_page(&self.btr_cur.page_id);
        self.btr_cur.page_id = next_pid;
        self.btr_cur.slot = PAGE_INFIMUM_SLOT;
        Ok(())
    }

    /// Move to the supremum of the previous leaf page.
    ///
    /// The left page cannot be latched while holding this one, so the
    /// position is stored, the mtr committed and a new one started, and
    /// the position restored with a prev latch mode which latches the
    /// left sibling first.
    pub fn move_backward_from_page(&mut self, db: &Database, mtr: &mut Mtr) -> SmallResult {
        self.check_positioned()?;
        let latch_mode = self.latch_mode;
        let prev_mode = if latch_mode.is_modify() {
            BtrLatchMode::ModifyPrev
        } else {
            BtrLatchMode::SearchPrev
        };

        self.store_position(mtr)?;
        let old = std::mem::replace(mtr, Mtr::start(db));
        old.commit();
        self.pos_state = BtrPcurPosState::WasPositioned;

        self.restore_position(db, prev_mode, mtr)?;

        let prev = self.btr_cur.page(mtr)?.prev();
        let left = self.btr_cur.left_page_id.take();
        match (prev, left) {
            (Some(_), Some(left)) if self.is_before_first_on_page() => {
                mtr.release_page(&self.btr_cur.page_id);
                let supremum = mtr.page(&left)?.supremum_slot();
                self.btr_cur.page_id = left;
                self.btr_cur.slot = supremum;
            }
            (Some(_), Some(left)) => {
                // not on the infimum, the left page is not needed
                mtr.release_page(&left);
            }
            _ => {}
        }
        self.latch_mode = latch_mode;
        self.stored = None;
        Ok(())
    }

    /// Move to the next slot, crossing to the next page from the
    /// supremum. Returns false after the last record of the tree.
    pub fn move_to_next(&mut self, mtr: &mut Mtr) -> Result<bool, SmallError> {
        self.check_positioned()?;
        if self.is_after_last_on_page(mtr)? {
            if self.is_after_last_in_tree(mtr)? {
                return Ok(false);
            }
            self.move_to_next_page(mtr)?;
            return Ok(true);
        }
        self.btr_cur.slot += 1;
        Ok(true)
    }

    /// Move to the previous slot, crossing to the previous page from the
    /// infimum. Returns false before the first record of the tree.
    pub fn move_to_prev(&mut self, db: &Database, mtr: &mut Mtr) -> Result<bool, SmallError> {
        self.check_positioned()?;
        if self.is_before_first_on_page() {
            if self.is_before_first_in_tree(mtr)? {
                return Ok(false);
            }
            self.move_backward_from_page(db, mtr)?;
            return Ok(true);
        }
        self.btr_cur.slot -= 1;
        Ok(true)
    }

    /// Move to the next user record, false if there is none.
    pub fn move_to_next_user_rec(&mut self, mtr: &mut Mtr) -> Result<bool, SmallError> {
        loop {
            if !self.move_to_next(mtr)? {
                return Ok(false);
            }
            if self.is_on_user_rec(mtr)? {
                return Ok(true);
            }
        }
    }

    /// Move to the previous user record, false if there is none.
    pub fn move_to_prev_user_rec(
        &mut self,
        db: &Database,
        mtr: &mut Mtr,
    ) -> Result<bool, SmallError> {
        loop {
            if !self.move_to_prev(db, mtr)? {
                return Ok(false);
            }
            if self.is_on_user_rec(mtr)? {
                return Ok(true);
            }
        }
    }
}
