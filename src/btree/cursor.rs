use std::sync::Arc;

use log::debug;
use rand::Rng;

use super::{tree::btr_node_ptr_get_child, BtrLatchMode};
use crate::{
    data::DTuple,
    database::Database,
    dict::Index,
    error::{ErrorCode, SmallError},
    storage::{Mtr, Page, PageCurMode, PageId, PageKind, Rec, RwMode},
};

/// How the last search found its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrSearchMethod {
    /// Descent from the root.
    Binary,
    /// Straight to the leaf through the adaptive hash index.
    HashHit { page_no: u32 },
    /// The hash index had a stale entry, then descended.
    HashMiss,
    /// Kept for the insert buffer, which is not implemented.
    InsertBuffered,
}

/// Tree cursor: a position on a page of an index tree.
///
/// The page is latched by the mini-transaction the cursor was opened
/// with, the cursor itself only remembers where it is.
#[derive(Debug, Clone)]
pub struct BtrCur {
    pub index: Arc<Index>,
    pub page_id: PageId,
    pub slot: usize,

    /// Leading fields of the search tuple equal to the record after /
    /// at-or-before the position.
    pub up_match: usize,
    pub low_match: usize,

    /// Number of levels of the tree at search time, 0 when unknown
    /// (after a hash hit).
    pub tree_height: usize,

    pub method: BtrSearchMethod,

    /// Left sibling latched by the prev latch modes.
    pub left_page_id: Option<PageId>,
}

impl BtrCur {
    pub fn new(index: &Arc<Index>, page_id: PageId, slot: usize) -> Self {
        Self {
            index: Arc::clone(index),
            page_id,
            slot,
            up_match: 0,
            low_match: 0,
            tree_height: 0,
            method: BtrSearchMethod::Binary,
            left_page_id: None,
        }
    }

    pub fn page<'a>(&self, mtr: &'a Mtr) -> Result<&'a Page, SmallError> {
        mtr.page(&self.page_id)
    }

    pub fn page_mut<'a>(&self, mtr: &'a mut Mtr) -> Result<&'a mut Page, SmallError> {
        mtr.page_mut(&self.page_id)
    }

    /// The record under the cursor, `None` on the infimum or supremum.
    pub fn rec<'a>(&self, mtr: &'a Mtr) -> Result<Option<&'a Rec>, SmallError> {
        Ok(self.page(mtr)?.rec(self.slot))
    }

    pub fn user_rec<'a>(&self, mtr: &'a Mtr) -> Result<&'a Rec, SmallError> {
        self.rec(mtr)?.ok_or_else(|| {
            SmallError::internal(&format!(
                "cursor on {} slot {} is not on a user record",
                self.page_id, self.slot
            ))
        })
    }

    pub fn is_on_user_rec(&self, mtr: &Mtr) -> Result<bool, SmallError> {
        Ok(self.page(mtr)?.is_user_slot(self.slot))
    }

    /// Positioned on a user record whose first `n` fields equal the
    /// search tuple (LE / GE searches).
    pub fn is_exact_match(&self, mtr: &Mtr, n: usize) -> Result<bool, SmallError> {
        Ok(self.is_on_user_rec(mtr)? && self.low_match >= n)
    }

    pub fn is_root(&self) -> bool {
        self.page_id == self.index.root()
    }
}

/// Page cursor mode used above the target level: the descent must not
/// miss records equal to the tuple on the left.
fn non_leaf_mode(mode: PageCurMode) -> PageCurMode {
    match mode {
        PageCurMode::L | PageCurMode::GE => PageCurMode::L,
        PageCurMode::LE | PageCurMode::G => PageCurMode::LE,
    }
}

fn check_index_page(page: &Page, index: &Index) -> Result<(), SmallError> {
    if page.kind() != PageKind::Index || page.index_id() != index.id() {
        return Err(SmallError::new(
            ErrorCode::Corruption,
            &format!("{:?} does not belong to {:?}", page, index),
        ));
    }
    Ok(())
}

/// Latch the level of the root without keeping a latch, the tree latch
/// keeps it stable.
fn btr_root_level(mtr: &mut Mtr, root: &PageId, tree_mode: RwMode) -> Result<usize, SmallError> {
    if mtr.page_latch_mode(root).is_some() {
        return Ok(mtr.page(root)?.level());
    }
    if tree_mode == RwMode::X {
        // on the path anyway
        mtr.latch_page(root, RwMode::X)?;
        return Ok(mtr.page(root)?.level());
    }
    mtr.latch_page(root, RwMode::S)?;
    let level = mtr.page(root)?.level();
    mtr.release_page(root);
    Ok(level)
}

/// Latch a leaf for the prev modes (left sibling first) and for tree
/// modifications (left, page, right). Returns the left sibling.
fn btr_cur_latch_leaves(
    mtr: &mut Mtr,
    pid: &PageId,
    latch_mode: BtrLatchMode,
) -> Result<Option<PageId>, SmallError> {
    let rw = if latch_mode.is_modify() {
        RwMode::X
    } else {
        RwMode::S
    };

    if matches!(latch_mode, BtrLatchMode::SearchLeaf | BtrLatchMode::ModifyLeaf) {
        mtr.latch_page(pid, rw)?;
        return Ok(None);
    }

    // the sibling links cannot change while we hold the tree latch
    mtr.latch_page(pid, RwMode::S)?;
    let (prev, next) = {
        let page = mtr.page(pid)?;
        (page.prev(), page.next())
    };
    mtr.release_page(pid);

    let left = prev.map(|no| PageId::new(pid.space, no));
    if let Some(left) = &left {
        mtr.latch_page(left, rw)?;
    }
    mtr.latch_page(pid, rw)?;
    if latch_mode == BtrLatchMode::ModifyTree {
        if let Some(next) = next {
            mtr.latch_page(&PageId::new(pid.space, next), RwMode::X)?;
        }
    }
    Ok(left)
}

/// Descend from the root to `level`, letting `choose` pick the slot on
/// every page. Returns the cursor on the target level.
fn btr_cur_descend<F>(
    index: &Arc<Index>,
    level: usize,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
    mut choose: F,
) -> Result<BtrCur, SmallError>
where
    F: FnMut(&Page, bool) -> (usize, usize, usize),
{
    let had_tree = mtr.tree_latch_mode(index.id()).is_some();
    let tree_mode = if latch_mode == BtrLatchMode::ModifyTree {
        RwMode::X
    } else {
        RwMode::S
    };
    mtr.latch_tree(index, tree_mode)?;

    let root = index.root();
    let root_level = btr_root_level(mtr, &root, tree_mode)?;
    if level > root_level {
        return Err(SmallError::internal(&format!(
            "search for level {} in {:?} of height {}",
            level,
            index,
            root_level + 1
        )));
    }

    let page_rw = |is_target: bool| {
        if latch_mode == BtrLatchMode::ModifyTree || (is_target && latch_mode.is_modify()) {
            RwMode::X
        } else {
            RwMode::S
        }
    };

    let mut pid = root;
    let mut cur_level = root_level;
    let mut parent: Option<PageId> = None;
    loop {
        let is_target = cur_level == level;
        let newly = mtr.page_latch_mode(&pid).is_none();

        let mut left_page_id = None;
        if is_target && level == 0 && newly {
            left_page_id = btr_cur_latch_leaves(mtr, &pid, latch_mode)?;
        } else {
            mtr.latch_page(&pid, page_rw(is_target))?;
        }

        // latch coupling: the parent is not needed once the child is held
        if latch_mode != BtrLatchMode::ModifyTree {
            if let Some(p) = parent.take() {
                mtr.release_page(&p);
            }
        }

        let (slot, up_match, low_match, child) = {
            let page = mtr.page(&pid)?;
            check_index_page(page, index)?;
            if page.level() != cur_level {
                return Err(SmallError::new(
                    ErrorCode::Corruption,
                    &format!("{:?} found where level {} was expected", page, cur_level),
                ));
            }
            let (slot, up, low) = choose(page, is_target);
            let child = if is_target {
                None
            } else {
                let rec = page.rec(slot).ok_or_else(|| {
                    SmallError::new(
                        ErrorCode::Corruption,
                        &format!("descent on {:?} stopped at slot {}", page, slot),
                    )
                })?;
                Some(btr_node_ptr_get_child(rec)?)
            };
            (slot, up, low, child)
        };

        match child {
            None => {
                if !had_tree && latch_mode != BtrLatchMode::ModifyTree {
                    mtr.release_tree(index.id());
                }
                let mut cur = BtrCur::new(index, pid, slot);
                cur.up_match = up_match;
                cur.low_match = low_match;
                cur.tree_height = root_level + 1;
                cur.left_page_id = left_page_id;
                return Ok(cur);
            }
            Some(child) => {
                if newly {
                    parent = Some(pid);
                }
                pid = PageId::new(index.space(), child);
                cur_level -= 1;
            }
        }
    }
}

enum HashGuess {
    NoEntry,
    Stale,
    Hit(BtrCur),
}

/// Try to position on a leaf through the adaptive hash index.
fn btr_search_guess_on_hash(
    db: &Database,
    index: &Arc<Index>,
    tuple: &DTuple,
    mode: PageCurMode,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<HashGuess, SmallError> {
    let n_uniq = index.n_uniq();
    let key = tuple.encode_prefix(n_uniq);
    let page_no = match db.ahi().search(index.id(), &key) {
        Some(no) => no,
        None => return Ok(HashGuess::NoEntry),
    };

    let pid = PageId::new(index.space(), page_no);
    if mtr.page_latch_mode(&pid).is_some() {
        return Ok(HashGuess::NoEntry);
    }
    let rw = if latch_mode.is_modify() {
        RwMode::X
    } else {
        RwMode::S
    };
    if mtr.latch_page(&pid, rw).is_err() {
        db.ahi().remove(index.id(), &key);
        db.ahi().record_miss();
        return Ok(HashGuess::Stale);
    }

    let found = {
        let page = mtr.page(&pid)?;
        if page.kind() == PageKind::Index && page.index_id() == index.id() && page.is_leaf() {
            let (slot, up, low) = page.search_with_match(tuple, mode);
            let exact = page.is_user_slot(slot)
                && match mode {
                    PageCurMode::LE => low >= n_uniq,
                    _ => up >= n_uniq,
                };
            if exact {
                Some((slot, up, low))
            } else {
                None
            }
        } else {
            None
        }
    };

    match found {
        Some((slot, up_match, low_match)) => {
            db.ahi().record_hit();
            let mut cur = BtrCur::new(index, pid, slot);
            cur.up_match = up_match;
            cur.low_match = low_match;
            cur.method = BtrSearchMethod::HashHit { page_no };
            Ok(HashGuess::Hit(cur))
        }
        None => {
            mtr.release_page(&pid);
            db.ahi().remove(index.id(), &key);
            db.ahi().record_miss();
            Ok(HashGuess::Stale)
        }
    }
}

/// Search the tree for `tuple` and position a cursor on `level` with the
/// page cursor `mode`.
///
/// Only the first `tuple.n_fields_cmp()` fields are compared. With
/// `ModifyTree` the tree latch and every page on the path stay latched
/// in `mtr`, the other modes keep only the target page (and the left
/// sibling for the prev modes).
pub fn btr_cur_search_to_nth_level(
    db: &Database,
    index: &Arc<Index>,
    level: usize,
    tuple: &DTuple,
    mode: PageCurMode,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    let hashable = level == 0
        && db.ahi().is_enabled()
        && matches!(latch_mode, BtrLatchMode::SearchLeaf | BtrLatchMode::ModifyLeaf)
        && matches!(mode, PageCurMode::LE | PageCurMode::GE)
        && tuple.n_fields_cmp() == index.n_uniq();

    let mut stale_hash = false;
    if hashable {
        match btr_search_guess_on_hash(db, index, tuple, mode, latch_mode, mtr)? {
            HashGuess::Hit(cur) => return Ok(cur),
            HashGuess::Stale => stale_hash = true,
            HashGuess::NoEntry => {}
        }
    }

    let mut cur = btr_cur_descend(index, level, latch_mode, mtr, |page, is_target| {
        if is_target {
            page.search_with_match(tuple, mode)
        } else {
            page.search_with_match(tuple, non_leaf_mode(mode))
        }
    })?;

    if stale_hash {
        cur.method = BtrSearchMethod::HashMiss;
    }
    if hashable {
        let exact = match mode {
            PageCurMode::LE => cur.low_match >= index.n_uniq(),
            _ => cur.up_match >= index.n_uniq(),
        };
        if exact && cur.is_on_user_rec(mtr)? {
            db.ahi()
                .insert(index.id(), tuple.encode_prefix(index.n_uniq()), cur.page_id.page_no);
        }
    }
    Ok(cur)
}

/// Position a cursor before the first (`from_left`) or after the last
/// record of the leaf level.
pub fn btr_cur_open_at_index_side(
    from_left: bool,
    index: &Arc<Index>,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    btr_cur_descend(index, 0, latch_mode, mtr, |page, is_target| {
        match (is_target, from_left) {
            (false, true) => (1, 0, 0),
            (false, false) => (page.n_recs(), 0, 0),
            (true, true) => (0, 0, 0),
            (true, false) => (page.supremum_slot(), 0, 0),
        }
    })
}

/// Position a cursor on a random user record of the leaf level (on the
/// infimum of an empty tree).
pub fn btr_cur_open_at_rnd_pos(
    index: &Arc<Index>,
    latch_mode: BtrLatchMode,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    let mut rng = rand::thread_rng();
    let cur = btr_cur_descend(index, 0, latch_mode, mtr, |page, _| {
        if page.is_empty() {
            (0, 0, 0)
        } else {
            (rng.gen_range(1, page.n_recs() + 1), 0, 0)
        }
    })?;
    debug!("random position on {} slot {}", cur.page_id, cur.slot);
    Ok(cur)
}
