use std::sync::Arc;

use log::debug;

use super::{
    cursor::{btr_cur_search_to_nth_level, BtrCur},
    delete::btr_cur_pessimistic_delete,
    BtrLatchMode, BtrStats,
};
use crate::{
    data::{DField, DTuple},
    database::Database,
    dict::{Index, NODE_PTR_CHILD_LEN},
    error::{ErrorCode, SmallError},
    io::SmallWriter,
    storage::{page_capacity, MlogType, Mtr, PageCurMode, PageId, Rec, RwMode},
    types::SmallResult,
};

/// Child page number stored in the last field of a node pointer.
pub fn btr_node_ptr_get_child(rec: &Rec) -> Result<u32, SmallError> {
    rec.fields
        .last()
        .and_then(|f| f.as_u64())
        .map(|v| v as u32)
        .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "malformed node pointer"))
}

/// Node pointer to `page_no` whose key is the unique prefix of `rec`.
pub(crate) fn dict_index_build_node_ptr(index: &Index, rec: &Rec, page_no: u32) -> Rec {
    let n_uniq = index.n_uniq().min(rec.fields.len());
    let mut fields = rec.fields[..n_uniq].to_vec();
    fields.push(DField::sys_u64(page_no as u64, NODE_PTR_CHILD_LEN));
    Rec {
        info_bits: 0,
        fields,
    }
}

/// Search tuple made of the key part of a record.
pub(crate) fn node_ptr_search_tuple(index: &Index, rec: &Rec) -> DTuple {
    let n_uniq = index.n_uniq().min(rec.fields.len());
    DTuple::new(rec.fields[..n_uniq].to_vec())
}

fn slot_body(page_no: u32, slot: usize) -> Vec<u8> {
    let mut writer = SmallWriter::new();
    writer.write_u32(page_no);
    writer.write_u16(slot as u16);
    writer.into_bytes()
}

/// Allocate a page and initialize it for the index.
pub(crate) fn btr_page_alloc(
    db: &Database,
    index: &Index,
    level: usize,
    mtr: &mut Mtr,
) -> Result<PageId, SmallError> {
    let page_no = db.fsp().alloc_page()?;
    let pid = PageId::new(index.space(), page_no);
    mtr.latch_new_page(&pid)?;
    mtr.page_mut(&pid)?.init_index(index.id(), level);
    mtr.log(MlogType::PageCreate, pid, slot_body(page_no, level));
    Ok(pid)
}

/// Allocate a page for an off-page chain, x-latched and not yet
/// initialized.
pub(crate) fn btr_page_alloc_blob(
    db: &Database,
    space: u32,
    mtr: &mut Mtr,
) -> Result<u32, SmallError> {
    let page_no = db.fsp().alloc_page()?;
    mtr.latch_new_page(&PageId::new(space, page_no))?;
    Ok(page_no)
}

/// Free an index or blob page. The page must be x-latched.
pub(crate) fn btr_page_free(db: &Database, pid: &PageId, mtr: &mut Mtr) -> SmallResult {
    mtr.page_mut(pid)?.free();
    db.fsp().free_page(pid.page_no);
    db.ahi().drop_page(pid.page_no);
    mtr.log(MlogType::PageFree, *pid, Vec::new());
    Ok(())
}

/// Insert `rec` after the cursor if the page has room for it.
///
/// Returns the slot of the new record.
pub(crate) fn btr_page_insert_if_fits(
    db: &Database,
    cur: &BtrCur,
    rec: Rec,
    mtr: &mut Mtr,
) -> Result<Option<usize>, SmallError> {
    let page_size = db.config().page_size;
    let page = cur.page_mut(mtr)?;
    if page.free_space(page_size) < rec.size() {
        return Ok(None);
    }
    let slot = page.insert_after(cur.slot, rec);
    mtr.log(
        MlogType::RecInsert,
        cur.page_id,
        slot_body(cur.page_id.page_no, slot),
    );
    Ok(Some(slot))
}

/// Cursor on the node pointer of a non-root page, in the father page.
///
/// Needs the tree x-latch, the path is x-latched on the way.
pub fn btr_page_get_father(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    if *pid == index.root() {
        return Err(SmallError::internal("the root has no father"));
    }
    mtr.latch_page(pid, RwMode::X)?;
    let (level, prev, first) = {
        let page = mtr.page(pid)?;
        let first = page.rec(1).cloned().ok_or_else(|| {
            SmallError::new(
                ErrorCode::Corruption,
                &format!("father lookup of empty {:?}", page),
            )
        })?;
        (page.level(), page.prev(), first)
    };

    let father = if prev.is_none() {
        // leftmost page: its node pointer is the first record of the
        // leftmost page one level up
        let mut fpid = index.root();
        loop {
            mtr.latch_page(&fpid, RwMode::X)?;
            let (flevel, child) = {
                let page = mtr.page(&fpid)?;
                let rec = page.rec(1).ok_or_else(|| {
                    SmallError::new(ErrorCode::Corruption, &format!("empty non-leaf {:?}", page))
                })?;
                (page.level(), btr_node_ptr_get_child(rec)?)
            };
            if flevel == level + 1 {
                let mut cur = BtrCur::new(index, fpid, 1);
                cur.tree_height = mtr.page(&index.root())?.level() + 1;
                break cur;
            }
            if flevel <= level {
                return Err(SmallError::new(
                    ErrorCode::Corruption,
                    &format!("no father of {} on the leftmost path", pid),
                ));
            }
            fpid = PageId::new(index.space(), child);
        }
    } else {
        let mut tuple = node_ptr_search_tuple(index, &first);
        tuple.set_n_fields_cmp(tuple.n_fields());
        btr_cur_search_to_nth_level(
            db,
            index,
            level + 1,
            &tuple,
            PageCurMode::LE,
            BtrLatchMode::ModifyTree,
            mtr,
        )?
    };

    let child = btr_node_ptr_get_child(father.user_rec(mtr)?)?;
    if child != pid.page_no {
        return Err(SmallError::new(
            ErrorCode::Corruption,
            &format!(
                "node pointer {} slot {} points to page {} instead of {}",
                father.page_id, father.slot, child, pid
            ),
        ));
    }
    Ok(father)
}

/// Insert a node pointer on a non-leaf level, splitting as needed.
pub fn btr_insert_on_non_leaf_level(
    db: &Database,
    index: &Arc<Index>,
    level: usize,
    node_ptr: Rec,
    mtr: &mut Mtr,
) -> SmallResult {
    let mut tuple = node_ptr_search_tuple(index, &node_ptr);
    tuple.set_n_fields_cmp(tuple.n_fields());
    let cur = btr_cur_search_to_nth_level(
        db,
        index,
        level,
        &tuple,
        PageCurMode::LE,
        BtrLatchMode::ModifyTree,
        mtr,
    )?;

    if btr_page_insert_if_fits(db, &cur, node_ptr.clone(), mtr)?.is_some() {
        return Ok(());
    }
    if cur.is_root() {
        btr_root_raise_and_insert(db, &cur, node_ptr, mtr)?;
    } else {
        btr_page_split_and_insert(db, &cur, node_ptr, mtr)?;
    }
    Ok(())
}

/// Choose how many of `recs` stay on the left page.
fn btr_page_choose_split(recs: &[Rec], capacity: usize) -> Result<usize, SmallError> {
    let total: usize = recs.iter().map(|r| r.size()).sum();
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for k in 1..recs.len() {
        left += recs[k - 1].size();
        let right = total - left;
        if left > capacity {
            break;
        }
        if right > capacity {
            continue;
        }
        let diff = if left > right { left - right } else { right - left };
        match best {
            Some((_, d)) if d <= diff => {}
            _ => best = Some((k, diff)),
        }
    }
    best.map(|(k, _)| k).ok_or_else(|| {
        SmallError::internal(&format!(
            "no split point for {} records of {} bytes",
            recs.len(),
            total
        ))
    })
}

/// Split the page of the cursor and insert `rec` after the cursor
/// position. The new page becomes the right sibling, its node pointer is
/// inserted one level up.
///
/// Returns a cursor on the inserted record.
pub fn btr_page_split_and_insert(
    db: &Database,
    cur: &BtrCur,
    rec: Rec,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    let index = Arc::clone(&cur.index);
    let pid = cur.page_id;
    let capacity = page_capacity(db.config().page_size);

    // step 1: lay out the records of both halves
    let (level, next, n_recs) = {
        let page = mtr.page(&pid)?;
        (page.level(), page.next(), page.n_recs())
    };
    let ins_pos = cur.slot.min(n_recs);
    let mut all = mtr.page_mut(&pid)?.take_recs();
    all.insert(ins_pos, rec);

    let split_at = if n_recs > 0 && ins_pos == n_recs && next.is_none() {
        // inserting at the end of the level, keep the left page full
        n_recs
    } else {
        match btr_page_choose_split(&all, capacity) {
            Ok(k) => k,
            Err(e) => {
                all.remove(ins_pos);
                mtr.page_mut(&pid)?.set_recs(all);
                return Err(e);
            }
        }
    };
    let right_recs = all.split_off(split_at);

    // step 2: the new page, linked to the right of the old one
    let new_pid = btr_page_alloc(db, &index, level, mtr)?;
    {
        let page = mtr.page_mut(&pid)?;
        page.set_recs(all);
        page.set_next(Some(new_pid.page_no));
    }
    let node_ptr = {
        let new_page = mtr.page_mut(&new_pid)?;
        new_page.set_recs(right_recs);
        new_page.set_prev(Some(pid.page_no));
        new_page.set_next(next);
        let first = new_page.rec(1).ok_or_else(|| SmallError::internal("split produced an empty page"))?;
        dict_index_build_node_ptr(&index, first, new_pid.page_no)
    };
    if let Some(next) = next {
        let next_pid = PageId::new(pid.space, next);
        mtr.latch_page(&next_pid, RwMode::X)?;
        mtr.page_mut(&next_pid)?.set_prev(Some(new_pid.page_no));
    }
    mtr.log(MlogType::PageSplit, pid, slot_body(new_pid.page_no, split_at));
    BtrStats::inc(&db.stats().n_splits);
    debug!(
        "split {} at {} of {} recs, new right page {}, level {}",
        pid,
        split_at,
        n_recs + 1,
        new_pid,
        level
    );

    // step 3: the father learns about the new page
    btr_insert_on_non_leaf_level(db, &index, level + 1, node_ptr, mtr)?;

    let mut new_cur = cur.clone();
    if ins_pos < split_at {
        new_cur.page_id = pid;
        new_cur.slot = ins_pos + 1;
    } else {
        new_cur.page_id = new_pid;
        new_cur.slot = ins_pos - split_at + 1;
    }
    new_cur.tree_height = mtr.page(&index.root())?.level() + 1;
    Ok(new_cur)
}

/// Make the tree one level higher: the root content moves to a new page
/// which becomes the only child of the root, then that page is split to
/// make room for `rec`.
pub fn btr_root_raise_and_insert(
    db: &Database,
    cur: &BtrCur,
    rec: Rec,
    mtr: &mut Mtr,
) -> Result<BtrCur, SmallError> {
    let index = Arc::clone(&cur.index);
    let root = index.root();
    if cur.page_id != root {
        return Err(SmallError::internal("root raise on a non-root page"));
    }

    let level = mtr.page(&root)?.level();
    let new_pid = btr_page_alloc(db, &index, level, mtr)?;
    let recs = mtr.page_mut(&root)?.take_recs();
    if recs.is_empty() {
        return Err(SmallError::internal("root raise of an empty root"));
    }
    let mut node_ptr = dict_index_build_node_ptr(&index, &recs[0], new_pid.page_no);
    node_ptr.set_min_rec(true);
    mtr.page_mut(&new_pid)?.set_recs(recs);

    {
        let root_page = mtr.page_mut(&root)?;
        root_page.set_level(level + 1);
        root_page.set_recs(vec![node_ptr]);
    }
    mtr.log(MlogType::PageSplit, root, slot_body(new_pid.page_no, 0));
    BtrStats::inc(&db.stats().n_root_raises);
    debug!("root raise of {:?}: level {} -> {}", index, level, level + 1);

    let mut new_cur = cur.clone();
    new_cur.page_id = new_pid;
    btr_page_split_and_insert(db, &new_cur, rec, mtr)
}

/// Mark the record in `slot` as the minimum record of its level.
pub(crate) fn btr_set_min_rec_mark(pid: &PageId, slot: usize, mtr: &mut Mtr) -> SmallResult {
    let page = mtr.page_mut(pid)?;
    match page.rec_mut(slot) {
        Some(rec) => rec.set_min_rec(true),
        None => return Err(SmallError::internal("min rec mark on a page boundary")),
    }
    mtr.log(MlogType::RecMinMark, *pid, slot_body(pid.page_no, slot));
    Ok(())
}

/// Delete the node pointer of a page from its father.
pub(crate) fn btr_node_ptr_delete(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> SmallResult {
    let father = btr_page_get_father(db, index, pid, mtr)?;
    btr_cur_pessimistic_delete(db, &father, true, false, mtr)
}

/// Remove a page from the doubly linked list of its level.
fn btr_level_list_remove(pid: &PageId, mtr: &mut Mtr) -> SmallResult {
    let (prev, next) = {
        let page = mtr.page(pid)?;
        (page.prev(), page.next())
    };
    if let Some(prev) = prev {
        let prev_pid = PageId::new(pid.space, prev);
        mtr.latch_page(&prev_pid, RwMode::X)?;
        mtr.page_mut(&prev_pid)?.set_next(next);
    }
    if let Some(next) = next {
        let next_pid = PageId::new(pid.space, next);
        mtr.latch_page(&next_pid, RwMode::X)?;
        mtr.page_mut(&next_pid)?.set_prev(prev);
    }
    Ok(())
}

/// Move every record of a page without siblings into the root, freeing
/// the page and the ancestors between it and the root.
pub fn btr_lift_page_up(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> SmallResult {
    let root = index.root();

    // step 1: collect the ancestors below the root
    let mut to_free = vec![*pid];
    let mut cur_pid = *pid;
    loop {
        let father = btr_page_get_father(db, index, &cur_pid, mtr)?;
        if father.page_id == root {
            break;
        }
        to_free.push(father.page_id);
        cur_pid = father.page_id;
    }

    // step 2: the root takes over the records and the level
    let (level, recs) = {
        let page = mtr.page_mut(pid)?;
        (page.level(), page.take_recs())
    };
    {
        let root_page = mtr.page_mut(&root)?;
        root_page.set_level(level);
        root_page.set_recs(recs);
    }
    for p in &to_free {
        btr_page_free(db, p, mtr)?;
    }
    mtr.log(MlogType::PageLift, root, slot_body(pid.page_no, level));
    BtrStats::inc(&db.stats().n_lifts);
    debug!("lift {} into the root, {} pages freed, root level {}", pid, to_free.len(), level);
    Ok(())
}

/// Try to merge a page with a sibling under the same father, or lift it
/// up when it is alone on its level.
///
/// Returns whether the page was merged or lifted, after which the
/// caller's cursors on it are invalid.
pub fn btr_compress(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> Result<bool, SmallError> {
    if *pid == index.root() {
        return Ok(false);
    }
    let capacity = page_capacity(db.config().page_size);

    let (prev, next, data_size) = {
        let page = mtr.page(pid)?;
        (page.prev(), page.next(), page.data_size())
    };
    if prev.is_none() && next.is_none() {
        btr_lift_page_up(db, index, pid, mtr)?;
        return Ok(true);
    }

    let father = btr_page_get_father(db, index, pid, mtr)?;
    let father_n_recs = father.page(mtr)?.n_recs();

    // merge into the left sibling
    if let (true, Some(prev)) = (father.slot > 1, prev) {
        let left_pid = PageId::new(pid.space, prev);
        mtr.latch_page(&left_pid, RwMode::X)?;
        if mtr.page(&left_pid)?.data_size() + data_size <= capacity {
            let recs = mtr.page_mut(pid)?.take_recs();
            mtr.page_mut(&left_pid)?.append_recs(recs);
            btr_level_list_remove(pid, mtr)?;
            btr_page_free(db, pid, mtr)?;
            btr_cur_pessimistic_delete(db, &father, true, false, mtr)?;

            mtr.log(MlogType::PageMerge, left_pid, slot_body(pid.page_no, 0));
            BtrStats::inc(&db.stats().n_merges);
            debug!("merged {} into its left sibling {}", pid, left_pid);
            return Ok(true);
        }
    }

    // merge the right sibling into this page
    if let (true, Some(next)) = (father.slot < father_n_recs, next) {
        let right_pid = PageId::new(pid.space, next);
        mtr.latch_page(&right_pid, RwMode::X)?;
        if mtr.page(&right_pid)?.data_size() + data_size <= capacity {
            let mut right_father = father.clone();
            right_father.slot += 1;
            let child = btr_node_ptr_get_child(right_father.user_rec(mtr)?)?;
            if child != next {
                return Err(SmallError::new(
                    ErrorCode::Corruption,
                    &format!("right sibling {} is not under the father of {}", right_pid, pid),
                ));
            }

            let recs = mtr.page_mut(&right_pid)?.take_recs();
            mtr.page_mut(pid)?.append_recs(recs);
            btr_level_list_remove(&right_pid, mtr)?;
            btr_page_free(db, &right_pid, mtr)?;
            btr_cur_pessimistic_delete(db, &right_father, true, false, mtr)?;

            mtr.log(MlogType::PageMerge, *pid, slot_body(next, 0));
            BtrStats::inc(&db.stats().n_merges);
            debug!("merged right sibling {} into {}", right_pid, pid);
            return Ok(true);
        }
    }

    Ok(false)
}

/// Remove a page holding a single record from the tree.
pub fn btr_discard_page(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> SmallResult {
    let (prev, next, level) = {
        let page = mtr.page(pid)?;
        (page.prev(), page.next(), page.level())
    };
    if prev.is_none() && next.is_none() {
        return btr_discard_only_page_on_level(db, index, pid, mtr);
    }

    if let (Some(next), None, true) = (next, prev, level > 0) {
        // the right sibling becomes the leftmost page of the level
        let right_pid = PageId::new(pid.space, next);
        mtr.latch_page(&right_pid, RwMode::X)?;
        btr_set_min_rec_mark(&right_pid, 1, mtr)?;
    }

    btr_node_ptr_delete(db, index, pid, mtr)?;
    btr_level_list_remove(pid, mtr)?;
    btr_page_free(db, pid, mtr)?;
    BtrStats::inc(&db.stats().n_discards);
    debug!("discarded {} at level {}", pid, level);
    Ok(())
}

/// Free a page which is alone on its level together with its ancestors,
/// and make the root an empty leaf.
fn btr_discard_only_page_on_level(
    db: &Database,
    index: &Arc<Index>,
    pid: &PageId,
    mtr: &mut Mtr,
) -> SmallResult {
    let root = index.root();
    let mut cur_pid = *pid;
    while cur_pid != root {
        let father = btr_page_get_father(db, index, &cur_pid, mtr)?;
        btr_page_free(db, &cur_pid, mtr)?;
        cur_pid = father.page_id;
    }

    mtr.page_mut(&root)?.init_index(index.id(), 0);
    mtr.log(MlogType::PageCreate, root, slot_body(root.page_no, 0));
    BtrStats::inc(&db.stats().n_discards);
    debug!("{:?} is empty again", index);
    Ok(())
}
