use std::sync::Arc;

use log::debug;

use super::{
    cursor::BtrCur,
    ext::btr_rec_free_externally_stored_fields,
    tree::{
        btr_compress, btr_discard_page, btr_insert_on_non_leaf_level, btr_node_ptr_delete,
        btr_set_min_rec_mark, dict_index_build_node_ptr,
    },
};
use crate::{
    database::Database,
    error::SmallError,
    io::SmallWriter,
    storage::{MlogType, Mtr},
    types::SmallResult,
};

/// Whether the page of the cursor should be merged with a sibling or
/// lifted up: it is not the root and it is either under-filled or
/// alone on its level.
pub fn btr_cur_compress_recommendation(
    db: &Database,
    cur: &BtrCur,
    mtr: &Mtr,
) -> Result<bool, SmallError> {
    if cur.is_root() {
        return Ok(false);
    }
    let page = cur.page(mtr)?;
    Ok(page.data_size() < db.config().compress_limit()
        || (page.prev().is_none() && page.next().is_none()))
}

/// Compress the page of the cursor if it is recommended. The cursor is
/// invalid when the page was merged.
pub(crate) fn btr_cur_compress_if_useful(
    db: &Database,
    cur: &BtrCur,
    mtr: &mut Mtr,
) -> Result<bool, SmallError> {
    if !btr_cur_compress_recommendation(db, cur, mtr)? {
        return Ok(false);
    }
    btr_compress(db, &cur.index, &cur.page_id, mtr)
}

fn delete_low(db: &Database, cur: &BtrCur, mtr: &mut Mtr) -> SmallResult {
    let index = &cur.index;
    let slot = cur.slot;
    let (rec, is_leaf) = {
        let page = cur.page_mut(mtr)?;
        let is_leaf = page.is_leaf();
        (page.delete_rec(slot), is_leaf)
    };
    if is_leaf {
        db.ahi()
            .remove(index.id(), &rec.to_tuple().encode_prefix(index.n_uniq()));
    }

    let mut writer = SmallWriter::new();
    writer.write_u32(cur.page_id.page_no);
    writer.write_u16(slot as u16);
    mtr.log(MlogType::RecDelete, cur.page_id, writer.into_bytes());
    Ok(())
}

/// Remove the record under the cursor if that leaves the page healthy.
///
/// Returns false, changing nothing, when the record has external fields
/// or the page would need a compress.
pub fn btr_cur_optimistic_delete(
    db: &Database,
    cur: &BtrCur,
    mtr: &mut Mtr,
) -> Result<bool, SmallError> {
    let (rec_size, has_ext) = {
        let rec = cur.user_rec(mtr)?;
        (rec.size(), rec.has_ext())
    };
    if has_ext {
        return Ok(false);
    }

    let page = cur.page(mtr)?;
    let allowed = if cur.is_root() {
        page.is_leaf()
    } else {
        page.data_size() - rec_size >= db.config().compress_limit()
            && (page.prev().is_some() || page.next().is_some())
            && page.n_recs() >= 2
    };
    if !allowed {
        return Ok(false);
    }

    delete_low(db, cur, mtr)?;
    Ok(true)
}

/// Remove the record under the cursor, restructuring the tree as
/// needed. The cursor must have been positioned with `ModifyTree` and is
/// invalid afterwards.
///
/// External fields owned by the record are freed, except the inherited
/// ones when `rollback` is set. A page left with no record is discarded,
/// an under-filled page is compressed.
pub fn btr_cur_pessimistic_delete(
    db: &Database,
    cur: &BtrCur,
    has_reserved: bool,
    rollback: bool,
    mtr: &mut Mtr,
) -> SmallResult {
    let index = Arc::clone(&cur.index);
    let pid = cur.page_id;

    let _reservation = if has_reserved {
        None
    } else {
        let height = mtr.page(&index.root())?.level() + 1;
        Some(db.fsp().reserve_free_extents(height)?)
    };

    // step 1: off-page fields
    if cur.user_rec(mtr)?.has_ext() {
        btr_rec_free_externally_stored_fields(db, cur, rollback, mtr)?;
    }

    let (n_recs, level, prev) = {
        let page = cur.page(mtr)?;
        (page.n_recs(), page.level(), page.prev())
    };

    // step 2: the last record takes the page with it
    if n_recs == 1 && !cur.is_root() {
        btr_discard_page(db, &index, &pid, mtr)?;
        debug!("pessimistic delete discarded {}", pid);
        return Ok(());
    }

    // step 3: the leftmost record of a non-leaf page is also the key of
    // its node pointer
    if level > 0 && cur.slot == 1 {
        if prev.is_none() {
            btr_set_min_rec_mark(&pid, 2, mtr)?;
        } else {
            let next_rec = cur
                .page(mtr)?
                .rec(2)
                .cloned()
                .ok_or_else(|| SmallError::internal("non-leaf page with one record"))?;
            btr_node_ptr_delete(db, &index, &pid, mtr)?;
            let node_ptr = dict_index_build_node_ptr(&index, &next_rec, pid.page_no);
            btr_insert_on_non_leaf_level(db, &index, level + 1, node_ptr, mtr)?;
        }
    }

    delete_low(db, cur, mtr)?;
    btr_cur_compress_if_useful(db, cur, mtr)?;
    Ok(())
}
