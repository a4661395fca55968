mod cursor;
mod debug;
mod delete;
mod ext;
mod hash;
mod insert;
mod pcur;
mod tree;
mod update;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use cursor::{btr_cur_open_at_index_side, btr_cur_open_at_rnd_pos, btr_cur_search_to_nth_level, BtrCur, BtrSearchMethod};
pub use debug::{btr_check_integrity, btr_draw_tree, btr_n_pages_at_level, btr_tree_height};
pub use delete::{
    btr_cur_compress_recommendation, btr_cur_optimistic_delete, btr_cur_pessimistic_delete,
};
pub use ext::{
    btr_copy_externally_stored_field, btr_cur_disown_inherited_fields,
    btr_cur_mark_dtuple_inherited_extern, btr_cur_unmark_extern_fields,
    btr_free_externally_stored_field, btr_rec_free_externally_stored_fields,
    btr_rec_free_updated_extern_fields, btr_store_big_rec_extern_fields,
};
pub use hash::AdaptiveHash;
pub use insert::{btr_cur_optimistic_insert, btr_cur_pessimistic_insert};
pub use pcur::{BtrPcur, BtrPcurPosState, BtrPcurRelPos};
pub use tree::{
    btr_compress, btr_discard_page, btr_insert_on_non_leaf_level, btr_lift_page_up,
    btr_node_ptr_get_child, btr_page_get_father, btr_page_split_and_insert,
    btr_root_raise_and_insert,
};
pub use update::{
    btr_cur_del_mark_set_clust_rec, btr_cur_del_mark_set_sec_rec, btr_cur_optimistic_update,
    btr_cur_pessimistic_update, btr_cur_update_in_place,
};

/// Do not write undo for the change.
pub const BTR_NO_UNDO_LOG_FLAG: u32 = 1;

/// Do not take record locks.
pub const BTR_NO_LOCKING_FLAG: u32 = 2;

/// Leave DB_TRX_ID and DB_ROLL_PTR of the record as they are.
pub const BTR_KEEP_SYS_FLAG: u32 = 4;

/// What a tree descent latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtrLatchMode {
    /// S-latch the leaf.
    SearchLeaf,
    /// X-latch the leaf.
    ModifyLeaf,
    /// S-latch the leaf and its left sibling.
    SearchPrev,
    /// X-latch the leaf and its left sibling.
    ModifyPrev,
    /// X-latch the tree and every page on the path, plus the leaf's
    /// siblings.
    ModifyTree,
}

impl BtrLatchMode {
    pub fn is_modify(&self) -> bool {
        matches!(
            self,
            BtrLatchMode::ModifyLeaf | BtrLatchMode::ModifyPrev | BtrLatchMode::ModifyTree
        )
    }
}

/// Counters of structural tree changes.
#[derive(Debug, Default)]
pub struct BtrStats {
    pub n_splits: AtomicUsize,
    pub n_root_raises: AtomicUsize,
    pub n_merges: AtomicUsize,
    pub n_discards: AtomicUsize,
    pub n_lifts: AtomicUsize,
}

impl BtrStats {
    pub(crate) fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn splits(&self) -> usize {
        self.n_splits.load(Ordering::Relaxed)
    }

    pub fn root_raises(&self) -> usize {
        self.n_root_raises.load(Ordering::Relaxed)
    }

    pub fn merges(&self) -> usize {
        self.n_merges.load(Ordering::Relaxed)
    }

    pub fn discards(&self) -> usize {
        self.n_discards.load(Ordering::Relaxed)
    }

    pub fn lifts(&self) -> usize {
        self.n_lifts.load(Ordering::Relaxed)
    }
}
