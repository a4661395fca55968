use std::fmt;

use crate::types::{TrxId, TrxNo};

/// Snapshot of the transaction system defining which changes a
/// consistent read sees.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadView {
    /// Transaction which opened the view, its own changes are visible.
    pub creator: TrxId,

    /// Changes of transactions with id >= this are invisible.
    pub low_limit_id: TrxId,

    /// Changes of transactions with id < this are visible.
    pub up_limit_id: TrxId,

    /// Transactions active when the view was opened, in ascending order.
    pub ids: Vec<TrxId>,

    /// Transactions with commit number < this committed before the view
    /// was opened, their undo logs are not needed by it.
    pub low_limit_no: TrxNo,
}

impl ReadView {
    pub fn changes_visible(&self, trx_id: TrxId) -> bool {
        if trx_id == self.creator || trx_id < self.up_limit_id {
            return true;
        }
        if trx_id >= self.low_limit_id {
            return false;
        }
        self.ids.binary_search(&trx_id).is_err()
    }

    /// The older of two views: a view which sees less.
    pub fn oldest(a: ReadView, b: ReadView) -> ReadView {
        if b.low_limit_no < a.low_limit_no
            || (b.low_limit_no == a.low_limit_no && b.up_limit_id < a.up_limit_id)
        {
            b
        } else {
            a
        }
    }
}

impl fmt::Debug for ReadView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "view<creator tx_{}, up {}, low {}, ids {:?}, low_no {}>",
            self.creator, self.up_limit_id, self.low_limit_id, self.ids, self.low_limit_no
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_visible() {
        let view = ReadView {
            creator: 7,
            low_limit_id: 10,
            up_limit_id: 4,
            ids: vec![4, 6, 7],
            low_limit_no: 3,
        };
        assert!(view.changes_visible(3));
        assert!(!view.changes_visible(4));
        assert!(view.changes_visible(5));
        assert!(!view.changes_visible(6));
        assert!(view.changes_visible(7));
        assert!(view.changes_visible(9));
        assert!(!view.changes_visible(10));
    }
}
