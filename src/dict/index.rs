use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    data::DType,
    storage::PageId,
    types::{IndexId, TableId},
};

/// Length of DB_TRX_ID in a clustered record.
pub const DATA_TRX_ID_LEN: usize = 6;

/// Length of DB_ROLL_PTR in a clustered record.
pub const DATA_ROLL_PTR_LEN: usize = 7;

/// Length of the child page number of a node pointer.
pub const NODE_PTR_CHILD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysCol {
    TrxId,
    RollPtr,
}

#[derive(Debug, Clone)]
pub struct IndexField {
    pub name: String,

    /// Table column stored in this field, `None` for system fields.
    pub col: Option<usize>,
    pub sys: Option<SysCol>,
    pub dtype: DType,

    /// The column is also an ordering field of another index of the
    /// table, its value is never stored off-page.
    pub indexed: bool,
}

impl IndexField {
    pub fn is_sys(&self) -> bool {
        self.sys.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Clustered,
    Secondary,
}

/// An index tree.
///
/// Clustered entries are `[pk.., DB_TRX_ID, DB_ROLL_PTR, other columns..]`,
/// secondary entries are `[index columns.., pk columns not yet present..]`.
pub struct Index {
    id: IndexId,
    table_id: TableId,
    name: String,
    kind: IndexKind,
    unique: bool,
    fields: Vec<IndexField>,

    // fields which identify an entry in the tree
    n_uniq: usize,

    // fields checked by the duplicate-key test of a unique index
    n_unique_check: usize,

    space: u32,
    root_page_no: u32,
    tree_latch: Arc<RwLock<()>>,
}

impl Index {
    pub(crate) fn new(
        id: IndexId,
        table_id: TableId,
        name: &str,
        kind: IndexKind,
        unique: bool,
        fields: Vec<IndexField>,
        n_uniq: usize,
        n_unique_check: usize,
        space: u32,
        root_page_no: u32,
    ) -> Self {
        Self {
            id,
            table_id,
            name: name.to_string(),
            kind,
            unique,
            fields,
            n_uniq,
            n_unique_check,
            space,
            root_page_no,
            tree_latch: Arc::new(RwLock::new(())),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_clustered(&self) -> bool {
        self.kind == IndexKind::Clustered
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn n_uniq(&self) -> usize {
        self.n_uniq
    }

    pub fn n_unique_check(&self) -> usize {
        self.n_unique_check
    }

    pub fn field(&self, i: usize) -> &IndexField {
        &self.fields[i]
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn root(&self) -> PageId {
        PageId::new(self.space, self.root_page_no)
    }

    pub fn tree_latch(&self) -> &Arc<RwLock<()>> {
        &self.tree_latch
    }

    /// Position of DB_TRX_ID, clustered index only.
    pub fn trx_id_pos(&self) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.sys == Some(SysCol::TrxId))
    }

    /// Position of DB_ROLL_PTR, clustered index only.
    pub fn roll_ptr_pos(&self) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.sys == Some(SysCol::RollPtr))
    }

    /// Position of a table column inside the entries of this index.
    pub fn col_pos(&self, col: usize) -> Option<usize> {
        self.fields.iter().position(|f| f.col == Some(col))
    }

    /// Table columns of the ordering fields.
    pub fn ord_cols(&self) -> Vec<usize> {
        self.fields[..self.n_uniq]
            .iter()
            .filter_map(|f| f.col)
            .collect()
    }

    pub fn is_ord_col(&self, col: usize) -> bool {
        self.fields[..self.n_uniq].iter().any(|f| f.col == Some(col))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "index<{} #{}, {:?}, n_uniq {}, root {}>",
            self.name,
            self.id,
            self.kind,
            self.n_uniq,
            self.root()
        )
    }
}
