mod catalog;
mod index;
mod table;

pub(crate) use catalog::{clust_index_fields, sec_index_fields};
pub use catalog::Dict;
pub use index::{
    Index, IndexField, IndexKind, SysCol, DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN, NODE_PTR_CHILD_LEN,
};
pub use table::{Column, ForeignDef, ForeignKey, IndexDef, Table, TableDef};
