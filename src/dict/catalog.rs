use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use super::{
    index::{IndexField, SysCol, DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN},
    table::{Column, ForeignKey, Table},
};
use crate::{
    data::DType,
    types::TableId,
    utils::HandyRwLock,
};

/// The data dictionary: tables, their indexes and foreign keys.
pub struct Dict {
    tables: RwLock<HashMap<TableId, Arc<Table>>>,

    /// Foreign key checks run holding this latch in shared mode, changes
    /// of the constraint set hold it exclusively.
    foreign_check_latch: RwLock<()>,

    next_id: AtomicU64,
}

impl Dict {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            foreign_check_latch: RwLock::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn foreign_check_latch(&self) -> &RwLock<()> {
        &self.foreign_check_latch
    }

    pub(crate) fn add_table(&self, table: Arc<Table>) {
        self.tables.wl().insert(table.id(), table);
    }

    pub fn get_table(&self, id: TableId) -> Option<Arc<Table>> {
        self.tables.rl().get(&id).cloned()
    }

    pub fn table_by_name(&self, name: &str) -> Option<Arc<Table>> {
        self.tables
            .rl()
            .values()
            .find(|t| t.name() == name)
            .cloned()
    }

    /// Constraints in which the given table is the parent.
    pub fn referencing(&self, parent: TableId) -> Vec<Arc<ForeignKey>> {
        self.tables
            .rl()
            .values()
            .flat_map(|t| t.foreign_keys().iter())
            .filter(|fk| fk.parent_table == parent)
            .cloned()
            .collect()
    }
}

fn column_field(columns: &[Column], col: usize) -> IndexField {
    IndexField {
        name: columns[col].name.clone(),
        col: Some(col),
        sys: None,
        dtype: columns[col].dtype,
        indexed: false,
    }
}

/// Fields of a clustered index: primary key, system fields, the rest.
/// Columns listed in `indexed` belong to some secondary index.
pub(crate) fn clust_index_fields(
    columns: &[Column],
    pk: &[usize],
    indexed: &[usize],
) -> Vec<IndexField> {
    let mut fields: Vec<IndexField> = pk.iter().map(|c| column_field(columns, *c)).collect();
    fields.push(IndexField {
        name: "DB_TRX_ID".to_string(),
        col: None,
        sys: Some(SysCol::TrxId),
        dtype: DType::sys(DATA_TRX_ID_LEN),
        indexed: false,
    });
    fields.push(IndexField {
        name: "DB_ROLL_PTR".to_string(),
        col: None,
        sys: Some(SysCol::RollPtr),
        dtype: DType::sys(DATA_ROLL_PTR_LEN),
        indexed: false,
    });
    for col in 0..columns.len() {
        if !pk.contains(&col) {
            let mut field = column_field(columns, col);
            field.indexed = indexed.contains(&col);
            fields.push(field);
        }
    }
    fields
}

/// Fields of a secondary index: its columns, then the primary key
/// columns it does not contain yet.
pub(crate) fn sec_index_fields(columns: &[Column], cols: &[usize], pk: &[usize]) -> Vec<IndexField> {
    let mut fields: Vec<IndexField> = cols.iter().map(|c| column_field(columns, *c)).collect();
    for col in pk {
        if !cols.contains(col) {
            fields.push(column_field(columns, *col));
        }
    }
    fields
}
