use std::{fmt, sync::Arc};

use super::index::Index;
use crate::{data::DType, types::TableId};

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
}

impl Column {
    pub fn new(name: &str, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
        }
    }
}

/// A referential constraint, RESTRICT semantics on both sides.
#[derive(Debug)]
pub struct ForeignKey {
    pub name: String,
    pub child_table: TableId,
    pub child_cols: Vec<usize>,

    /// Child index whose leading fields are `child_cols`.
    pub child_index: Arc<Index>,

    pub parent_table: TableId,
    pub parent_cols: Vec<usize>,

    /// Unique parent index whose leading fields are `parent_cols`.
    pub parent_index: Arc<Index>,
}

pub struct Table {
    id: TableId,
    name: String,
    columns: Vec<Column>,
    pk: Vec<usize>,
    clust: Arc<Index>,
    secondary: Vec<Arc<Index>>,

    // constraints where this table is the child
    foreign: Vec<Arc<ForeignKey>>,
}

impl Table {
    pub(crate) fn new(
        id: TableId,
        name: &str,
        columns: Vec<Column>,
        pk: Vec<usize>,
        clust: Arc<Index>,
        secondary: Vec<Arc<Index>>,
        foreign: Vec<Arc<ForeignKey>>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            columns,
            pk,
            clust,
            secondary,
            foreign,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn pk(&self) -> &[usize] {
        &self.pk
    }

    pub fn clust_index(&self) -> &Arc<Index> {
        &self.clust
    }

    pub fn secondary_indexes(&self) -> &[Arc<Index>] {
        &self.secondary
    }

    pub fn foreign_keys(&self) -> &[Arc<ForeignKey>] {
        &self.foreign
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "table<{} #{}, {} cols>", self.name, self.id, self.columns.len())
    }
}

/// Definition used to create a table.
#[derive(Debug, Clone, Default)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,

    /// Primary key columns, required.
    pub pk: Vec<usize>,
    pub secondary: Vec<IndexDef>,
    pub foreign: Vec<ForeignDef>,
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub cols: Vec<usize>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct ForeignDef {
    pub name: String,
    pub cols: Vec<usize>,
    pub parent_table: String,
    pub parent_cols: Vec<usize>,
}

impl TableDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn column(mut self, name: &str, dtype: DType) -> Self {
        self.columns.push(Column::new(name, dtype));
        self
    }

    pub fn primary_key(mut self, cols: &[usize]) -> Self {
        self.pk = cols.to_vec();
        self
    }

    pub fn index(mut self, name: &str, cols: &[usize], unique: bool) -> Self {
        self.secondary.push(IndexDef {
            name: name.to_string(),
            cols: cols.to_vec(),
            unique,
        });
        self
    }

    pub fn foreign_key(
        mut self,
        name: &str,
        cols: &[usize],
        parent_table: &str,
        parent_cols: &[usize],
    ) -> Self {
        self.foreign.push(ForeignDef {
            name: name.to_string(),
            cols: cols.to_vec(),
            parent_table: parent_table.to_string(),
            parent_cols: parent_cols.to_vec(),
        });
        self
    }
}
