use std::sync::Arc;

use log::{debug, info};

use crate::{
    btree::{AdaptiveHash, BtrStats},
    config::Config,
    dict::{
        clust_index_fields, sec_index_fields, Dict, ForeignKey, Index, IndexKind, Table,
        TableDef,
    },
    error::{ErrorCode, SmallError},
    que::QueThr,
    storage::{BufPool, Fsp, LogSys, MlogType, Mtr, PageId},
    transaction::{trx_purge, trx_purge_all, trx_start, PurgeSys, TrxSys, UndoSpace},
    lock::LockSys,
    types::SmallResult,
    utils::HandyRwLock,
};

/// Space id of the index pages and off-page columns.
pub const INDEX_SPACE_ID: u32 = 0;

/// We collect all the shared state of the storage core here.
///
/// Every component is owned by the database and reached through it, so
/// several independent databases may live in one process (one per test).
pub struct Database {
    config: Config,

    pub(crate) buf: Arc<BufPool>,
    pub(crate) log_sys: Arc<LogSys>,
    fsp: Fsp,
    undo_space: UndoSpace,

    dict: Dict,
    trx_sys: TrxSys,
    lock_sys: LockSys,
    purge_sys: PurgeSys,

    ahi: AdaptiveHash,
    stats: BtrStats,
}

impl Database {
    pub fn new(config: Config) -> Result<Arc<Self>, SmallError> {
        config.validate()?;
        info!(
            "new database, page size {}, compress limit {}",
            config.page_size,
            config.compress_limit()
        );
        Ok(Arc::new(Self {
            buf: Arc::new(BufPool::new(config.page_size)),
            log_sys: Arc::new(LogSys::new()),
            fsp: Fsp::new(INDEX_SPACE_ID, config.max_space_pages),
            undo_space: UndoSpace::new(config.page_size),
            dict: Dict::new(),
            trx_sys: TrxSys::new(),
            lock_sys: LockSys::new(),
            purge_sys: PurgeSys::new(),
            ahi: AdaptiveHash::new(config.adaptive_hash),
            stats: BtrStats::default(),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buf(&self) -> &BufPool {
        &self.buf
    }

    pub fn log_sys(&self) -> &LogSys {
        &self.log_sys
    }

    pub fn fsp(&self) -> &Fsp {
        &self.fsp
    }

    pub fn undo_space(&self) -> &UndoSpace {
        &self.undo_space
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    pub fn trx_sys(&self) -> &TrxSys {
        &self.trx_sys
    }

    pub fn lock_sys(&self) -> &LockSys {
        &self.lock_sys
    }

    pub fn purge_sys(&self) -> &PurgeSys {
        &self.purge_sys
    }

    pub fn ahi(&self) -> &AdaptiveHash {
        &self.ahi
    }

    pub fn stats(&self) -> &BtrStats {
        &self.stats
    }

    /// Start a transaction and wrap it in a query thread.
    pub fn begin(&self) -> QueThr {
        QueThr::new(trx_start(self))
    }

    /// One purge batch, returns the number of undo pages freed.
    pub fn purge(&self) -> Result<usize, SmallError> {
        trx_purge(self)
    }

    /// Purge everything the open read views allow.
    pub fn purge_all(&self) -> Result<usize, SmallError> {
        trx_purge_all(self)
    }

    /// Create a table with its clustered index, its secondary indexes and
    /// its foreign keys. An index is created for every foreign key which
    /// no index of the table can serve.
    pub fn create_table(&self, def: TableDef) -> Result<Arc<Table>, SmallError> {
        if def.pk.is_empty() {
            return Err(SmallError::internal(&format!(
                "table {} has no primary key",
                def.name
            )));
        }
        if self.dict.table_by_name(&def.name).is_some() {
            return Err(SmallError::new(
                ErrorCode::DuplicateKey,
                &format!("table {} exists", def.name),
            ));
        }
        let all_cols = def.pk.iter().chain(def.secondary.iter().flat_map(|i| i.cols.iter()));
        for col in all_cols {
            if *col >= def.columns.len() {
                return Err(SmallError::internal(&format!("no column {}", col)));
            }
        }

        // the foreign check latch keeps checks out while constraints change
        let _guard = self.dict.foreign_check_latch().wl();

        let table_id = self.dict.next_id();
        let n_pk = def.pk.len();
        let indexed: Vec<usize> = def
            .secondary
            .iter()
            .flat_map(|i| i.cols.iter())
            .chain(def.foreign.iter().flat_map(|f| f.cols.iter()))
            .copied()
            .collect();

        // step 1: clustered index
        let clust = self.create_index(
            table_id,
            "PRIMARY",
            IndexKind::Clustered,
            true,
            clust_index_fields(&def.columns, &def.pk, &indexed),
            n_pk,
            n_pk,
        )?;

        // step 2: secondary indexes
        let mut secondary = Vec::new();
        for idef in &def.secondary {
            let fields = sec_index_fields(&def.columns, &idef.cols, &def.pk);
            let n_fields = fields.len();
            let index = self.create_index(
                table_id,
                &idef.name,
                IndexKind::Secondary,
                idef.unique,
                fields,
                n_fields,
                idef.cols.len(),
            )?;
            secondary.push(index);
        }

        // step 3: foreign keys
        let mut foreign = Vec::new();
        for fdef in &def.foreign {
            let parent = self.dict.table_by_name(&fdef.parent_table).ok_or_else(|| {
                SmallError::new(
                    ErrorCode::RecordNotFound,
                    &format!("no parent table {}", fdef.parent_table),
                )
            })?;
            let parent_index = std::iter::once(parent.clust_index())
                .chain(parent.secondary_indexes().iter())
                .find(|i| i.is_unique() && leading_cols(i, &fdef.parent_cols))
                .cloned()
                .ok_or_else(|| {
                    SmallError::internal(&format!(
                        "no unique index of {} on {:?}",
                        parent.name(),
                        fdef.parent_cols
                    ))
                })?;

            let child_index = match secondary
                .iter()
                .chain(std::iter::once(&clust))
                .find(|i| leading_cols(i, &fdef.cols))
            {
                Some(index) => Arc::clone(index),
                None => {
                    let fields = sec_index_fields(&def.columns, &fdef.cols, &def.pk);
                    let n_fields = fields.len();
                    let index = self.create_index(
                        table_id,
                        &fdef.name,
                        IndexKind::Secondary,
                        false,
                        fields,
                        n_fields,
                        fdef.cols.len(),
                    )?;
                    secondary.push(Arc::clone(&index));
                    index
                }
            };

            foreign.push(Arc::new(ForeignKey {
                name: fdef.name.clone(),
                child_table: table_id,
                child_cols: fdef.cols.clone(),
                child_index,
                parent_table: parent.id(),
                parent_cols: fdef.parent_cols.clone(),
                parent_index,
            }));
        }

        let table = Arc::new(Table::new(
            table_id,
            &def.name,
            def.columns,
            def.pk,
            clust,
            secondary,
            foreign,
        ));
        self.dict.add_table(Arc::clone(&table));
        info!("created {:?}", table);
        Ok(table)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_index(
        &self,
        table_id: u64,
        name: &str,
        kind: IndexKind,
        unique: bool,
        fields: Vec<crate::dict::IndexField>,
        n_uniq: usize,
        n_unique_check: usize,
    ) -> Result<Arc<Index>, SmallError> {
        let id = self.dict.next_id();
        let root_page_no = self.create_root(id)?;
        let index = Index::new(
            id,
            table_id,
            name,
            kind,
            unique,
            fields,
            n_uniq,
            n_unique_check,
            INDEX_SPACE_ID,
            root_page_no,
        );
        debug!("created {:?}", index);
        Ok(Arc::new(index))
    }

    /// Allocate and initialize the root page of a new index, an empty
    /// leaf.
    fn create_root(&self, index_id: u64) -> Result<u32, SmallError> {
        let page_no = self.fsp.alloc_page()?;
        let pid = PageId::new(INDEX_SPACE_ID, page_no);
        let mut mtr = Mtr::start(self);
        mtr.latch_new_page(&pid)?;
        mtr.page_mut(&pid)?.init_index(index_id, 0);
        mtr.log(MlogType::PageCreate, pid, Vec::new());
        mtr.commit();
        Ok(page_no)
    }

    /// Validate every index of the table, see `btr_check_integrity`.
    pub fn check_table(&self, table: &Table) -> SmallResult {
        for index in std::iter::once(table.clust_index()).chain(table.secondary_indexes().iter()) {
            crate::btree::btr_check_integrity(self, index)?;
        }
        Ok(())
    }
}

fn leading_cols(index: &Index, cols: &[usize]) -> bool {
    cols.len() <= index.n_fields()
        && cols
            .iter()
            .enumerate()
            .all(|(i, c)| index.field(i).col == Some(*c))
}
