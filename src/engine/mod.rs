//! Storage engine: the orchestrator over heap files, B+tree indexes, the
//! WAL and the lock manager.
//!
//! Every operation follows the same shape: acquire locks, resolve the
//! before-image when one is needed, append the log record, mutate the data
//! page, maintain the indexes under the same LSN, update catalog counters.

mod dml;
mod indexes;
mod redo;

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, info};

use crate::{
    catalog::{Catalog, ColumnInfo, IndexInfo, TableInfo, TriggerInfo, ViewInfo},
    error::{DbError, ErrorKind},
    storage::{
        buffer_pool::BufferPool,
        page::PageType,
        tablespace::Tablespace,
        tuple::RowCodec,
    },
    transaction::{
        LockManager, LockMode, LogManager, LogRecordBody, ResourceId, Transaction,
    },
    types::{DbResult, Lsn, PageId, Pod, ResultPod},
    utils::HandyRwLock,
};

pub struct StorageEngine {
    data_dir: PathBuf,
    page_size: usize,
    buffer_size: usize,
    catalog: Pod<Catalog>,
    log_manager: Pod<LogManager>,
    lock_manager: Arc<LockManager>,
    /// `table` for heap pools, `table::index` for index pools.
    pools: Mutex<HashMap<String, Pod<BufferPool>>>,
}

impl StorageEngine {
    pub fn new(
        data_dir: PathBuf,
        page_size: usize,
        buffer_size: usize,
        catalog: Pod<Catalog>,
        log_manager: Pod<LogManager>,
        lock_manager: Arc<LockManager>,
    ) -> Result<Self, DbError> {
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).map_err(|e| DbError::io(&e.to_string()))?;
        }
        Ok(Self {
            data_dir,
            page_size,
            buffer_size,
            catalog,
            log_manager,
            lock_manager,
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_catalog(&self) -> Pod<Catalog> {
        self.catalog.clone()
    }

    fn open_pool(&self, key: &str, file_name: &str, key_col_types: &[u8]) -> ResultPod<BufferPool> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(key) {
            return Ok(pool.clone());
        }
        let tablespace = Tablespace::open(self.data_dir.join(file_name), self.page_size)?;
        let pool = Arc::new(RwLock::new(BufferPool::new(
            tablespace,
            self.buffer_size,
            self.log_manager.clone(),
            key_col_types,
        )));
        pools.insert(key.to_string(), pool.clone());
        Ok(pool)
    }

    pub(crate) fn table_pool(&self, table: &str) -> ResultPod<BufferPool> {
        let file_name = self.catalog.rl().get_table(table)?.file_name.clone();
        self.open_pool(table, &file_name, &[])
    }

    pub(crate) fn index_pool(&self, table: &str, index: &str) -> ResultPod<BufferPool> {
        let (file_name, key_col_types) = {
            let catalog = self.catalog.rl();
            let info = catalog.get_index(table, index)?;
            (info.file_name.clone(), info.key_col_types.clone())
        };
        self.open_pool(&format!("{}::{}", table, index), &file_name, &key_col_types)
    }

    pub(crate) fn row_codec(&self, table: &str) -> Result<RowCodec, DbError> {
        let catalog = self.catalog.rl();
        let info = catalog.get_table(table)?;
        Ok(RowCodec::new(&info.columns))
    }

    /// Drop the in-memory pools of a table (and its indexes) without
    /// touching any file. Used when replaying DROP_TABLE during analysis.
    pub(crate) fn forget_table_state(&self, table: &str) {
        let mut pools = self.pools.lock().unwrap();
        let prefix = format!("{}::", table);
        pools.retain(|key, _| key != table && !key.starts_with(&prefix));
    }

    // DDL

    pub fn create_table(
        &self,
        tx: &Transaction,
        table_name: &str,
        columns: Vec<ColumnInfo>,
    ) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        if self.catalog.rl().table_exists(table_name) {
            return Err(DbError::new(
                ErrorKind::AlreadyExists,
                &format!("table {} already exists", table_name),
            ));
        }

        self.log_manager.wl().append(
            tx,
            LogRecordBody::CreateTable {
                table_name: table_name.to_string(),
                columns: columns.clone(),
            },
        )?;

        let info = TableInfo::new(table_name, columns);
        let pk_column = info.primary_key_column().map(|c| c.column_name.clone());
        self.catalog.wl().add_table(info)?;
        self.table_pool(table_name)?;
        info!("created table {}", table_name);

        // a declared primary key gets its unique index automatically
        if let Some(pk) = pk_column {
            let index_name = format!("pk_{}_{}", table_name, pk);
            self.create_index(tx, table_name, &index_name, &[pk], true)?;
        }
        Ok(())
    }

    /// Returns false when `if_exists` suppressed a missing table.
    pub fn drop_table(
        &self,
        tx: &Transaction,
        table_name: &str,
        if_exists: bool,
    ) -> Result<bool, DbError> {
        if !self.catalog.rl().table_exists(table_name) {
            if if_exists {
                return Ok(false);
            }
            return Err(DbError::not_found(&format!(
                "table {} does not exist",
                table_name
            )));
        }

        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        self.log_manager.wl().append(
            tx,
            LogRecordBody::DropTable {
                table_name: table_name.to_string(),
            },
        )?;

        let info = self.catalog.rl().get_table(table_name)?.clone();

        // free the heap chain, then drop the backing files
        if let Some(root) = info.root_page_id {
            self.free_page_chain(table_name, root)?;
        }
        {
            let mut pools = self.pools.lock().unwrap();
            if let Some(pool) = pools.remove(table_name) {
                pool.wl().delete_file()?;
            }
            for index_name in info.indexes.keys() {
                if let Some(pool) = pools.remove(&format!("{}::{}", table_name, index_name)) {
                    pool.wl().delete_file()?;
                } else {
                    let path = self.data_dir.join(&info.indexes[index_name].file_name);
                    if path.exists() {
                        fs::remove_file(path).map_err(|e| DbError::io(&e.to_string()))?;
                    }
                }
            }
        }

        self.catalog.wl().remove_table(table_name)?;
        info!("dropped table {}", table_name);
        Ok(true)
    }

    fn free_page_chain(&self, table: &str, root: PageId) -> DbResult {
        let pool = self.table_pool(table)?;
        let mut current = Some(root);
        let mut visited = std::collections::HashSet::new();
        while let Some(page_id) = current {
            if !visited.insert(page_id) {
                break;
            }
            let next = {
                let mut pool_guard = pool.wl();
                let page = pool_guard.get_page(page_id, PageType::Heap)?;
                let next = page.rl().get_next_page_id();
                pool_guard.unpin_page(page_id, false);
                next
            };
            pool.wl().free_physical(page_id)?;
            current = next;
        }
        Ok(())
    }

    pub fn create_index(
        &self,
        tx: &Transaction,
        table_name: &str,
        index_name: &str,
        column_names: &[String],
        is_unique: bool,
    ) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;

        let key_col_types = {
            let catalog = self.catalog.rl();
            let info = catalog.get_table(table_name)?;
            if info.indexes.contains_key(index_name) {
                return Err(DbError::new(
                    ErrorKind::AlreadyExists,
                    &format!("index {} already exists on {}", index_name, table_name),
                ));
            }
            let mut types = Vec::with_capacity(column_names.len());
            for name in column_names {
                let idx = info.column_index(name).ok_or_else(|| {
                    DbError::not_found(&format!("column {} not found on {}", name, table_name))
                })?;
                types.push(info.columns[idx].data_type.key_type_tag());
            }
            types
        };

        let lsn = self.log_manager.wl().append(
            tx,
            LogRecordBody::CreateIndex {
                table_name: table_name.to_string(),
                index_name: index_name.to_string(),
                columns: column_names.to_vec(),
                key_col_types: key_col_types.clone(),
                is_unique,
            },
        )?;

        self.catalog.wl().add_index(
            table_name,
            IndexInfo {
                index_name: index_name.to_string(),
                file_name: format!("{}_{}.idx", table_name, index_name),
                root_page_id: None,
                column_names: column_names.to_vec(),
                key_col_types,
                index_type: "BTREE".to_string(),
                is_unique,
            },
        )?;

        // fresh root leaf, persisted immediately so the file is never empty
        let pool = self.index_pool(table_name, index_name)?;
        let root_page_id = {
            let mut pool_guard = pool.wl();
            let page = pool_guard.new_page(PageType::Leaf)?;
            let page_id = page.rl().get_page_id();
            pool_guard.unpin_page(page_id, true);
            pool_guard.flush_page(page_id)?;
            page_id
        };
        self.catalog
            .wl()
            .update_index_root_page(table_name, index_name, root_page_id)?;

        // existing rows are bulk-loaded under the index-creation lsn
        self.bulk_load_index(tx, table_name, index_name, lsn)?;
        info!("created index {} on {}", index_name, table_name);
        Ok(())
    }

    fn bulk_load_index(
        &self,
        tx: &Transaction,
        table_name: &str,
        index_name: &str,
        lsn: Lsn,
    ) -> DbResult {
        let rows = self.scan(tx, table_name)?;
        if rows.is_empty() {
            return Ok(());
        }
        let column_names = {
            let catalog = self.catalog.rl();
            catalog.get_index(table_name, index_name)?.column_names.clone()
        };
        let codec = self.row_codec(table_name)?;
        let mut btree = self.btree(table_name, index_name)?;
        for (row_id, row) in rows {
            let key_values = codec.project_key(&row, &column_names)?;
            let key = crate::storage::key::Key::from_values(&key_values)?;
            btree.insert(&key, row_id, lsn)?;
        }
        Ok(())
    }

    pub fn drop_index(
        &self,
        tx: &Transaction,
        table_name: &str,
        index_name: &str,
    ) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        // existence check before anything is logged
        let file_name = self
            .catalog
            .rl()
            .get_index(table_name, index_name)?
            .file_name
            .clone();

        self.log_manager.wl().append(
            tx,
            LogRecordBody::DropIndex {
                table_name: table_name.to_string(),
                index_name: index_name.to_string(),
            },
        )?;

        {
            let mut pools = self.pools.lock().unwrap();
            if let Some(pool) = pools.remove(&format!("{}::{}", table_name, index_name)) {
                pool.wl().delete_file()?;
            } else {
                let path = self.data_dir.join(&file_name);
                if path.exists() {
                    fs::remove_file(path).map_err(|e| DbError::io(&e.to_string()))?;
                }
            }
        }
        self.catalog.wl().remove_index(table_name, index_name)?;
        info!("dropped index {} on {}", index_name, table_name);
        Ok(())
    }

    // view DDL: catalog entries plus their log records; execution is the
    // query layer's concern

    pub fn create_view(
        &self,
        tx: &Transaction,
        view_name: &str,
        definition: &str,
        is_updatable: bool,
    ) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        if self.catalog.rl().view_exists(view_name) {
            return Err(DbError::new(
                ErrorKind::AlreadyExists,
                &format!("view {} already exists", view_name),
            ));
        }
        self.log_manager.wl().append(
            tx,
            LogRecordBody::CreateView {
                view_name: view_name.to_string(),
                definition: definition.to_string(),
                is_updatable,
            },
        )?;
        self.catalog.wl().install_view(ViewInfo {
            view_name: view_name.to_string(),
            definition: definition.to_string(),
            is_updatable,
        });
        Ok(())
    }

    pub fn alter_view(
        &self,
        tx: &Transaction,
        view_name: &str,
        definition: &str,
        is_updatable: Option<bool>,
    ) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        let is_updatable =
            is_updatable.unwrap_or(self.catalog.rl().get_view(view_name)?.is_updatable);
        self.log_manager.wl().append(
            tx,
            LogRecordBody::AlterView {
                view_name: view_name.to_string(),
                definition: definition.to_string(),
                is_updatable,
            },
        )?;
        self.catalog.wl().install_view(ViewInfo {
            view_name: view_name.to_string(),
            definition: definition.to_string(),
            is_updatable,
        });
        Ok(())
    }

    pub fn drop_view(&self, tx: &Transaction, view_name: &str) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        self.catalog.rl().get_view(view_name)?;
        self.log_manager.wl().append(
            tx,
            LogRecordBody::DropView {
                view_name: view_name.to_string(),
            },
        )?;
        self.catalog.wl().remove_view(view_name)?;
        Ok(())
    }

    pub fn create_trigger(&self, tx: &Transaction, info: TriggerInfo) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        if self.catalog.rl().trigger_exists(&info.trigger_name) {
            return Err(DbError::new(
                ErrorKind::AlreadyExists,
                &format!("trigger {} already exists", info.trigger_name),
            ));
        }
        self.log_manager
            .wl()
            .append(tx, LogRecordBody::CreateTrigger(info.clone()))?;
        self.catalog.wl().install_trigger(info);
        Ok(())
    }

    pub fn alter_trigger(&self, tx: &Transaction, info: TriggerInfo) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        self.catalog.rl().get_trigger(&info.trigger_name)?;
        self.log_manager
            .wl()
            .append(tx, LogRecordBody::AlterTrigger(info.clone()))?;
        self.catalog.wl().install_trigger(info);
        Ok(())
    }

    pub fn drop_trigger(&self, tx: &Transaction, trigger_name: &str) -> DbResult {
        self.lock_manager
            .acquire(tx, LockMode::Exclusive, ResourceId::catalog())?;
        self.catalog.rl().get_trigger(trigger_name)?;
        self.log_manager.wl().append(
            tx,
            LogRecordBody::DropTrigger {
                trigger_name: trigger_name.to_string(),
            },
        )?;
        self.catalog.wl().remove_trigger(trigger_name)?;
        Ok(())
    }

    // maintenance hooks

    pub fn flush_all_pools(&self) -> DbResult {
        let pools: Vec<Pod<BufferPool>> = self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            pool.wl().flush_all()?;
        }
        Ok(())
    }

    /// Aggregate dirty-page table across all pools, for checkpoints.
    pub fn dirty_page_table(&self) -> HashMap<PageId, Lsn> {
        let pools: Vec<Pod<BufferPool>> = self.pools.lock().unwrap().values().cloned().collect();
        let mut dpt = HashMap::new();
        for pool in pools {
            for (page_id, lsn) in pool.rl().dirty_page_lsns() {
                dpt.entry(page_id).or_insert(lsn);
            }
        }
        dpt
    }

    pub(crate) fn btree(
        &self,
        table: &str,
        index: &str,
    ) -> Result<crate::storage::btree::BTreeManager, DbError> {
        let pool = self.index_pool(table, index)?;
        crate::storage::btree::BTreeManager::new(pool, self.catalog.clone(), table, index)
    }

    pub(crate) fn heap_file(&self, table: &str) -> Result<crate::storage::heap_file::HeapFile, DbError> {
        let pool = self.table_pool(table)?;
        Ok(crate::storage::heap_file::HeapFile::new(
            pool,
            self.catalog.clone(),
            table,
        ))
    }

    /// Log the full WAL contents at debug level, for troubleshooting.
    pub fn debug_dump_log(&self) {
        if let Ok(dump) = self.log_manager.rl().dump() {
            debug!("log contents:\n{}", dump);
        }
    }
}
