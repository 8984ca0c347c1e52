use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fs,
    num::NonZeroUsize,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

mod buffer;
pub mod catalog;
pub mod executor;
mod lock;
pub mod storage;
pub mod table;
pub mod value;

pub use buffer::{Block, BlockKey, BlockManager, StoreId};
pub use catalog::{Column, ColumnType, TableSchema};
pub use executor::{QueryResult, ResultSet};
pub use lock::{Lock, LockReadGuard, LockWriteGuard};
pub use storage::{BlockFile, BlockId, BlockKind, Store, BLOCK_SIZE};
pub use table::{RowId, Table, TableFactory};
pub use value::{Truth, Value};

use crate::config::DatabaseConfig;
use crate::error::{DbError, Result};
use crate::sql::param::ParamValue;
use crate::sql::parser::Parser;
use crate::sql::query::Query;

/// Number of bound queries [`Database::prepare`] keeps.
const PLAN_CACHE_SIZE: usize = 128;

/// The registry of named tables stored under one directory.
///
/// The Database owns the shared [`BlockManager`], the structural lock that
/// serializes DDL against directory scans, and a cache of bound queries.
///
/// ## Architecture
///
/// ```text
/// ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
/// │    Parser    │    │  Plan cache  │    │ BlockManager │
/// │ (SQL → Query)│    │ (bound Query)│    │ (LRU blocks) │
/// └──────────────┘    └──────────────┘    └──────────────┘
///        │                   │                   │
///        └───────────────────┼───────────────────┘
///                            │
///                    ┌───────▼────────┐
///                    │    Database    │
///                    │ (table map +   │
///                    │  struct lock)  │
///                    └────────────────┘
///                            │
///                    ┌───────▼────────┐
///                    │  Table/Store   │
///                    │  (<name>.db)   │
///                    └────────────────┘
/// ```
///
/// ## Thread Safety
/// Every method takes `&self`. `get_table` may run concurrently with
/// anything; `init`, `add_table` and `drop_table` exclude each other through
/// the database lock, and query execution holds it for read.
pub struct Database {
    config: DatabaseConfig,
    block_manager: Arc<BlockManager>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    database_lock: Lock,
    plan_cache: Mutex<LruCache<String, Arc<Query>>>,
    closed: AtomicBool,
}

impl Database {
    /// Creates a database over `config.path` with its own block cache,
    /// sized from `config.memory_size`. Tables are not loaded until
    /// [`Database::init`].
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let manager = BlockManager::create(config.cache_blocks());
        Self::with_block_manager(config, manager)
    }

    /// Creates a database sharing an existing block cache.
    pub fn with_block_manager(config: DatabaseConfig, block_manager: Arc<BlockManager>) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        block_manager.ensure_capacity(config.cache_blocks());

        let cache_size = NonZeroUsize::new(PLAN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            database_lock: Lock::new(format!("database:{}", config.path.display())),
            config,
            block_manager,
            tables: RwLock::new(HashMap::new()),
            plan_cache: Mutex::new(LruCache::new(cache_size)),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates the database and loads its tables.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let db = Self::new(config)?;
        db.init()?;
        Ok(db)
    }

    /// Scans the directory for `<name>.db` files and loads each table.
    ///
    /// A table that fails to load aborts startup with [`DbError::Load`],
    /// unless `remove_on_error` is set, in which case its file is deleted
    /// and the scan continues.
    pub fn init(&self) -> Result<()> {
        let _guard = self.database_lock.lock_write(self.config.lock_timeout())?;

        let mut entries: Vec<_> = fs::read_dir(&self.config.path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "db"))
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if self.tables.read().contains_key(&name) {
                continue;
            }

            let loaded = Table::load_from_file(self, &name).and_then(|table| {
                table.init()?;
                Ok(table)
            });

            match loaded {
                Ok(table) => {
                    debug!(table = %name, "registered table from disk");
                    self.tables.write().insert(name, Arc::new(table));
                }
                Err(e) if self.config.remove_on_error => {
                    warn!(table = %name, path = %path.display(), error = %e,
                          "removing table that failed to load");
                    if let Err(rm) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %rm, "failed to remove table file");
                    }
                }
                Err(e) => {
                    return Err(DbError::Load {
                        table: name,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(path = %self.config.path.display(), tables = self.tables.read().len(), "Database opened");
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Directory holding the `<name>.db` files.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.block_manager
    }

    /// The structural lock: DDL takes it for write, queries for read.
    pub fn database_lock(&self) -> &Lock {
        &self.database_lock
    }

    /// Grows the shared block cache to fit `memory_size` bytes of heap.
    pub fn ensure_memory_capacity(&self, memory_size: u64) {
        let blocks = self.config.clone().with_memory_size(memory_size).cache_blocks();
        self.block_manager.ensure_capacity(blocks);
    }

    /// A factory for new tables stored in this database's directory.
    pub fn create_table_factory(&self) -> TableFactory {
        TableFactory::new(
            self.config.path.clone(),
            self.block_manager.clone(),
            self.config.lock_timeout(),
        )
    }

    /// Registers a newly created table.
    pub fn add_table(&self, table: Table) -> Result<Arc<Table>> {
        self.assert_open()?;
        let _guard = self.database_lock.lock_write(self.config.lock_timeout())?;
        table.init()?;

        let name = table.name().to_string();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(DbError::TableExists(name));
        }
        let table = Arc::new(table);
        tables.insert(name.clone(), table.clone());

        info!(table = %name, path = %table.path().display(), "Table added");
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Names of all registered tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Unregisters the table and deletes its file.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.assert_open()?;
        let _guard = self.database_lock.lock_write(self.config.lock_timeout())?;

        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        self.plan_cache.lock().clear();

        table.remove()?;
        info!(table = %name, "Table dropped");
        Ok(())
    }

    /// Parses `sql` into a fresh, unbound query. Never cached.
    pub fn parse_query(&self, sql: &str) -> Result<Query> {
        self.assert_open()?;
        Parser::parse(self, sql)
    }

    /// Returns a bound query for `sql`, reusing a cached one when possible.
    ///
    /// Bound queries hold no parameter values, so the same `Arc<Query>` can
    /// be executed concurrently, each caller with its own
    /// [`Params`](crate::sql::param::Params).
    ///
    /// The lookup, parse, bind and cache insert all happen under the
    /// database lock held for read, so a concurrent [`Database::drop_table`]
    /// either clears the plan afterwards or makes the parse fail.
    pub fn prepare(&self, sql: &str) -> Result<Arc<Query>> {
        let _guard = self.database_lock.lock_read(self.config.lock_timeout())?;
        self.prepare_locked(sql)
    }

    fn prepare_locked(&self, sql: &str) -> Result<Arc<Query>> {
        if let Some(query) = self.plan_cache.lock().get(sql) {
            return Ok(query.clone());
        }

        let mut query = self.parse_query(sql)?;
        query.bind()?;
        let query = Arc::new(query);
        self.plan_cache.lock().put(sql.to_string(), query.clone());
        Ok(query)
    }

    /// Prepares and runs `sql`, filling parameters 1.. from `params`.
    ///
    /// Preparation and execution share one hold of the database lock.
    pub fn execute(&self, sql: &str, params: &[ParamValue]) -> Result<QueryResult> {
        let _guard = self.database_lock.lock_read(self.config.lock_timeout())?;
        let query = self.prepare_locked(sql)?;
        let mut slots = query.new_params();
        slots.bind_all(params)?;
        executor::execute_locked(self, &query, &slots)
    }

    /// Closes every table. Individual failures are logged, not returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.plan_cache.lock().clear();

        let tables: Vec<Arc<Table>> = self.tables.write().drain().map(|(_, t)| t).collect();
        for table in tables {
            if let Err(e) = table.close() {
                warn!(table = %table.name(), error = %e, "failed to close table");
            }
        }
        info!(path = %self.config.path.display(), "Database closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn assert_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Closed(self.config.path.display().to_string()));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ints(db: &Database, name: &str) -> Table {
        let mut f = db.create_table_factory();
        f.start_table(name);
        f.add_column("n", ColumnType::BigInt).unwrap();
        f.create().unwrap()
    }

    #[test]
    fn add_get_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();

        let t = db.add_table(ints(&db, "numbers")).unwrap();
        assert!(Arc::ptr_eq(&db.get_table("numbers").unwrap(), &t));
        let file = t.path().to_path_buf();
        assert!(file.exists());

        db.drop_table("numbers").unwrap();
        assert!(db.get_table("numbers").is_none());
        assert!(!file.exists());
    }

    #[test]
    fn drop_unknown_table_leaves_map_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        db.add_table(ints(&db, "kept")).unwrap();

        let err = db.drop_table("missing").unwrap_err();
        assert!(matches!(err, DbError::TableNotFound(_)));
        assert_eq!(err.to_string(), "table 'missing' does not exist");
        assert_eq!(db.table_names(), vec!["kept"]);
    }

    #[test]
    fn drop_clears_the_plan_cache() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        db.add_table(ints(&db, "t")).unwrap();

        let a = db.prepare("SELECT n FROM t").unwrap();
        let b = db.prepare("SELECT n FROM t").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_bound());

        db.drop_table("t").unwrap();
        assert!(matches!(db.prepare("SELECT n FROM t"), Err(DbError::TableNotFound(_))));
    }

    #[test]
    fn parse_query_never_caches() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let q = db.parse_query("SELECT 1").unwrap();
        assert!(!q.is_bound());
        assert_eq!(db.plan_cache.lock().len(), 0);
    }

    #[test]
    fn ddl_times_out_behind_a_reader() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path()).with_lock_timeout(Duration::from_millis(30));
        let db = Database::open(config).unwrap();
        let table = ints(&db, "late");

        let _scan = db.database_lock().lock_read(Duration::from_millis(30)).unwrap();
        let err = db.add_table(table).unwrap_err();
        assert!(err.is_rollback_only());
        assert!(db.get_table("late").is_none());
    }

    #[test]
    fn closed_database_rejects_work() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let t = db.add_table(ints(&db, "t")).unwrap();
        db.close();
        assert!(db.is_closed());
        assert!(t.store().is_closed());
        assert!(matches!(db.parse_query("SELECT 1"), Err(DbError::Closed(_))));
        db.close();
    }
}
