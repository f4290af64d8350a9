use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tokio::task;
use crate::error::{Result, RiskError};

pub mod migrate;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
#[derive(Debug, Clone)]
pub struct Db {
    path: std::path::PathBuf,
    busy_timeout: Duration,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// How long a connection waits on another writer before failing with SQLITE_BUSY
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new database connection with optimized pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        open_with_pragmas(&self.path, self.busy_timeout)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        task::spawn_blocking(move || {
            let mut conn = open_with_pragmas(&path, busy_timeout)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RiskError::Task(e.to_string()))?
    }
}

/// WAL for concurrent readers during a write batch, NORMAL sync for speed,
/// busy_timeout so per-collection readers wait out a writer instead of failing.
fn open_with_pragmas(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536; \
         PRAGMA mmap_size = 268435456; \
         PRAGMA wal_autocheckpoint = 1000;"
    )?;
    Ok(conn)
}
