//! `DuckDB` connection pool management.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use ::duckdb::Connection;

/// Idle connections are pooled separately for readers and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

struct PoolState {
    // Every pooled connection is cloned from this one so they share a single
    // database instance.
    root: Connection,
    read_only: Vec<Connection>,
    read_write: Vec<Connection>,
}

struct PoolInner {
    db_path: PathBuf,
    max_pool_size: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps up to `max_pool_size` idle connections per access mode.
#[derive(Clone)]
pub struct DuckDbConnectionManager {
    inner: Arc<PoolInner>,
}

impl DuckDbConnectionManager {
    /// Opens the database file and prepares an empty pool.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, max_pool_size: usize) -> Result<Self, ::duckdb::Error> {
        let db_path = path.into();
        let root = Connection::open(db_path.as_path())?;
        configure_connection(&root)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                db_path,
                max_pool_size: max_pool_size.max(1),
                state: Mutex::new(PoolState {
                    root,
                    read_only: Vec::new(),
                    read_write: Vec::new(),
                }),
            }),
        })
    }

    /// Takes an idle connection or clones a new one from the root.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be created or configured.
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, ::duckdb::Error> {
        let connection = {
            let mut state = self.inner.state();
            let idle = match mode {
                AccessMode::ReadOnly => state.read_only.pop(),
                AccessMode::ReadWrite => state.read_write.pop(),
            };
            match idle {
                Some(connection) => connection,
                None => {
                    let connection = state.root.try_clone()?;
                    configure_connection(&connection)?;
                    connection
                }
            }
        };

        Ok(PooledConnection {
            mode,
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.inner.db_path.as_path()
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    mode: AccessMode,
    pool: Arc<PoolInner>,
    // Only `None` after `drop` has taken it back.
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self.connection.as_ref() {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.connection.as_mut() {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut state = self.pool.state();
        let idle = match self.mode {
            AccessMode::ReadOnly => &mut state.read_only,
            AccessMode::ReadWrite => &mut state.read_write,
        };
        if idle.len() < self.pool.max_pool_size {
            idle.push(connection);
        }
    }
}

fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")
}
