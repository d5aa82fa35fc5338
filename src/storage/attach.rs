//! Attached-source connections to the merge target.
//!
//! Uses r2d2 with r2d2_sqlite for pooled write access to the target. Each
//! source of a group gets its own pooled connection, attaches the source
//! under its alias, and copies every table inside one deferred transaction.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::{MergeError, Result};
use crate::storage::database::engine_path;
use crate::storage::pragma::{apply_pragma, Pragma};
use crate::storage::schema::{list_tables, quote_ident};

/// Connections to the target, one per attached source.
#[derive(Clone, Debug)]
pub struct AttachPool {
    pool: Pool<SqliteConnectionManager>,
}

impl AttachPool {
    /// Create a pool of up to `max_size` connections to the target at `db_path`.
    ///
    /// Every connection gets `busy_timeout` and the handle's
    /// connection-scoped pragma `overrides` applied before first use.
    ///
    /// # Errors
    ///
    /// Returns an access error if `db_path` is no longer a regular file, or
    /// a pool error if the pool cannot be created.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        max_size: u32,
        busy_timeout: Duration,
        overrides: Vec<(Pragma, String)>,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        match fs::metadata(db_path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(MergeError::access(db_path, "target is not a regular file")),
            Err(e) => return Err(MergeError::access(db_path, e.to_string())),
        }

        // No CREATE: a vanished target must fail rather than reappear empty.
        let manager = SqliteConnectionManager::file(engine_path(db_path))
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX);

        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(0))
            .connection_customizer(Box::new(AttachConnectionCustomizer {
                busy_timeout,
                overrides,
            }))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }
}

/// Connection customizer that applies the busy timeout and pragma overrides.
#[derive(Debug)]
struct AttachConnectionCustomizer {
    busy_timeout: Duration,
    overrides: Vec<(Pragma, String)>,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for AttachConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        for (pragma, value) in &self.overrides {
            if let Err(e) = apply_pragma(conn, *pragma, value) {
                tracing::warn!(pragma = %pragma, value = %value, error = %e, "override not replayed");
            }
        }
        Ok(())
    }
}

/// A source attached to a pooled target connection with an open transaction.
pub struct AttachedSource {
    index: usize,
    alias: String,
    path: PathBuf,
    tables: HashSet<String>,
    conn: Mutex<PooledConnection<SqliteConnectionManager>>,
}

impl AttachedSource {
    /// Attach `path` as `alias` on `conn` and begin a deferred transaction.
    ///
    /// The source is detached again if anything after the attach fails.
    pub fn attach(
        conn: PooledConnection<SqliteConnectionManager>,
        index: usize,
        alias: String,
        path: &Path,
    ) -> Result<Self> {
        let source_path = engine_path(path).to_string_lossy().into_owned();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(&alias)),
            params![source_path],
        )
        .map_err(|e| MergeError::engine(format!("attaching {} as {alias}", path.display()), e))?;

        let prepared = list_tables(&conn, &alias)
            .map_err(|e| MergeError::engine(format!("listing tables of {alias}"), e))
            .and_then(|tables| {
                conn.execute_batch("BEGIN DEFERRED")
                    .map_err(|e| MergeError::engine(format!("beginning transaction for {alias}"), e))?;
                Ok(tables)
            });

        let tables = match prepared {
            Ok(tables) => tables.into_iter().collect(),
            Err(e) => {
                detach_alias(&conn, &alias);
                return Err(e);
            }
        };

        tracing::debug!(alias = %alias, path = %path.display(), "source attached");
        Ok(Self {
            index,
            alias,
            path: path.to_path_buf(),
            tables,
            conn: Mutex::new(conn),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the attached source has a user table named `table`.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Copy every row of `table` from the source into the target, skipping
    /// rows that violate a target constraint. Returns the rows inserted.
    pub fn copy_table(&self, table: &str) -> Result<usize> {
        let sql = format!(
            "INSERT OR IGNORE INTO main.{table} SELECT * FROM {alias}.{table}",
            table = quote_ident(table),
            alias = quote_ident(&self.alias),
        );
        let conn = self.conn();
        self.ensure_open(&conn)?;
        conn.execute(&sql, [])
            .map_err(|e| MergeError::engine(format!("copying {table} from {}", self.alias), e))
    }

    pub fn commit(&self) -> Result<()> {
        let conn = self.conn();
        self.ensure_open(&conn)?;
        conn.execute_batch("COMMIT")
            .map_err(|e| MergeError::engine(format!("committing {}", self.alias), e))
    }

    /// Roll back the open transaction, if there still is one.
    pub fn rollback(&self) -> Result<()> {
        let conn = self.conn();
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")
            .map_err(|e| MergeError::engine(format!("rolling back {}", self.alias), e))
    }

    /// Detach the source, returning the connection to the pool.
    pub fn detach(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(&format!("DETACH DATABASE {}", quote_ident(&self.alias)))
            .map_err(|e| MergeError::engine(format!("detaching {}", self.alias), e))?;
        tracing::debug!(alias = %self.alias, "source detached");
        Ok(())
    }

    /// Rows copied outside the source transaction would be committed piecemeal.
    fn ensure_open(&self, conn: &Connection) -> Result<()> {
        if conn.is_autocommit() {
            return Err(MergeError::TransactionLost {
                alias: self.alias.clone(),
            });
        }
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, PooledConnection<SqliteConnectionManager>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AttachedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedSource")
            .field("index", &self.index)
            .field("alias", &self.alias)
            .field("path", &self.path)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

fn detach_alias(conn: &Connection, alias: &str) {
    if let Err(e) = conn.execute_batch(&format!("DETACH DATABASE {}", quote_ident(alias))) {
        tracing::warn!(alias, error = %e, "detach after failed attach");
    }
}
