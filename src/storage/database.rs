//! Database handle: one connection plus the state tuned on it.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{MergeError, Result};
use crate::storage::pragma::PragmaStore;
use crate::storage::schema::{self, METADATA_TABLE};

/// Pause between attempts to close a connection that refused to close.
pub const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Flags for write connections to the target. Paths are never parsed as URIs.
pub(crate) const TARGET_OPEN_FLAGS: OpenFlags = OpenFlags::SQLITE_OPEN_READ_WRITE
    .union(OpenFlags::SQLITE_OPEN_CREATE)
    .union(OpenFlags::SQLITE_OPEN_NO_MUTEX);

/// `path` as handed to the engine. The bundled engine reads any name starting
/// with `file:` as a URI, so relative paths are anchored with `./`.
pub(crate) fn engine_path(path: &Path) -> PathBuf {
    if path.is_relative() {
        Path::new(".").join(path)
    } else {
        path.to_path_buf()
    }
}

/// An open Kismet database.
///
/// The target is opened read-write and has its schema asserted; sources are
/// opened read-only so validation sees them exactly as they are on disk.
#[derive(Debug)]
pub struct DatabaseHandle {
    path: PathBuf,
    conn: Mutex<Connection>,
    pragmas: PragmaStore,
    temp_dir: Mutex<Option<PathBuf>>,
}

impl DatabaseHandle {
    /// Open (creating if absent) the merge target and assert its schema.
    pub fn open_target(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(MergeError::access(path, "path is a directory"));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(path).map_err(|e| MergeError::access(path, e.to_string()))?;
                tracing::info!(path = %path.display(), "created empty target database");
            }
            Err(e) => return Err(access_error(path, &e)),
        }

        let conn = Connection::open_with_flags(engine_path(path), TARGET_OPEN_FLAGS).map_err(|source| {
            MergeError::Connection {
                path: path.to_path_buf(),
                source,
            }
        })?;
        ping(&conn, path)?;

        let fresh = !schema::table_exists(&conn, "main", METADATA_TABLE)
            .map_err(|e| MergeError::engine("inspecting target catalog", e))?;
        schema::initialize_schema(&conn).map_err(|e| {
            MergeError::engine(format!("asserting schema on {}", path.display()), e)
        })?;
        if fresh {
            tracing::info!(path = %path.display(), "wrote kismet schema");
        }

        Ok(Self::from_connection(path, conn))
    }

    /// Open an existing source database read-only.
    pub fn open_source(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(MergeError::access(path, "path is a directory"));
            }
            Ok(_) => {}
            Err(e) => return Err(access_error(path, &e)),
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(engine_path(path), flags).map_err(|source| {
            MergeError::Connection {
                path: path.to_path_buf(),
                source,
            }
        })?;
        ping(&conn, path)?;

        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: &Path, conn: Connection) -> Self {
        Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            pragmas: PragmaStore::new(),
            temp_dir: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pragmas(&self) -> &PragmaStore {
        &self.pragmas
    }

    /// Lock the handle's connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verify the Kismet tables a valid log must contain.
    pub fn check_schema(&self) -> Result<()> {
        schema::check_schema(&self.conn(), &self.path)
    }

    /// User table names in catalog order.
    pub fn tables(&self) -> Result<Vec<String>> {
        schema::list_tables(&self.conn(), "main")
            .map_err(|e| MergeError::engine("listing target tables", e))
    }

    /// Rebuild the database file, reclaiming free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.conn()
            .execute_batch("VACUUM")
            .map_err(|e| MergeError::engine("vacuum", e))
    }

    /// Refresh query planner statistics.
    pub fn analyze(&self) -> Result<()> {
        self.conn()
            .execute_batch("ANALYZE")
            .map_err(|e| MergeError::engine("analyze", e))
    }

    /// Point the engine's temporary files at `dir`.
    ///
    /// Failure leaves the engine default in place and is only logged. On
    /// success the directory is removed again by [`DatabaseHandle::close`].
    pub fn set_temp_dir(&self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "unable to create temp dir");
            return false;
        }

        let sql = format!(
            "PRAGMA temp_store_directory = '{}'",
            dir.display().to_string().replace('\'', "''")
        );
        if let Err(e) = self.conn().execute_batch(&sql) {
            tracing::warn!(dir = %dir.display(), error = %e, "unable to set temp dir");
            return false;
        }

        tracing::debug!(dir = %dir.display(), "temp dir set");
        *self.temp_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(dir);
        true
    }

    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.temp_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close the connection, retrying until the engine lets go.
    ///
    /// A half-closed database risks losing the tail of the merge, so a failed
    /// close is retried every [`CLOSE_RETRY_DELAY`] instead of returned. This
    /// blocks the calling thread.
    pub fn close(self) {
        let DatabaseHandle {
            path,
            conn,
            temp_dir,
            ..
        } = self;
        let cleanup = TempDirCleanup(temp_dir.into_inner().unwrap_or_else(PoisonError::into_inner));

        let mut conn = conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        if cleanup.0.is_some() {
            let _ = conn.execute_batch("PRAGMA temp_store_directory = ''");
        }

        loop {
            match conn.close() {
                Ok(()) => break,
                Err((returned, e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "close failed, retrying");
                    conn = returned;
                    std::thread::sleep(CLOSE_RETRY_DELAY);
                }
            }
        }
        tracing::debug!(path = %path.display(), "database closed");
    }
}

/// Removes the temp dir when dropped.
struct TempDirCleanup(Option<PathBuf>);

impl Drop for TempDirCleanup {
    fn drop(&mut self) {
        if let Some(dir) = self.0.take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::debug!(dir = %dir.display(), error = %e, "temp dir not removed");
            }
        }
    }
}

fn ping(conn: &Connection, path: &Path) -> Result<()> {
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |_| Ok(()))
        .map_err(|source| MergeError::Connection {
            path: path.to_path_buf(),
            source,
        })
}

fn access_error(path: &Path, err: &io::Error) -> MergeError {
    match err.kind() {
        io::ErrorKind::NotFound => MergeError::access(path, "no such file"),
        io::ErrorKind::PermissionDenied => {
            MergeError::access(path, format!("permission denied: {err}"))
        }
        _ => MergeError::access(path, err.to_string()),
    }
}
