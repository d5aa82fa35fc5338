//! Pragma save/restore for bulk-load tuning.
//!
//! Each [`DatabaseHandle`] owns a [`PragmaStore`]. Overriding a pragma first
//! snapshots its live value; restoring reapplies the snapshot and forgets
//! it. A pragma has a backup entry exactly while it is overridden.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{AggregateError, ErrorCollector, MergeError, PragmaError};
use crate::storage::database::DatabaseHandle;

/// Write-ahead log journal mode.
pub const WAL_MODE: &str = "WAL";
/// Rollback journal mode used when there is nothing sensible to restore.
pub const ROLLBACK_JOURNAL_MODE: &str = "DELETE";
/// Synchronous level that skips fsync on commit.
pub const SYNC_OFF: &str = "OFF";
/// Synchronous level used when there is nothing sensible to restore.
pub const SYNC_NORMAL: &str = "NORMAL";
/// Default journal size cap applied during bulk insert.
pub const DEFAULT_JOURNAL_SIZE_LIMIT: i64 = 6_144_000;

/// Engine settings the merge tunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pragma {
    JournalMode,
    Synchronous,
    JournalSizeLimit,
}

impl Pragma {
    /// All tunable pragmas, in restore order.
    pub const ALL: [Pragma; 3] = [
        Pragma::JournalMode,
        Pragma::Synchronous,
        Pragma::JournalSizeLimit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pragma::JournalMode => "journal_mode",
            Pragma::Synchronous => "synchronous",
            Pragma::JournalSizeLimit => "journal_size_limit",
        }
    }

    /// Whether the setting lives on the connection rather than in the file.
    ///
    /// `journal_mode = WAL` is persisted in the database header; the others
    /// must be replayed on every connection that should see them.
    pub fn is_connection_scoped(self) -> bool {
        !matches!(self, Pragma::JournalMode)
    }
}

impl fmt::Display for Pragma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
struct PragmaState {
    /// Prior value of every overridden pragma.
    backups: HashMap<Pragma, String>,
    /// Value currently applied for every overridden pragma.
    applied: HashMap<Pragma, String>,
}

/// Handle-scoped backup of overridden pragmas.
#[derive(Debug, Default)]
pub struct PragmaStore {
    state: Mutex<PragmaState>,
}

impl PragmaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot taken before `pragma` was overridden, if any.
    pub fn backup(&self, pragma: Pragma) -> Option<String> {
        self.lock().backups.get(&pragma).cloned()
    }

    /// Pragmas that currently hold a backup, in restore order.
    pub fn tracked(&self) -> Vec<Pragma> {
        let state = self.lock();
        Pragma::ALL
            .into_iter()
            .filter(|p| state.backups.contains_key(p))
            .collect()
    }

    /// Overrides that must be replayed on additional connections.
    pub fn connection_overrides(&self) -> Vec<(Pragma, String)> {
        let state = self.lock();
        Pragma::ALL
            .into_iter()
            .filter(|p| p.is_connection_scoped())
            .filter_map(|p| state.applied.get(&p).map(|v| (p, v.clone())))
            .collect()
    }

    fn snapshot(&self, conn: &Connection, pragma: Pragma) -> Result<String, PragmaError> {
        let value = read_pragma(conn, pragma)?;
        self.lock().backups.insert(pragma, value.clone());
        Ok(value)
    }

    fn mark_applied(&self, pragma: Pragma, value: &str) {
        self.lock().applied.insert(pragma, value.to_string());
    }

    fn clear(&self, pragma: Pragma) {
        let mut state = self.lock();
        state.backups.remove(&pragma);
        state.applied.remove(&pragma);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PragmaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read the live value of `pragma` as a string.
pub fn read_pragma(conn: &Connection, pragma: Pragma) -> Result<String, PragmaError> {
    conn.pragma_query_value(None, pragma.name(), |row| row.get::<_, Value>(0))
        .map(value_to_string)
        .map_err(|source| PragmaError::Read { pragma, source })
}

/// Set `pragma` to `value` on `conn`.
pub fn apply_pragma(conn: &Connection, pragma: Pragma, value: &str) -> Result<(), PragmaError> {
    let apply_err = |source| PragmaError::Apply {
        pragma,
        value: value.to_string(),
        source,
    };

    if pragma != Pragma::JournalMode {
        return conn
            .pragma_update(None, pragma.name(), value)
            .map_err(apply_err);
    }

    // The engine reports the resulting mode instead of failing when it
    // cannot switch (e.g. leaving WAL while other connections are open).
    let mode: String = conn
        .pragma_update_and_check(None, pragma.name(), value, |row| row.get(0))
        .map_err(apply_err)?;
    if mode.eq_ignore_ascii_case(value) {
        Ok(())
    } else {
        Err(PragmaError::Rejected {
            pragma,
            requested: value.to_string(),
            actual: mode,
        })
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}

impl DatabaseHandle {
    /// Switch the journal to write-ahead logging, or put the prior mode back.
    pub fn enable_wal(&self, on: bool) -> Result<(), PragmaError> {
        if on {
            self.override_pragma(Pragma::JournalMode, WAL_MODE)
        } else {
            self.release_override(Pragma::JournalMode, WAL_MODE, ROLLBACK_JOURNAL_MODE)
        }
    }

    /// Disable fsync on commit, or put the prior synchronous level back.
    pub fn enable_async(&self, on: bool) -> Result<(), PragmaError> {
        if on {
            self.override_pragma(Pragma::Synchronous, SYNC_OFF)
        } else {
            self.release_override(Pragma::Synchronous, SYNC_OFF, SYNC_NORMAL)
        }
    }

    /// Cap the size of the journal left behind after a commit.
    ///
    /// Always re-snapshots the current value before applying.
    pub fn set_journal_size_limit(&self, bytes: i64) -> Result<(), PragmaError> {
        let conn = self.conn();
        let pragma = Pragma::JournalSizeLimit;
        let value = bytes.to_string();
        self.pragmas().snapshot(&conn, pragma)?;
        if let Err(e) = apply_pragma(&conn, pragma, &value) {
            self.pragmas().clear(pragma);
            return Err(e);
        }
        self.pragmas().mark_applied(pragma, &value);
        tracing::debug!(pragma = %pragma, value = %value, "pragma overridden");
        Ok(())
    }

    /// Reapply the snapshot of `pragma` and forget it.
    ///
    /// Fails with [`PragmaError::NoBackup`] when nothing was snapshotted and
    /// with [`PragmaError::Conflict`] when the snapshot equals one of
    /// `forbidden`; the live value is left untouched in both cases.
    pub fn restore_pragma(&self, pragma: Pragma, forbidden: &[&str]) -> Result<(), PragmaError> {
        let conn = self.conn();
        let old = self
            .pragmas()
            .backup(pragma)
            .ok_or(PragmaError::NoBackup(pragma))?;

        if forbidden.iter().any(|f| old.eq_ignore_ascii_case(f)) {
            return Err(PragmaError::Conflict { pragma, value: old });
        }

        apply_pragma(&conn, pragma, &old)?;
        self.pragmas().clear(pragma);
        tracing::debug!(pragma = %pragma, value = %old, "pragma restored");
        Ok(())
    }

    /// Restore every tracked pragma, collecting failures instead of stopping.
    pub fn restore_all_pragmas(&self) -> Result<(), AggregateError> {
        let collector = ErrorCollector::new();
        for pragma in self.pragmas().tracked() {
            if let Err(e) = self.restore_pragma(pragma, &[]) {
                collector.push(MergeError::Pragma(e));
            }
        }
        collector.drain().into_result()
    }

    fn override_pragma(&self, pragma: Pragma, value: &str) -> Result<(), PragmaError> {
        let conn = self.conn();
        if let Some(stored) = self.pragmas().backup(pragma) {
            if !stored.eq_ignore_ascii_case(value) {
                return Err(PragmaError::AlreadyOverridden { pragma, stored });
            }
        }

        let previous = self.pragmas().snapshot(&conn, pragma)?;
        if let Err(e) = apply_pragma(&conn, pragma, value) {
            self.pragmas().clear(pragma);
            return Err(e);
        }
        self.pragmas().mark_applied(pragma, value);
        tracing::debug!(pragma = %pragma, previous = %previous, value, "pragma overridden");
        Ok(())
    }

    fn release_override(
        &self,
        pragma: Pragma,
        on_value: &str,
        fallback: &str,
    ) -> Result<(), PragmaError> {
        match self.restore_pragma(pragma, &[on_value]) {
            Ok(()) => Ok(()),
            Err(PragmaError::NoBackup(_) | PragmaError::Conflict { .. }) => {
                let conn = self.conn();
                apply_pragma(&conn, pragma, fallback)?;
                self.pragmas().clear(pragma);
                tracing::debug!(pragma = %pragma, value = fallback, "pragma reset to fallback");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
