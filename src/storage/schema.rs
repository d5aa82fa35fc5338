//! Kismet database schema and catalog queries.
//!
//! The schema mirrors the tables Kismet writes into its `.kismet` log files.
//! Creation is idempotent so it can be asserted on every open of the target.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{ErrorCollector, MergeError, Result};

/// Schema for a Kismet log database.
///
/// `devices` and `datasources` carry the uniqueness constraints the merge
/// relies on; every other table accumulates rows.
pub const KISMET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS KISMET (kismet_version TEXT, db_version INT, db_module TEXT);
CREATE TABLE IF NOT EXISTS devices (first_time INT, last_time INT, devkey TEXT, phyname TEXT, devmac TEXT, strongest_signal INT, min_lat REAL, min_lon REAL, max_lat REAL, max_lon REAL, avg_lat REAL, avg_lon REAL, bytes_data INT, type TEXT, device BLOB, UNIQUE(phyname, devmac) ON CONFLICT REPLACE);
CREATE TABLE IF NOT EXISTS packets (ts_sec INT, ts_usec INT, phyname TEXT, sourcemac TEXT, destmac TEXT, transmac TEXT, frequency REAL, devkey TEXT, lat REAL, lon REAL, alt REAL, speed REAL, heading REAL, packet_len INT, signal INT, datasource TEXT, dlt INT, packet BLOB, error INT, tags TEXT, datarate REAL, hash INT, packetid INT);
CREATE TABLE IF NOT EXISTS data (ts_sec INT, ts_usec INT, phyname TEXT, devmac TEXT, lat REAL, lon REAL, alt REAL, speed REAL, heading REAL, datasource TEXT, type TEXT, json BLOB);
CREATE TABLE IF NOT EXISTS datasources (uuid TEXT, typestring TEXT, definition TEXT, name TEXT, interface TEXT, json BLOB, UNIQUE(uuid) ON CONFLICT REPLACE);
CREATE TABLE IF NOT EXISTS alerts (ts_sec INT, ts_usec INT, phyname TEXT, devmac TEXT, lat REAL, lon REAL, header TEXT, json BLOB);
CREATE TABLE IF NOT EXISTS messages (ts_sec INT, lat REAL, lon REAL, msgtype TEXT, message TEXT);
CREATE TABLE IF NOT EXISTS snapshots (ts_sec INT, ts_usec INT, lat REAL, lon REAL, snaptype TEXT, json BLOB);
"#;

/// Metadata table present in every Kismet log.
pub const METADATA_TABLE: &str = "KISMET";

/// Every table [`KISMET_SCHEMA`] creates.
pub const KNOWN_TABLES: [&str; 8] = [
    METADATA_TABLE,
    "devices",
    "packets",
    "data",
    "datasources",
    "alerts",
    "messages",
    "snapshots",
];

/// Tables a source must contain to be considered a Kismet log.
///
/// Intentionally partial: `datasources` and `snapshots` are missing from
/// logs written by older Kismet releases.
pub const REQUIRED_TABLES: [&str; 6] = [
    METADATA_TABLE,
    "devices",
    "packets",
    "data",
    "alerts",
    "messages",
];

/// Create any missing Kismet tables.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(KISMET_SCHEMA)
}

/// Check whether `table` exists in the catalog of `schema` (`main` or an alias).
pub fn table_exists(conn: &Connection, schema: &str, table: &str) -> rusqlite::Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        quote_ident(schema)
    );
    let count: i64 = conn.query_row(&sql, params![table], |row| row.get(0))?;
    Ok(count > 0)
}

/// User table names of `schema` in catalog order.
///
/// Engine-internal tables (`sqlite_stat1`, `sqlite_sequence`, ...) are left
/// out: they are rebuilt by the engine and may not exist on both sides.
pub fn list_tables(conn: &Connection, schema: &str) -> rusqlite::Result<Vec<String>> {
    let sql = format!(
        "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        quote_ident(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

/// Verify that every table in [`REQUIRED_TABLES`] is present.
///
/// All missing tables are reported together, not just the first.
pub fn check_schema(conn: &Connection, path: &Path) -> Result<()> {
    conn.query_row("SELECT 1", [], |_| Ok(()))
        .map_err(|source| MergeError::Connection {
            path: path.to_path_buf(),
            source,
        })?;

    let collector = ErrorCollector::new();
    for table in REQUIRED_TABLES {
        match table_exists(conn, "main", table) {
            Ok(true) => {}
            Ok(false) => collector.push(MergeError::Schema {
                path: path.to_path_buf(),
                table: table.to_string(),
            }),
            Err(e) => collector.push(MergeError::engine(
                format!("looking up table {table} in {}", path.display()),
                e,
            )),
        }
    }

    collector.drain().into_result().map_err(MergeError::from)
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
