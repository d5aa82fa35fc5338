//! Test utilities for kismet-merge integration tests.
//!
//! Provides:
//! - A temp-dir fixture owning the target and every source file
//! - Builders for Kismet source databases with known contents
//! - Row counting helpers against plain connections

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use kismet_merge::storage::schema::initialize_schema;
use rusqlite::{params, Connection};
use tempfile::TempDir;

/// PHY name used for every fixture device.
pub const PHY: &str = "IEEE802.11";

/// Test fixture that manages a temporary directory of capture databases.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory holding every database
    pub temp_dir: TempDir,
    /// Path to the merge target (not created)
    pub target_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let target_path = temp_dir.path().join("merged.kismet");
        Self {
            temp_dir,
            target_path,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Start building a source database named `name`.
    pub fn source(&self, name: &str) -> SourceBuilder {
        SourceBuilder::new(self.path(name))
    }

    /// A file that holds a devices table and nothing else.
    pub fn partial_source(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        let conn = Connection::open(&path).expect("open partial source");
        conn.execute_batch("CREATE TABLE devices (phyname TEXT, devmac TEXT);")
            .expect("create partial source");
        path
    }

    /// Open the target with a plain connection for assertions.
    pub fn target_conn(&self) -> Connection {
        Connection::open(&self.target_path).expect("open target")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a Kismet source database.
pub struct SourceBuilder {
    path: PathBuf,
    conn: Connection,
}

impl SourceBuilder {
    fn new(path: PathBuf) -> Self {
        let conn = Connection::open(&path).expect("open source");
        initialize_schema(&conn).expect("write source schema");
        conn.execute(
            "INSERT INTO KISMET (kismet_version, db_version, db_module) VALUES ('2022-08-R1', 8, 'kismetlog')",
            [],
        )
        .expect("write metadata");
        Self { path, conn }
    }

    /// Add a device keyed by (PHY, `mac`) carrying `strongest_signal`.
    pub fn device(self, mac: &str, strongest_signal: i64) -> Self {
        self.conn
            .execute(
                "INSERT INTO devices (first_time, last_time, devkey, phyname, devmac, strongest_signal, type, device)
                 VALUES (1, 2, ?1, ?2, ?1, ?3, 'Wi-Fi AP', ?4)",
                params![mac, PHY, strongest_signal, br#"{"kismet.device.base.macaddr":"x"}"#.to_vec()],
            )
            .expect("insert device");
        self
    }

    /// Add `count` packets sent by `mac`, numbered from `first_ts`.
    pub fn packets(self, mac: &str, first_ts: i64, count: usize) -> Self {
        for i in 0..count {
            self.conn
                .execute(
                    "INSERT INTO packets (ts_sec, ts_usec, phyname, sourcemac, destmac, packet_len, packet)
                     VALUES (?1, 0, ?2, ?3, 'FF:FF:FF:FF:FF:FF', 64, ?4)",
                    params![first_ts + i as i64, PHY, mac, vec![0xABu8; 64]],
                )
                .expect("insert packet");
        }
        self
    }

    pub fn datasource(self, uuid: &str, name: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO datasources (uuid, typestring, definition, name, interface) VALUES (?1, 'linuxwifi', 'wlan0', ?2, 'wlan0')",
                params![uuid, name],
            )
            .expect("insert datasource");
        self
    }

    pub fn message(self, ts: i64, text: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO messages (ts_sec, msgtype, message) VALUES (?1, 'INFO', ?2)",
                params![ts, text],
            )
            .expect("insert message");
        self
    }

    pub fn alert(self, ts: i64, mac: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO alerts (ts_sec, ts_usec, phyname, devmac, header) VALUES (?1, 0, ?2, ?3, 'DEAUTHFLOOD')",
                params![ts, PHY, mac],
            )
            .expect("insert alert");
        self
    }

    pub fn data(self, ts: i64, mac: &str) -> Self {
        self.conn
            .execute(
                "INSERT INTO data (ts_sec, ts_usec, phyname, devmac, type, json) VALUES (?1, 0, ?2, ?3, 'gps', '{}')",
                params![ts, PHY, mac],
            )
            .expect("insert data");
        self
    }

    pub fn snapshot(self, ts: i64) -> Self {
        self.conn
            .execute(
                "INSERT INTO snapshots (ts_sec, ts_usec, snaptype, json) VALUES (?1, 0, 'status', '{}')",
                params![ts],
            )
            .expect("insert snapshot");
        self
    }

    /// Run arbitrary SQL against the source.
    pub fn exec(self, sql: &str) -> Self {
        self.conn.execute_batch(sql).expect("exec on source");
        self
    }

    pub fn build(self) -> PathBuf {
        self.path
    }
}

/// Number of rows in `table`.
pub fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("count rows")
}

/// Every row of `table` rendered as text, sorted, for subset checks.
pub fn rows(conn: &Connection, table: &str) -> Vec<String> {
    let columns: Vec<String> = {
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM pragma_table_info('{table}')"))
            .expect("table info");
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .expect("columns")
            .collect::<rusqlite::Result<_>>()
            .expect("columns");
        columns
    };
    let expr = columns
        .iter()
        .map(|c| format!("quote(\"{c}\")"))
        .collect::<Vec<_>>()
        .join(" || '|' || ");
    let mut stmt = conn
        .prepare(&format!("SELECT {expr} FROM \"{table}\""))
        .expect("row dump");
    let mut rows: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .expect("rows")
        .collect::<rusqlite::Result<_>>()
        .expect("rows");
    rows.sort();
    rows
}

/// Whether every row of `source.table` is present in `target.table`.
pub fn is_subset(source: &Path, target: &Connection, table: &str) -> bool {
    let source = Connection::open(source).expect("open source");
    let have = rows(target, table);
    rows(&source, table).iter().all(|r| have.binary_search(r).is_ok())
}
