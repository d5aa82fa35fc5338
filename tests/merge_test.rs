//! End-to-end merge tests.
//!
//! Tests:
//! - Single-source merge into an empty target
//! - First-writer-wins on constrained tables
//! - Re-merging the same source
//! - Every source row reaches the target
//! - An invalid source does not block its siblings
//! - Multiple groups, custom tables, older capture files
//! - Contended merge with bulk-load pragmas applied
//! - Cancellation leaves only whole sources behind

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{count, is_subset, TestFixture, PHY};
use kismet_merge::merge::{BatchConfig, RetryPolicy};
use kismet_merge::observability::tracing::init_test_tracing;
use kismet_merge::{DatabaseHandle, MergeError, MergeOptions, MergeOrchestrator, MergeReport};
use rusqlite::params;
use tokio_util::sync::CancellationToken;

const APPEND_ONLY: [&str; 5] = ["packets", "data", "alerts", "messages", "snapshots"];

fn options() -> MergeOptions {
    MergeOptions {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(2),
            max_attempts: 100_000,
            max_elapsed: Duration::from_secs(300),
        },
        ..MergeOptions::default()
    }
}

fn open_target(fixture: &TestFixture) -> Arc<DatabaseHandle> {
    Arc::new(DatabaseHandle::open_target(&fixture.target_path).expect("open target"))
}

async fn merge(target: &Arc<DatabaseHandle>, sources: &[PathBuf]) -> kismet_merge::Result<MergeReport> {
    MergeOrchestrator::new(Arc::clone(target), options(), CancellationToken::new())
        .run(sources)
        .await
}

/// A full capture with one row in every table, keyed by `tag`.
fn full_source(fixture: &TestFixture, tag: usize, packets: usize) -> PathBuf {
    let mac = format!("02:00:00:00:00:{tag:02X}");
    fixture
        .source(&format!("capture-{tag}.kismet"))
        .device(&mac, -50)
        .packets(&mac, 1_000 * tag as i64, packets)
        .datasource(&format!("00000000-0000-0000-0000-0000000000{tag:02}"), "wlan0")
        .message(tag as i64, "capture started")
        .alert(tag as i64, &mac)
        .data(tag as i64, &mac)
        .snapshot(tag as i64)
        .build()
}

#[tokio::test]
async fn test_single_source_into_empty_target() {
    init_test_tracing();
    let fixture = TestFixture::new();
    let source = fixture
        .source("a.kismet")
        .device("AA:AA:AA:AA:AA:01", -40)
        .device("AA:AA:AA:AA:AA:02", -50)
        .device("AA:AA:AA:AA:AA:03", -60)
        .packets("AA:AA:AA:AA:AA:01", 0, 5)
        .build();
    let target = open_target(&fixture);

    let report = merge(&target, &[source]).await.unwrap();

    assert_eq!(report.groups, 1);
    assert_eq!(report.sources_merged, 1);
    assert_eq!(report.sources_rejected, 0);
    // KISMET metadata + 3 devices + 5 packets
    assert_eq!(report.rows_inserted, 9);

    let conn = fixture.target_conn();
    assert_eq!(count(&conn, "devices"), 3);
    assert_eq!(count(&conn, "packets"), 5);
}

#[tokio::test]
async fn test_existing_device_keeps_its_values() {
    let fixture = TestFixture::new();
    let target = open_target(&fixture);
    target
        .conn()
        .execute(
            "INSERT INTO devices (phyname, devmac, strongest_signal, type) VALUES (?1, ?2, -30, 'original')",
            params![PHY, "AA:BB:CC:DD:EE:FF"],
        )
        .unwrap();
    let source = fixture
        .source("a.kismet")
        .device("AA:BB:CC:DD:EE:FF", -90)
        .build();

    merge(&target, &[source]).await.unwrap();

    let conn = fixture.target_conn();
    let (signal, kind): (i64, String) = conn
        .query_row(
            "SELECT strongest_signal, type FROM devices WHERE phyname = ?1 AND devmac = ?2",
            params![PHY, "AA:BB:CC:DD:EE:FF"],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(signal, -30);
    assert_eq!(kind, "original");
    assert_eq!(count(&conn, "devices"), 1);
}

#[tokio::test]
async fn test_remerge_grows_only_unconstrained_tables() {
    let fixture = TestFixture::new();
    let source = full_source(&fixture, 1, 4);
    let target = open_target(&fixture);

    merge(&target, &[source.clone()]).await.unwrap();
    let conn = fixture.target_conn();
    let first: Vec<i64> = APPEND_ONLY.iter().map(|t| count(&conn, t)).collect();
    let devices = count(&conn, "devices");
    let datasources = count(&conn, "datasources");

    merge(&target, &[source]).await.unwrap();

    assert_eq!(count(&conn, "devices"), devices);
    assert_eq!(count(&conn, "datasources"), datasources);
    for (table, before) in APPEND_ONLY.iter().zip(first) {
        assert_eq!(count(&conn, table), before * 2, "{table} should double");
    }
}

#[tokio::test]
async fn test_every_source_row_reaches_target() {
    let fixture = TestFixture::new();
    let sources: Vec<PathBuf> = (0..4).map(|i| full_source(&fixture, i, 3 + i)).collect();
    let target = open_target(&fixture);

    let report = merge(&target, &sources).await.unwrap();
    assert_eq!(report.sources_merged, 4);

    let conn = fixture.target_conn();
    for source in &sources {
        for table in ["devices", "packets", "data", "datasources", "alerts", "messages", "snapshots"] {
            assert!(
                is_subset(source, &conn, table),
                "{table} of {} missing from target",
                source.display()
            );
        }
    }
    assert_eq!(count(&conn, "packets"), 3 + 4 + 5 + 6);
}

#[tokio::test]
async fn test_invalid_source_does_not_block_siblings() {
    let fixture = TestFixture::new();
    let good_a = full_source(&fixture, 1, 5);
    let bad = fixture.partial_source("broken.kismet");
    let good_b = full_source(&fixture, 2, 7);
    let target = open_target(&fixture);

    let err = merge(&target, &[good_a, bad.clone(), good_b]).await.unwrap_err();

    let MergeError::Aggregate(aggregate) = err else {
        panic!("expected aggregate error, got {err}");
    };
    for e in aggregate.errors() {
        match e {
            MergeError::Schema { path, .. } => assert_eq!(path, &bad),
            other => panic!("unexpected error: {other}"),
        }
    }

    let conn = fixture.target_conn();
    assert_eq!(count(&conn, "packets"), 12);
    assert_eq!(count(&conn, "devices"), 2);
}

#[tokio::test]
async fn test_missing_source_file_is_recorded() {
    let fixture = TestFixture::new();
    let good = full_source(&fixture, 1, 2);
    let missing = fixture.path("never-written.kismet");
    let target = open_target(&fixture);

    let err = merge(&target, &[missing.clone(), good]).await.unwrap_err();

    let MergeError::Aggregate(aggregate) = err else {
        panic!("expected aggregate error, got {err}");
    };
    assert_eq!(aggregate.len(), 1);
    assert!(matches!(&aggregate.errors()[0], MergeError::Access { path, .. } if path == &missing));
    assert!(!missing.exists());
    assert_eq!(count(&fixture.target_conn(), "packets"), 2);
}

#[tokio::test]
async fn test_later_groups_do_not_run_after_a_failure() {
    let fixture = TestFixture::new();
    let first = full_source(&fixture, 1, 2);
    let bad = fixture.partial_source("broken.kismet");
    let later = full_source(&fixture, 2, 3);
    let target = open_target(&fixture);

    let mut orchestrator = MergeOrchestrator::new(
        Arc::clone(&target),
        MergeOptions {
            batch: BatchConfig::from_config(1),
            ..options()
        },
        CancellationToken::new(),
    );
    assert!(orchestrator.run(&[first, bad, later]).await.is_err());

    let report = orchestrator.report();
    assert_eq!(report.groups, 1);
    assert_eq!(report.sources_merged, 1);
    assert_eq!(report.sources_rejected, 1);
    assert_eq!(count(&fixture.target_conn(), "packets"), 2);
}

#[tokio::test]
async fn test_twelve_sources_span_two_groups() {
    let fixture = TestFixture::new();
    let sources: Vec<PathBuf> = (0..12).map(|i| full_source(&fixture, i, 10)).collect();
    let target = open_target(&fixture);

    let report = merge(&target, &sources).await.unwrap();

    assert_eq!(report.groups, 2);
    assert_eq!(report.sources_merged, 12);
    let conn = fixture.target_conn();
    assert_eq!(count(&conn, "packets"), 120);
    assert_eq!(count(&conn, "devices"), 12);
    assert_eq!(count(&conn, "datasources"), 12);
    // Maintenance ran after the groups.
    let stats: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'sqlite_stat1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stats, 1);
}

#[tokio::test]
async fn test_custom_target_tables_are_merged() {
    let fixture = TestFixture::new();
    let target = open_target(&fixture);
    target
        .conn()
        .execute_batch("CREATE TABLE operator_notes (ts_sec INT, note TEXT);")
        .unwrap();
    let with_notes = fixture
        .source("notes.kismet")
        .packets("02:00:00:00:00:01", 0, 1)
        .exec(
            "CREATE TABLE operator_notes (ts_sec INT, note TEXT);
             INSERT INTO operator_notes VALUES (1, 'parked by the gate'), (2, 'moved north');
             CREATE TABLE source_only (x INT);
             INSERT INTO source_only VALUES (1);",
        )
        .build();
    let without_notes = fixture
        .source("plain.kismet")
        .packets("02:00:00:00:00:02", 0, 1)
        .build();

    merge(&target, &[with_notes, without_notes]).await.unwrap();

    let conn = fixture.target_conn();
    assert_eq!(count(&conn, "operator_notes"), 2);
    assert_eq!(count(&conn, "packets"), 2);
    // Tables only a source has are not created on the target.
    let source_only: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'source_only'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(source_only, 0);
}

#[tokio::test]
async fn test_older_capture_without_optional_tables_merges() {
    let fixture = TestFixture::new();
    let old = fixture
        .source("old.kismet")
        .packets("02:00:00:00:00:01", 0, 3)
        .exec("DROP TABLE snapshots; DROP TABLE datasources;")
        .build();
    let target = open_target(&fixture);

    let report = merge(&target, &[old]).await.unwrap();

    assert_eq!(report.sources_merged, 1);
    assert_eq!(count(&fixture.target_conn(), "packets"), 3);
}

#[tokio::test]
async fn test_contended_merge_with_bulk_load_pragmas() {
    init_test_tracing();
    let fixture = TestFixture::new();
    let sources: Vec<PathBuf> = (0..10).map(|i| full_source(&fixture, i, 200)).collect();
    let target = open_target(&fixture);
    target.enable_wal(true).unwrap();
    target.enable_async(true).unwrap();
    target.set_journal_size_limit(6_144_000).unwrap();

    let report = merge(&target, &sources).await.unwrap();

    assert_eq!(report.sources_merged, 10);
    assert_eq!(count(&target.conn(), "packets"), 2_000);

    target.restore_all_pragmas().unwrap();
    let mode: String = target
        .conn()
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "delete");
}

#[tokio::test]
async fn test_cancellation_leaves_whole_sources_only() {
    let fixture = TestFixture::new();
    let per_source = 50;
    let sources: Vec<PathBuf> = (0..6).map(|i| full_source(&fixture, i, per_source)).collect();
    let target = open_target(&fixture);
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        })
    };

    let mut orchestrator = MergeOrchestrator::new(
        Arc::clone(&target),
        MergeOptions {
            batch: BatchConfig::from_config(2),
            ..options()
        },
        cancel,
    );
    let result = orchestrator.run(&sources).await;
    trigger.await.unwrap();

    match result {
        Ok(report) => assert_eq!(report.sources_merged, 6),
        Err(e) => assert!(matches!(e, MergeError::Cancelled), "unexpected error: {e}"),
    }

    // Every source committed in full or not at all.
    let packets = count(&fixture.target_conn(), "packets");
    assert_eq!(packets % per_source as i64, 0);
    assert_eq!(
        packets / per_source as i64,
        orchestrator.report().sources_merged as i64
    );
}
