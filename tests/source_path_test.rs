//! Database file name handling.
//!
//! These tests change the working directory, so they run in their own
//! test binary.
//!
//! Tests:
//! - Relative names starting with `file:` are plain file names, not URIs

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::{count, TestFixture};
use kismet_merge::{DatabaseHandle, MergeOptions, MergeOrchestrator};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_file_prefixed_names_are_plain_paths() {
    let fixture = TestFixture::new();
    fixture
        .source("file:capture.kismet")
        .packets("02:00:00:00:00:01", 0, 4)
        .build();
    std::env::set_current_dir(fixture.temp_dir.path()).unwrap();

    let source = DatabaseHandle::open_source("file:capture.kismet").unwrap();
    source.check_schema().unwrap();
    drop(source);

    let target = Arc::new(DatabaseHandle::open_target("file:merged.kismet").unwrap());
    let mut merge = MergeOrchestrator::new(
        Arc::clone(&target),
        MergeOptions::default(),
        CancellationToken::new(),
    );
    let report = merge.run(&["file:capture.kismet"]).await.unwrap();
    assert_eq!(report.sources_merged, 1);
    drop(merge);

    // Nothing was created under the name a URI reading would produce.
    assert!(!fixture.path("capture.kismet").exists());
    assert!(!fixture.path("merged.kismet").exists());

    let merged = rusqlite::Connection::open(fixture.path("file:merged.kismet")).unwrap();
    assert_eq!(count(&merged, "packets"), 4);
}
