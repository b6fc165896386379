//! Integration tests for local and in-memory sync

use objsync::config::Config;
use objsync::storage::memory::StoreEvent;
use objsync::storage::{LocalStore, MemoryStore, Store};
use objsync::sync::{create_stores, SyncEngine};
use objsync::types::ActionKind;
use objsync::uri::Location;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Create a test file with specified content
fn create_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Get file content
fn read_file(dir: &TempDir, name: &str) -> Vec<u8> {
    fs::read(dir.path().join(name)).unwrap()
}

/// Check if file exists
fn file_exists(dir: &TempDir, name: &str) -> bool {
    dir.path().join(name).exists()
}

fn local_engine(config: Config, source: &TempDir, dest: &TempDir) -> SyncEngine {
    SyncEngine::new(
        config,
        Arc::new(LocalStore::new(source.path())),
        Arc::new(LocalStore::new(dest.path())),
    )
}

#[tokio::test]
async fn test_sync_new_files() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "file1.txt", b"hello world");
    create_file(&source, "file2.txt", b"goodbye world");
    create_file(&source, "subdir/file3.txt", b"nested file");

    let report = local_engine(Config::default(), &source, &dest).sync().await;

    assert_eq!(read_file(&dest, "file1.txt"), b"hello world");
    assert_eq!(read_file(&dest, "file2.txt"), b"goodbye world");
    assert_eq!(read_file(&dest, "subdir/file3.txt"), b"nested file");

    // three files plus the subdir marker
    assert_eq!(report.applied_of(ActionKind::Copy), 4);
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_sync_updates_modified_files() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "file.txt", b"new!");
    create_file(&dest, "file.txt", b"old!");

    let report = local_engine(Config::default(), &source, &dest).sync().await;

    assert_eq!(read_file(&dest, "file.txt"), b"new!");
    assert_eq!(report.applied_of(ActionKind::Copy), 1);
}

#[tokio::test]
async fn test_copy_skip_delete_scenario() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "a.txt", b"0123456789");
    create_file(&source, "b.txt", b"abcdefghij");
    create_file(&dest, "b.txt", b"abcdefghij");
    create_file(&dest, "c.txt", b"zzzzzzzzzz");

    let config = Config {
        delete: true,
        ..Config::default()
    };
    let report = local_engine(config, &source, &dest).sync().await;

    assert_eq!(report.outcome_for("a.txt").unwrap().kind, ActionKind::Copy);
    assert_eq!(report.outcome_for("b.txt").unwrap().kind, ActionKind::Skip);
    assert_eq!(report.outcome_for("c.txt").unwrap().kind, ActionKind::Delete);
    assert!(file_exists(&dest, "a.txt"));
    assert!(!file_exists(&dest, "c.txt"));
}

#[tokio::test]
async fn test_no_delete_without_flag() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "keep.txt", b"keep");
    create_file(&dest, "extra.txt", b"extra");

    let report = local_engine(Config::default(), &source, &dest).sync().await;

    assert!(file_exists(&dest, "extra.txt"));
    assert_eq!(report.applied_of(ActionKind::Delete), 0);
}

#[tokio::test]
async fn test_delete_removes_extraneous_directories() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "keep.txt", b"keep");
    create_file(&dest, "gone/deep/x.txt", b"x");
    create_file(&dest, "gone/y.txt", b"y");

    let config = Config {
        delete: true,
        ..Config::default()
    };
    let report = local_engine(config, &source, &dest).sync().await;

    assert!(!report.has_failures());
    assert!(!file_exists(&dest, "gone"));
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "one.txt", b"1");
    create_file(&source, "dir/two.txt", b"22");

    let config = Config {
        delete: true,
        ..Config::default()
    };
    local_engine(config.clone(), &source, &dest).sync().await;
    let second = local_engine(config, &source, &dest).sync().await;

    assert_eq!(second.applied(), 0);
    assert_eq!(second.skipped(), second.outcomes.len());
}

#[tokio::test]
async fn test_dry_run_no_changes() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    create_file(&source, "file.txt", b"content");
    create_file(&dest, "old.txt", b"old");

    let config = Config {
        dry_run: true,
        delete: true,
        ..Config::default()
    };
    let report = local_engine(config, &source, &dest).sync().await;

    assert!(report.dry_run);
    assert_eq!(report.applied_of(ActionKind::Copy), 1);
    assert_eq!(report.applied_of(ActionKind::Delete), 1);
    assert!(!file_exists(&dest, "file.txt"));
    assert!(file_exists(&dest, "old.txt"));
}

#[tokio::test]
async fn test_single_file_source() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "report.pdf", b"%PDF");

    let src = Location::Local(source.path().join("report.pdf"));
    let dst = Location::Local(dest.path().to_path_buf());
    let (src_store, dst_store) = create_stores(&src, &dst, &Config::default()).await.unwrap();

    let report = SyncEngine::new(Config::default(), src_store, dst_store).sync().await;

    assert!(!report.has_failures());
    assert_eq!(read_file(&dest, "report.pdf"), b"%PDF");
}

#[tokio::test]
async fn test_source_directory_nests_under_destination() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    create_file(&source, "photos/cat.jpg", b"meow");

    let src = Location::Local(source.path().join("photos"));
    let dst = Location::Local(dest.path().to_path_buf());
    let (src_store, dst_store) = create_stores(&src, &dst, &Config::default()).await.unwrap();
    SyncEngine::new(Config::default(), src_store, dst_store).sync().await;

    assert_eq!(read_file(&dest, "photos/cat.jpg"), b"meow");
}

#[tokio::test]
async fn test_local_to_memory_large_object_uses_parts() {
    let source = TempDir::new().unwrap();
    let data: Vec<u8> = (0..13_000u32).map(|i| (i % 256) as u8).collect();
    create_file(&source, "big.bin", &data);
    create_file(&source, "small.txt", b"tiny");

    let dest = MemoryStore::new("dst");
    let config = Config {
        part_size: 6_000,
        ..Config::default()
    };
    let report = SyncEngine::new(
        config,
        Arc::new(LocalStore::new(source.path())),
        Arc::new(dest.clone()),
    )
    .sync()
    .await;

    assert!(!report.has_failures());
    assert_eq!(dest.get("big.bin").unwrap().as_ref(), data.as_slice());
    assert_eq!(dest.get("small.txt").unwrap().as_ref(), b"tiny");

    let parts: Vec<(u32, usize)> = dest
        .events()
        .into_iter()
        .filter_map(|e| match e {
            StoreEvent::PartAttempt {
                part_number, len, ..
            } => Some((part_number, len)),
            _ => None,
        })
        .collect();
    assert_eq!(parts, vec![(1, 6_000), (2, 6_000), (3, 1_000)]);
}

#[tokio::test]
async fn test_failed_part_upload_aborts_and_reports() {
    let source = MemoryStore::new("src");
    source.insert("big.bin", vec![7u8; 3_000]);
    source.insert("ok.txt", "fine");

    let dest = MemoryStore::new("dst");
    dest.fail_part(2, 100);

    let config = Config {
        part_size: 1_000,
        part_retries: 1,
        retry_delay_ms: 1,
        max_retry_delay_ms: 1,
        ignore_errors: true,
        ..Config::default()
    };
    let report = SyncEngine::new(config, Arc::new(source), Arc::new(dest.clone()))
        .sync()
        .await;

    let failed = report.outcome_for("big.bin").unwrap();
    assert!(failed.is_failed());
    assert!(failed.error().unwrap().is_session_failure());
    assert!(report.has_failures());

    assert_eq!(dest.open_sessions(), 0);
    assert!(!dest.contains("big.bin"));
    assert!(dest.contains("ok.txt"));
}

#[tokio::test]
async fn test_memory_store_preserves_metadata_between_same_backends() {
    use objsync::storage::ObjectMetadata;

    let source = MemoryStore::new("src");
    source.insert_with_metadata(
        "page.html",
        "<html></html>",
        ObjectMetadata {
            content_type: Some("text/html".into()),
            storage_class: Some("STANDARD_IA".into()),
            checksum: None,
        },
    );
    let dest = MemoryStore::new("dst");

    SyncEngine::new(Config::default(), Arc::new(source), Arc::new(dest.clone()))
        .sync()
        .await;

    let meta = dest.metadata("page.html").unwrap();
    assert_eq!(meta.content_type.as_deref(), Some("text/html"));
    assert_eq!(meta.storage_class.as_deref(), Some("STANDARD_IA"));
    assert!(meta.checksum.is_some());
}

#[tokio::test]
async fn test_flat_source_resync_keeps_local_directories() {
    let source = MemoryStore::new("src");
    source.insert("sub/a.txt", "alpha");
    source.insert("sub/deeper/b.txt", "beta");
    let dest = TempDir::new().unwrap();

    let config = Config {
        delete: true,
        ..Config::default()
    };
    let engine = || {
        SyncEngine::new(
            config.clone(),
            Arc::new(source.clone()),
            Arc::new(LocalStore::new(dest.path())),
        )
    };

    let first = engine().sync().await;
    assert!(!first.has_failures());
    assert_eq!(read_file(&dest, "sub/a.txt"), b"alpha");

    // the local side now lists sub/ and sub/deeper/, the source never does
    let second = engine().sync().await;
    assert!(!second.has_failures());
    assert_eq!(second.applied(), 0);
    assert!(second.outcome_for("sub/").is_none());
    assert_eq!(read_file(&dest, "sub/a.txt"), b"alpha");
    assert_eq!(read_file(&dest, "sub/deeper/b.txt"), b"beta");
}

#[tokio::test]
async fn test_store_describe() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    assert_eq!(store.describe(), dir.path().display().to_string());
    assert_eq!(MemoryStore::new("x").describe(), "memory://x");
}
