#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::time::{Duration, SystemTime};

use tierfs::entry::Location;
use tierfs::sync::SyncOutcome;

use common::{Fixture, vp};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_file_is_local_until_synced() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    let data = vec![7u8; 1000];

    fs.write_file(&vp("report.pdf"), &data).await.unwrap();
    let row = fs.path_status(&vp("report.pdf")).unwrap().unwrap();
    assert_eq!(row.location, Location::LocalOnly);
    assert!(row.is_dirty);
    assert!(!fx.external_file("report.pdf").exists());

    let outcome = fs.force_sync(&vp("report.pdf")).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Copied);
    let row = fs.path_status(&vp("report.pdf")).unwrap().unwrap();
    assert_eq!(row.location, Location::Both);
    assert!(!row.is_dirty);
    assert_eq!(row.size, 1000);
    assert_eq!(std::fs::read(fx.external_file("report.pdf")).unwrap(), data);

    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_reads_do_not_fill_the_cache() {
    let fx = Fixture::new();
    fx.put_external("movie.mp4", b"frames");
    let (fs, _) = fx.start().await;

    assert_eq!(&fs.read_file(&vp("movie.mp4")).await.unwrap()[..], b"frames");
    let row = fs.path_status(&vp("movie.mp4")).unwrap().unwrap();
    assert_eq!(row.location, Location::ExternalOnly);
    assert!(!fx.local_file("movie.mp4").exists());

    fs.shutdown().await;
}

/// Local wins: an external edit made since the last sync survives only as a backup.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_external_edit_is_kept_as_a_conflict_backup() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    let notes = vp("notes.txt");

    fs.write_file(&notes, b"v1").await.unwrap();
    assert_eq!(fs.force_sync(&notes).await.unwrap(), SyncOutcome::Copied);

    // Someone edits the external copy directly, then we edit locally too.
    let external = fx.external_file("notes.txt");
    std::fs::write(&external, b"theirs").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&external)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
    fs.write_file(&notes, b"mine").await.unwrap();

    let SyncOutcome::Conflict { backup } = fs.force_sync(&notes).await.unwrap() else {
        panic!("expected a conflict");
    };
    assert!(backup.starts_with("notes.txt.conflict-"), "{backup}");
    assert_eq!(std::fs::read(&external).unwrap(), b"mine");
    assert_eq!(std::fs::read(fx.external_file(&backup)).unwrap(), b"theirs");

    let conflicts = fs.pending_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].virtual_path, notes);
    assert_eq!(conflicts[0].backup_name, backup);

    let names: Vec<_> = fs
        .readdir(&vp(""))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["notes.txt".to_owned()]);

    assert!(fs.resolve_conflict(conflicts[0].id).unwrap());
    assert!(fs.pending_conflicts().unwrap().is_empty());

    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_made_offline_sync_after_reconnect() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    let later = vp("later.txt");

    fs.set_external_online(false).await.unwrap();
    fs.write_file(&later, b"queued").await.unwrap();
    fs.flush_sync().await;
    assert!(!fx.external_file("later.txt").exists());
    assert!(fs.path_status(&later).unwrap().unwrap().is_dirty);

    fs.set_external_online(true).await.unwrap();
    fs.flush_sync().await;
    assert_eq!(std::fs::read(fx.external_file("later.txt")).unwrap(), b"queued");
    let row = fs.path_status(&later).unwrap().unwrap();
    assert!(!row.is_dirty);
    assert_eq!(row.location, Location::Both);

    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn debounced_sync_happens_without_a_flush() {
    let mut fx = Fixture::new();
    fx.config.sync_debounce = Duration::from_millis(50);
    let (fs, _) = fx.start().await;

    fs.write_file(&vp("quick.txt"), b"soon").await.unwrap();
    let mut synced = false;
    for _ in 0..200 {
        if fx.external_file("quick.txt").exists()
            && !fs.path_status(&vp("quick.txt")).unwrap().unwrap().is_dirty
        {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synced, "debounced sync did not run within 2 seconds");

    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_pending_syncs() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;

    fs.write_file(&vp("a.txt"), b"a").await.unwrap();
    fs.mkdir(&vp("dir")).await.unwrap();
    fs.write_file(&vp("dir/b.txt"), b"b").await.unwrap();
    fs.shutdown().await;

    assert_eq!(std::fs::read(fx.external_file("a.txt")).unwrap(), b"a");
    assert!(fx.external_file("dir").is_dir());
    assert_eq!(std::fs::read(fx.external_file("dir/b.txt")).unwrap(), b"b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn contents_survive_sync_and_eviction() {
    let mut fx = Fixture::new();
    fx.config.eviction.quota = 100;
    fx.config.eviction.reserve_fraction = 0.5;
    let (fs, _) = fx.start().await;

    for name in ["a.txt", "b.txt"] {
        fs.write_file(&vp(name), name.repeat(8).as_bytes()).await.unwrap();
        assert_eq!(fs.read_file(&vp(name)).await.unwrap(), name.repeat(8).as_bytes());
        fs.force_sync(&vp(name)).await.unwrap();
        assert_eq!(fs.read_file(&vp(name)).await.unwrap(), name.repeat(8).as_bytes());
    }
    fs.write_file(&vp("dirty.txt"), b"0123456789").await.unwrap();

    let candidates: Vec<_> = fs
        .eviction_candidates(10)
        .unwrap()
        .into_iter()
        .map(|e| e.virtual_path)
        .collect();
    assert_eq!(candidates.len(), 2);
    assert!(!candidates.contains(&vp("dirty.txt")));

    let report = fs.run_eviction_cycle().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.freed, 40);

    let cold: Vec<_> = ["a.txt", "b.txt"]
        .into_iter()
        .filter(|n| {
            fs.path_status(&vp(n)).unwrap().unwrap().location == Location::ExternalOnly
        })
        .collect();
    assert_eq!(cold.len(), 1);
    assert!(!fx.local_file(cold[0]).exists());
    for name in ["a.txt", "b.txt"] {
        assert_eq!(fs.read_file(&vp(name)).await.unwrap(), name.repeat(8).as_bytes());
    }
    assert_eq!(
        fs.path_status(&vp("dirty.txt")).unwrap().unwrap().location,
        Location::LocalOnly
    );

    fs.shutdown().await;
}
