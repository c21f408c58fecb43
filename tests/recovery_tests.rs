#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use tierfs::entry::{DeletePhase, Location};
use tierfs::roots::TREE_DESCRIPTOR_NAME;
use tierfs::store::MetadataStore;

use common::{Fixture, vp};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_roots_are_trusted_on_restart() {
    let fx = Fixture::new();
    fx.put_external("old.txt", b"seen once");
    let (fs, first) = fx.start().await;
    assert!(first.rescanned_local);
    assert!(first.rescanned_external);

    fs.write_file(&vp("new.txt"), b"fresh").await.unwrap();
    fs.shutdown().await;
    drop(fs);

    let (fs, second) = fx.start().await;
    assert!(!second.rescanned_local);
    assert!(!second.rescanned_external);
    assert_eq!(second.requeued, 0);
    assert_eq!(
        fs.path_status(&vp("new.txt")).unwrap().unwrap().location,
        Location::Both
    );
    assert_eq!(
        fs.path_status(&vp("old.txt")).unwrap().unwrap().location,
        Location::ExternalOnly
    );
    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_descriptor_forces_a_rescan() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    fs.shutdown().await;
    drop(fs);

    // Another client that knows nothing about our descriptor rewrites the tree.
    fx.put_external("dropped-in.txt", b"hello");
    std::fs::remove_file(fx.external_file(TREE_DESCRIPTOR_NAME)).unwrap();
    let (fs, report) = fx.start().await;
    assert!(!report.rescanned_local);
    assert!(report.rescanned_external);
    assert_eq!(
        fs.path_status(&vp("dropped-in.txt")).unwrap().unwrap().location,
        Location::ExternalOnly
    );
    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_interrupted_after_local_removal_finishes_on_restart() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    fs.write_file(&vp("doc.txt"), b"doomed").await.unwrap();
    fs.force_sync(&vp("doc.txt")).await.unwrap();
    fs.shutdown().await;
    drop(fs);

    // Simulate a crash between the local removal and the external one.
    {
        let store = MetadataStore::open(&fx.config.database).unwrap();
        let mut row = store.get(&vp("doc.txt")).unwrap().unwrap();
        row.delete_phase = DeletePhase::LocalRemoved;
        row.local_path = None;
        store.upsert(&row).unwrap();
    }
    std::fs::remove_file(fx.local_file("doc.txt")).unwrap();
    assert!(fx.external_file("doc.txt").exists());

    let (fs, report) = fx.start().await;
    assert_eq!(report.recovered_deletes, 1);
    assert!(!fx.external_file("doc.txt").exists());
    assert!(fs.path_status(&vp("doc.txt")).unwrap().is_none());
    assert!(fs.readdir(&vp("")).await.unwrap().is_empty());
    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dirty_files_are_requeued_on_restart() {
    let fx = Fixture::new();
    let (fs, _) = fx.start().await;
    fs.set_external_online(false).await.unwrap();
    fs.write_file(&vp("unsynced.txt"), b"pending").await.unwrap();
    fs.shutdown().await;
    drop(fs);
    assert!(!fx.external_file("unsynced.txt").exists());

    let (fs, report) = fx.start().await;
    assert_eq!(report.requeued, 1);
    fs.flush_sync().await;
    assert_eq!(
        std::fs::read(fx.external_file("unsynced.txt")).unwrap(),
        b"pending"
    );
    fs.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_database_is_rebuilt_from_the_roots() {
    let fx = Fixture::new();
    std::fs::write(fx.local_file("kept.txt"), b"survivor").unwrap();
    fx.put_external("remote.txt", b"far away");
    let db = &fx.config.database;
    std::fs::create_dir_all(db.parent().unwrap()).unwrap();
    std::fs::write(db, vec![0xAB; 4096]).unwrap();

    let (fs, report) = fx.start().await;
    assert!(report.rescanned_local);
    assert!(report.rescanned_external);
    assert!(fs.path_status(&vp("kept.txt")).unwrap().is_some());
    assert!(fs.path_status(&vp("remote.txt")).unwrap().is_some());

    let aside = std::fs::read_dir(db.parent().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
    assert!(aside, "the unreadable database should be kept aside");
    fs.shutdown().await;
}
