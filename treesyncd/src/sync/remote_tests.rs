use std::collections::HashMap;

use super::*;
use crate::sync::index::NewFile;
use crate::sync::paths::apply_metadata;

#[derive(Default)]
struct FakePeer {
    listings: HashMap<i64, FileListResponse>,
    listed: Vec<i64>,
}

impl FakePeer {
    fn with_dir(mut self, parent: i64, id: i64, name: &str, digest: [u8; 16]) -> Self {
        self.listings
            .entry(parent)
            .or_default()
            .directories
            .push(WireDir {
                id,
                parent_id: Some(parent),
                name: name.into(),
                modified: 0,
                attributes: "755".into(),
                digest,
            });
        self
    }

    fn with_file(mut self, file: WireFile) -> Self {
        self.listings.entry(file.dir_id).or_default().files.push(file);
        self
    }
}

impl RemotePeer for FakePeer {
    async fn list_directory(&mut self, dir_id: i64) -> Result<FileListResponse, SessionError> {
        self.listed.push(dir_id);
        Ok(self.listings.get(&dir_id).cloned().unwrap_or_default())
    }

    async fn directory_digest(&mut self, dir_id: i64) -> Result<[u8; 16], SessionError> {
        Ok(self
            .listings
            .values()
            .flat_map(|listing| listing.directories.iter())
            .find(|dir| dir.id == dir_id)
            .map(|dir| dir.digest)
            .unwrap_or(EMPTY_DIGEST))
    }
}

fn wire_file(id: i64, dir_id: i64, name: &str, modified: i64, crc: u32) -> WireFile {
    WireFile {
        id,
        dir_id,
        name: name.into(),
        size: 5,
        modified,
        attributes: "644".into(),
        crc,
        md5: [3; 16],
        changed: 1,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    tree: LocalTree,
    store: InventoryStore,
}

async fn fixture(history: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
    tokio::fs::create_dir_all(tree.root()).await.unwrap();
    let store = InventoryStore::open_in_memory("docs", history).await.unwrap();
    Fixture {
        _dir: dir,
        tree,
        store,
    }
}

async fn write_synced(path: &Path, modified: i64) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, b"hello").await.unwrap();
    apply_metadata(path, modified, "644").unwrap();
}

#[tokio::test]
async fn directory_known_by_name_adopts_server_id() {
    let fx = fixture(false).await;
    let local = fx
        .store
        .directory_list_insert(ROOT_DIR_ID, "a", 0, "755")
        .await
        .unwrap();
    let file = wire_file(9, 5, "x.txt", 1_000_000, 42);
    fx.store
        .file_list_insert(NewFile {
            dir_id: local.id,
            name: "x.txt".into(),
            size: file.size,
            modified: file.modified,
            attributes: file.attributes.clone(),
            crc32: file.crc,
            md5: file.md5,
            changed: file.changed,
        })
        .await
        .unwrap();
    write_synced(&fx.tree.root().join("a").join("x.txt"), file.modified).await;
    let mut peer = FakePeer::default()
        .with_dir(ROOT_DIR_ID, 5, "a", EMPTY_DIGEST)
        .with_file(file);

    let report = RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    assert!(fx.store.directory(local.id).await.unwrap().is_none());
    assert_eq!(fx.store.directory(5).await.unwrap().unwrap().name, "a");
    assert_eq!(fx.store.file(9).await.unwrap().unwrap().dir_id, 5);
    assert_eq!(report.adopted, 2);
    assert_eq!(report.enqueued, 0);
    assert_eq!(peer.listed, vec![ROOT_DIR_ID, 5]);
}

#[tokio::test]
async fn missing_server_subtree_is_queued_as_dependent_downloads() {
    let fx = fixture(false).await;
    let mut peer = FakePeer::default()
        .with_dir(ROOT_DIR_ID, 7, "new", EMPTY_DIGEST)
        .with_file(wire_file(8, 7, "f.txt", 1, 1))
        .with_dir(7, 9, "sub", EMPTY_DIGEST)
        .with_file(wire_file(10, 9, "g.txt", 1, 1));

    let report = RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    let items = fx.store.queue_items().await.unwrap();
    let find = |name: &str| items.iter().find(|item| item.name == name).unwrap();
    let new = find("new");
    let sub = find("sub");
    assert_eq!(report.enqueued, 4);
    assert_eq!((new.action, new.dir_id, new.depends_on), (ActionType::DownloadDir, 7, None));
    assert_eq!(find("f.txt").depends_on, Some(new.id));
    assert_eq!(find("f.txt").file_id, 8);
    assert_eq!((sub.action, sub.depends_on), (ActionType::DownloadDir, Some(new.id)));
    assert_eq!(find("g.txt").depends_on, Some(sub.id));
}

#[tokio::test]
async fn existing_local_directory_is_recorded_directly() {
    let fx = fixture(false).await;
    tokio::fs::create_dir_all(fx.tree.root().join("shared"))
        .await
        .unwrap();
    let mut peer = FakePeer::default().with_dir(ROOT_DIR_ID, 12, "shared", [1; 16]);

    let report = RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.enqueued, 0);
    let stored = fx.store.directory(12).await.unwrap().unwrap();
    assert_eq!(stored.digest, EMPTY_DIGEST);
}

#[tokio::test]
async fn entries_gone_from_server_are_removed_locally() {
    let fx = fixture(true).await;
    let path = fx.tree.root().join("old.txt");
    write_synced(&path, 1_000).await;
    fx.store
        .file_list_insert(NewFile {
            dir_id: ROOT_DIR_ID,
            name: "old.txt".into(),
            size: 5,
            modified: 1_000,
            attributes: "644".into(),
            crc32: 1,
            md5: [0; 16],
            changed: 0,
        })
        .await
        .unwrap();
    let mut peer = FakePeer::default();

    let report = RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    assert_eq!(report.removed, 1);
    assert!(!path.exists());
    assert!(fx.store.file_children(ROOT_DIR_ID).await.unwrap().is_empty());
    assert_eq!(fx.store.history_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn metadata_only_change_is_applied_in_place() {
    let fx = fixture(false).await;
    let path = fx.tree.root().join("a.txt");
    write_synced(&path, 1_000_000).await;
    let old = wire_file(4, ROOT_DIR_ID, "a.txt", 1_000_000, 77);
    fx.store
        .file_list_insert_with_id(&FileEntry::from(&old))
        .await
        .unwrap();
    let mut peer = FakePeer::default().with_file(wire_file(4, ROOT_DIR_ID, "a.txt", 2_000_000, 77));

    RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    assert_eq!(stat(&path).await.unwrap().modified, 2_000_000);
    assert_eq!(fx.store.file(4).await.unwrap().unwrap().modified, 2_000_000);
    assert_eq!(fx.store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn content_change_queues_update() {
    let fx = fixture(false).await;
    let path = fx.tree.root().join("a.txt");
    write_synced(&path, 1_000_000).await;
    let old = wire_file(4, ROOT_DIR_ID, "a.txt", 1_000_000, 77);
    fx.store
        .file_list_insert_with_id(&FileEntry::from(&old))
        .await
        .unwrap();
    let mut peer = FakePeer::default().with_file(wire_file(4, ROOT_DIR_ID, "a.txt", 2_000_000, 78));

    RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();

    let items = fx.store.queue_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!((items[0].action, items[0].file_id), (ActionType::UpdateFile, 4));
    assert_eq!(fx.store.file(4).await.unwrap().unwrap().crc32, 78);
}

#[tokio::test]
async fn pruning_skips_subtrees_with_equal_digests() {
    let fx = fixture(false).await;
    tokio::fs::create_dir_all(fx.tree.root().join("same"))
        .await
        .unwrap();
    fx.store
        .directory_list_insert_with_id(&DirectoryEntry {
            id: 3,
            parent_id: Some(ROOT_DIR_ID),
            name: "same".into(),
            modified: 0,
            attributes: "755".into(),
            digest: [9; 16],
        })
        .await
        .unwrap();
    let mut peer = FakePeer::default().with_dir(ROOT_DIR_ID, 3, "same", [9; 16]);

    RemoteReconciler::new(&fx.store, &fx.tree)
        .with_digest_pruning(true)
        .reconcile(&mut peer)
        .await
        .unwrap();
    assert_eq!(peer.listed, vec![ROOT_DIR_ID]);

    RemoteReconciler::new(&fx.store, &fx.tree)
        .reconcile(&mut peer)
        .await
        .unwrap();
    assert_eq!(peer.listed, vec![ROOT_DIR_ID, ROOT_DIR_ID, 3]);
}
