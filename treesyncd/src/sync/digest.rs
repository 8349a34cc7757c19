use super::index::{DirectoryEntry, FileEntry, IndexError, InventoryStore};

/// Digest of a directory with no children (MD5 of no input).
pub const EMPTY_DIGEST: [u8; 16] = [
    0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42, 0x7e,
];

/// Hash over the stored fields of a directory's direct children.
///
/// Both slices must be ordered by id, which is how the store returns them.
/// Strings are NUL-terminated so adjacent fields cannot run together.
pub fn digest_of(dirs: &[DirectoryEntry], files: &[FileEntry]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    for dir in dirs {
        ctx.consume(dir.digest);
        ctx.consume(dir.id.to_le_bytes());
        ctx.consume(dir.parent_id.unwrap_or(0).to_le_bytes());
        consume_str(&mut ctx, &dir.name);
        consume_str(&mut ctx, &dir.attributes);
    }
    for file in files {
        ctx.consume(file.md5);
        ctx.consume(file.id.to_le_bytes());
        ctx.consume(file.dir_id.to_le_bytes());
        consume_str(&mut ctx, &file.name);
        consume_str(&mut ctx, &file.attributes);
        ctx.consume(file.crc32.to_le_bytes());
        ctx.consume(file.modified.to_le_bytes());
        ctx.consume(file.changed.to_le_bytes());
    }
    ctx.compute().0
}

fn consume_str(ctx: &mut md5::Context, value: &str) {
    ctx.consume(value.as_bytes());
    ctx.consume([0u8]);
}

/// Recomputes `dir_id` only, without touching its ancestors.
pub async fn recompute_level(store: &InventoryStore, dir_id: i64) -> Result<[u8; 16], IndexError> {
    let dirs = store.directory_children(dir_id).await?;
    let files = store.file_children(dir_id).await?;
    let digest = digest_of(&dirs, &files);
    store.set_digest(dir_id, &digest).await?;
    Ok(digest)
}

/// Recomputes `dir_id` and then every ancestor up to the root, inside the
/// caller's transaction when one is open.
pub async fn recompute_digest(store: &InventoryStore, dir_id: i64) -> Result<[u8; 16], IndexError> {
    store.begin().await?;
    let result = recompute_upward(store, dir_id).await;
    store.finish(result).await
}

async fn recompute_upward(store: &InventoryStore, dir_id: i64) -> Result<[u8; 16], IndexError> {
    let digest = recompute_level(store, dir_id).await?;
    let mut current = store
        .directory(dir_id)
        .await?
        .ok_or(IndexError::MissingDirectory(dir_id))?;
    let mut hops = 0usize;
    while let Some(parent_id) = current.parent_id {
        hops += 1;
        if hops > 4096 {
            return Err(IndexError::TreeTooDeep(dir_id));
        }
        recompute_level(store, parent_id).await?;
        current = store
            .directory(parent_id)
            .await?
            .ok_or(IndexError::MissingDirectory(parent_id))?;
    }
    Ok(digest)
}

/// Recomputes every directory below `dir_id` bottom-up, then the ancestor chain.
pub async fn recompute_digest_deep(
    store: &InventoryStore,
    dir_id: i64,
) -> Result<[u8; 16], IndexError> {
    store.begin().await?;
    let result = recompute_deep_inner(store, dir_id).await;
    store.finish(result).await
}

async fn recompute_deep_inner(store: &InventoryStore, dir_id: i64) -> Result<[u8; 16], IndexError> {
    let subtree = store.directory_subtree(dir_id).await?;
    for dir in subtree.iter().rev().filter(|dir| dir.id != dir_id) {
        recompute_level(store, dir.id).await?;
    }
    recompute_upward(store, dir_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::NewFile;
    use treesync_core::ROOT_DIR_ID;

    async fn make_store() -> InventoryStore {
        InventoryStore::open_in_memory("docs", false).await.unwrap()
    }

    fn new_file(dir_id: i64, name: &str, crc32: u32) -> NewFile {
        NewFile {
            dir_id,
            name: name.into(),
            size: 3,
            modified: 1_000,
            attributes: "644".into(),
            crc32,
            md5: [7; 16],
            changed: 2_000,
        }
    }

    #[test]
    fn empty_directory_digest_is_md5_of_nothing() {
        assert_eq!(digest_of(&[], &[]), EMPTY_DIGEST);
        assert_eq!(EMPTY_DIGEST, md5::compute(b"").0);
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let store = make_store().await;
        let sub = store
            .directory_list_insert(ROOT_DIR_ID, "a", 0, "755")
            .await
            .unwrap();
        store.file_list_insert(new_file(sub.id, "x.txt", 1)).await.unwrap();

        let first = recompute_digest(&store, sub.id).await.unwrap();
        let root_first = store.directory(ROOT_DIR_ID).await.unwrap().unwrap().digest;
        let second = recompute_digest(&store, sub.id).await.unwrap();
        let root_second = store.directory(ROOT_DIR_ID).await.unwrap().unwrap().digest;

        assert_eq!(first, second);
        assert_eq!(root_first, root_second);
    }

    #[tokio::test]
    async fn child_change_propagates_to_every_ancestor() {
        let store = make_store().await;
        let a = store
            .directory_list_insert(ROOT_DIR_ID, "a", 0, "755")
            .await
            .unwrap();
        let b = store.directory_list_insert(a.id, "b", 0, "755").await.unwrap();
        let file = store.file_list_insert(new_file(b.id, "x.txt", 1)).await.unwrap();
        recompute_digest_deep(&store, ROOT_DIR_ID).await.unwrap();

        let before: Vec<[u8; 16]> = {
            let mut out = Vec::new();
            for id in [b.id, a.id, ROOT_DIR_ID] {
                out.push(store.directory(id).await.unwrap().unwrap().digest);
            }
            out
        };

        let mut changed = file.clone();
        changed.crc32 = 2;
        store.file_list_update(&changed).await.unwrap();
        recompute_digest(&store, b.id).await.unwrap();

        for (index, id) in [b.id, a.id, ROOT_DIR_ID].into_iter().enumerate() {
            let after = store.directory(id).await.unwrap().unwrap().digest;
            assert_ne!(after, before[index], "digest of {id} did not change");
        }
    }

    #[tokio::test]
    async fn deep_recompute_matches_incremental_updates() {
        let store = make_store().await;
        let a = store
            .directory_list_insert(ROOT_DIR_ID, "a", 0, "755")
            .await
            .unwrap();
        let b = store.directory_list_insert(a.id, "b", 0, "700").await.unwrap();
        store.file_list_insert(new_file(b.id, "x", 9)).await.unwrap();
        store.file_list_insert(new_file(a.id, "y", 8)).await.unwrap();

        recompute_digest(&store, b.id).await.unwrap();
        recompute_digest(&store, a.id).await.unwrap();
        let incremental = store.directory(ROOT_DIR_ID).await.unwrap().unwrap().digest;

        store.set_digest(a.id, &[0; 16]).await.unwrap();
        store.set_digest(b.id, &[0; 16]).await.unwrap();
        let deep = recompute_digest_deep(&store, ROOT_DIR_ID).await.unwrap();

        assert_eq!(deep, incremental);
    }

    #[test]
    fn digest_ignores_directory_timestamps() {
        let dir = DirectoryEntry {
            id: 2,
            parent_id: Some(1),
            name: "a".into(),
            modified: 1,
            attributes: "755".into(),
            digest: EMPTY_DIGEST,
        };
        let mut touched = dir.clone();
        touched.modified = 99;
        assert_eq!(digest_of(&[dir], &[]), digest_of(&[touched], &[]));
    }
}
