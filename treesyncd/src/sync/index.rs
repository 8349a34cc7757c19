use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Row, SqliteConnection};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use treesync_core::{ROOT_DIR_ID, WireDir, WireFile};

use super::digest::EMPTY_DIGEST;
use super::paths::{PathError, validate_sync_dir_name};
use crate::logging::COMMON;

/// Failed attempts after which a queue item is parked.
pub const MAX_ATTEMPTS: i64 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TREE_DEPTH: usize = 4096;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid directory name: {0}")]
    Name(#[from] PathError),
    #[error("invalid queue action: {0}")]
    InvalidAction(i64),
    #[error("invalid history action: {0}")]
    InvalidHistoryAction(i64),
    #[error("corrupt {column} value in row {id}")]
    Corrupt { column: &'static str, id: i64 },
    #[error("directory {0} not found")]
    MissingDirectory(i64),
    #[error("directory tree is cyclic or too deep at {0}")]
    TreeTooDeep(i64),
    #[error("the root directory cannot be removed or renumbered")]
    RootImmutable,
    #[error("commit without an open transaction")]
    NoTransaction,
    #[error("transaction rolled back by a nested failure")]
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub modified: i64,
    pub attributes: String,
    pub digest: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: i64,
    pub dir_id: i64,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
    pub crc32: u32,
    pub md5: [u8; 16],
    pub changed: i64,
}

/// File fields known before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub dir_id: i64,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
    pub crc32: u32,
    pub md5: [u8; 16],
    pub changed: i64,
}

impl NewFile {
    pub fn with_id(self, id: i64) -> FileEntry {
        FileEntry {
            id,
            dir_id: self.dir_id,
            name: self.name,
            size: self.size,
            modified: self.modified,
            attributes: self.attributes,
            crc32: self.crc32,
            md5: self.md5,
            changed: self.changed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    AddDir,
    RemoveDir,
    UpdateDir,
    DownloadDir,
    AddFile,
    RemoveFile,
    UpdateFile,
    DownloadFile,
}

impl ActionType {
    fn as_i64(self) -> i64 {
        match self {
            ActionType::AddDir => 1,
            ActionType::RemoveDir => 2,
            ActionType::UpdateDir => 3,
            ActionType::DownloadDir => 4,
            ActionType::AddFile => 5,
            ActionType::RemoveFile => 6,
            ActionType::UpdateFile => 7,
            ActionType::DownloadFile => 8,
        }
    }

    fn parse(value: i64) -> Result<Self, IndexError> {
        match value {
            1 => Ok(ActionType::AddDir),
            2 => Ok(ActionType::RemoveDir),
            3 => Ok(ActionType::UpdateDir),
            4 => Ok(ActionType::DownloadDir),
            5 => Ok(ActionType::AddFile),
            6 => Ok(ActionType::RemoveFile),
            7 => Ok(ActionType::UpdateFile),
            8 => Ok(ActionType::DownloadFile),
            other => Err(IndexError::InvalidAction(other)),
        }
    }

    pub fn creates_directory(self) -> bool {
        matches!(self, ActionType::AddDir | ActionType::DownloadDir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub depends_on: Option<i64>,
    pub action: ActionType,
    pub file_id: i64,
    pub dir_id: i64,
    pub name: String,
    pub attempts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueItem {
    pub depends_on: Option<i64>,
    pub action: ActionType,
    pub file_id: i64,
    pub dir_id: i64,
    pub name: String,
}

impl NewQueueItem {
    pub fn dir(action: ActionType, dir_id: i64, name: impl Into<String>) -> Self {
        Self {
            depends_on: None,
            action,
            file_id: 0,
            dir_id,
            name: name.into(),
        }
    }

    pub fn file(action: ActionType, file_id: i64, dir_id: i64, name: impl Into<String>) -> Self {
        Self {
            depends_on: None,
            action,
            file_id,
            dir_id,
            name: name.into(),
        }
    }

    pub fn after(mut self, depends_on: Option<i64>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Removed,
    Replaced,
}

impl HistoryAction {
    fn as_i64(self) -> i64 {
        match self {
            HistoryAction::Removed => 1,
            HistoryAction::Replaced => 2,
        }
    }

    fn parse(value: i64) -> Result<Self, IndexError> {
        match value {
            1 => Ok(HistoryAction::Removed),
            2 => Ok(HistoryAction::Replaced),
            other => Err(IndexError::InvalidHistoryAction(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: i64,
    pub action: HistoryAction,
    /// Location of the saved copy, relative to the history root.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
    pub md5: [u8; 16],
    pub crc32: u32,
    pub recorded: i64,
}

struct Tables {
    dirs: String,
    files: String,
    queue: String,
    history: String,
}

impl Tables {
    fn for_directory(name: &str) -> Self {
        Self {
            dirs: format!("\"{name}_DirList\""),
            files: format!("\"{name}_FileList\""),
            queue: format!("\"{name}_Queue\""),
            history: format!("\"{name}_History\""),
        }
    }
}

struct StoreConn {
    conn: SqliteConnection,
    depth: u32,
    rollback_only: bool,
}

/// Inventory of one sync directory inside an account's store file.
///
/// Owns a single connection. Transactions are reentrant: nested
/// `begin`/`commit` pairs net out to the outermost bracket, and a nested
/// `rollback` poisons the outer bracket so its `commit` rolls back instead.
pub struct InventoryStore {
    conn: Mutex<StoreConn>,
    tables: Tables,
    directory: String,
    history: bool,
}

impl InventoryStore {
    pub async fn open(db_path: &Path, directory: &str, history: bool) -> Result<Self, IndexError> {
        validate_sync_dir_name(directory)?;
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let conn = options.connect().await?;
        Self::from_connection(conn, directory, history).await
    }

    pub async fn open_in_memory(directory: &str, history: bool) -> Result<Self, IndexError> {
        validate_sync_dir_name(directory)?;
        let conn = SqliteConnectOptions::from_str("sqlite::memory:")?
            .connect()
            .await?;
        Self::from_connection(conn, directory, history).await
    }

    async fn from_connection(
        conn: SqliteConnection,
        directory: &str,
        history: bool,
    ) -> Result<Self, IndexError> {
        let store = Self {
            conn: Mutex::new(StoreConn {
                conn,
                depth: 0,
                rollback_only: false,
            }),
            tables: Tables::for_directory(directory),
            directory: directory.to_string(),
            history,
        };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), IndexError> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    parent_id INTEGER,
                    name TEXT NOT NULL,
                    modified INTEGER NOT NULL,
                    attributes TEXT NOT NULL,
                    digest BLOB NOT NULL,
                    UNIQUE(parent_id, name)
                )",
                t.dirs
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    dir_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    modified INTEGER NOT NULL,
                    attributes TEXT NOT NULL,
                    crc32 INTEGER NOT NULL,
                    md5 BLOB NOT NULL,
                    changed INTEGER NOT NULL,
                    UNIQUE(dir_id, name)
                )",
                t.files
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    depends_on INTEGER,
                    action INTEGER NOT NULL,
                    file_id INTEGER NOT NULL,
                    dir_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0
                )",
                t.queue
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    action INTEGER NOT NULL,
                    path TEXT NOT NULL,
                    name TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    modified INTEGER NOT NULL,
                    attributes TEXT NOT NULL,
                    md5 BLOB NOT NULL,
                    crc32 INTEGER NOT NULL,
                    recorded INTEGER NOT NULL
                )",
                t.history
            ),
            format!(
                "INSERT OR IGNORE INTO {} (id, parent_id, name, modified, attributes, digest)
                 VALUES (?1, NULL, '', 0, '', ?2)",
                t.dirs
            ),
        ];

        let mut conn = self.conn.lock().await;
        for (index, sql) in statements.iter().enumerate() {
            let mut query = sqlx::query(sql);
            if index == statements.len() - 1 {
                query = query.bind(ROOT_DIR_ID).bind(EMPTY_DIGEST.to_vec());
            }
            query.execute(&mut conn.conn).await?;
        }
        Ok(())
    }

    pub fn directory_name(&self) -> &str {
        &self.directory
    }

    pub fn history_enabled(&self) -> bool {
        self.history
    }

    pub async fn begin(&self) -> Result<(), IndexError> {
        let mut conn = self.conn.lock().await;
        if conn.depth == 0 {
            sqlx::query("BEGIN IMMEDIATE").execute(&mut conn.conn).await?;
            conn.rollback_only = false;
        }
        conn.depth += 1;
        Ok(())
    }

    pub async fn commit(&self) -> Result<(), IndexError> {
        let mut conn = self.conn.lock().await;
        match conn.depth {
            0 => Err(IndexError::NoTransaction),
            1 => {
                conn.depth = 0;
                if conn.rollback_only {
                    conn.rollback_only = false;
                    sqlx::query("ROLLBACK").execute(&mut conn.conn).await?;
                    return Err(IndexError::RolledBack);
                }
                sqlx::query("COMMIT").execute(&mut conn.conn).await?;
                Ok(())
            }
            _ => {
                conn.depth -= 1;
                Ok(())
            }
        }
    }

    pub async fn rollback(&self) -> Result<(), IndexError> {
        let mut conn = self.conn.lock().await;
        match conn.depth {
            0 => Err(IndexError::NoTransaction),
            1 => {
                conn.depth = 0;
                conn.rollback_only = false;
                sqlx::query("ROLLBACK").execute(&mut conn.conn).await?;
                Ok(())
            }
            _ => {
                conn.depth -= 1;
                conn.rollback_only = true;
                Ok(())
            }
        }
    }

    pub async fn in_transaction(&self) -> bool {
        self.conn.lock().await.depth > 0
    }

    /// Closes a bracket opened with `begin` according to `result`.
    pub async fn finish<T>(&self, result: Result<T, IndexError>) -> Result<T, IndexError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.rollback().await {
                    warn!(target: COMMON, directory = %self.directory, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn directory(&self, id: i64) -> Result<Option<DirectoryEntry>, IndexError> {
        let sql = format!(
            "SELECT id, parent_id, name, modified, attributes, digest FROM {} WHERE id = ?1",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut conn.conn)
            .await?;
        row.map(|row| dir_from_row(&row)).transpose()
    }

    pub async fn directory_by_name(
        &self,
        parent_id: i64,
        name: &str,
    ) -> Result<Option<DirectoryEntry>, IndexError> {
        let sql = format!(
            "SELECT id, parent_id, name, modified, attributes, digest FROM {}
             WHERE parent_id = ?1 AND name = ?2",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(parent_id)
            .bind(name)
            .fetch_optional(&mut conn.conn)
            .await?;
        row.map(|row| dir_from_row(&row)).transpose()
    }

    pub async fn directory_children(&self, id: i64) -> Result<Vec<DirectoryEntry>, IndexError> {
        let sql = format!(
            "SELECT id, parent_id, name, modified, attributes, digest FROM {}
             WHERE parent_id = ?1 ORDER BY id",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut conn.conn)
            .await?;
        rows.iter().map(dir_from_row).collect()
    }

    /// `id` and all of its descendants, parents before children.
    pub async fn directory_subtree(&self, id: i64) -> Result<Vec<DirectoryEntry>, IndexError> {
        let sql = format!(
            "WITH RECURSIVE sub(id, depth) AS (
                SELECT ?1, 0
                UNION ALL
                SELECT d.id, sub.depth + 1 FROM {dirs} d JOIN sub ON d.parent_id = sub.id
                WHERE sub.depth < ?2
             )
             SELECT d.id, d.parent_id, d.name, d.modified, d.attributes, d.digest
             FROM {dirs} d JOIN sub ON d.id = sub.id
             ORDER BY sub.depth, d.id",
            dirs = self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(&sql)
            .bind(id)
            .bind(MAX_TREE_DEPTH as i64)
            .fetch_all(&mut conn.conn)
            .await?;
        rows.iter().map(dir_from_row).collect()
    }

    pub async fn directory_list_insert(
        &self,
        parent_id: i64,
        name: &str,
        modified: i64,
        attributes: &str,
    ) -> Result<DirectoryEntry, IndexError> {
        let sql = format!(
            "INSERT INTO {} (parent_id, name, modified, attributes, digest)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(&sql)
            .bind(parent_id)
            .bind(name)
            .bind(modified)
            .bind(attributes)
            .bind(&EMPTY_DIGEST[..])
            .execute(&mut conn.conn)
            .await?;
        Ok(DirectoryEntry {
            id: result.last_insert_rowid(),
            parent_id: Some(parent_id),
            name: name.to_string(),
            modified,
            attributes: attributes.to_string(),
            digest: EMPTY_DIGEST,
        })
    }

    /// Inserts a directory under an id chosen by the peer.
    pub async fn directory_list_insert_with_id(
        &self,
        entry: &DirectoryEntry,
    ) -> Result<(), IndexError> {
        let sql = format!(
            "INSERT INTO {} (id, parent_id, name, modified, attributes, digest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(entry.id)
            .bind(entry.parent_id)
            .bind(&entry.name)
            .bind(entry.modified)
            .bind(&entry.attributes)
            .bind(&entry.digest[..])
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    /// Rewrites name, parent, timestamp and attributes. The digest is left alone.
    pub async fn directory_list_update(&self, entry: &DirectoryEntry) -> Result<(), IndexError> {
        let sql = format!(
            "UPDATE {} SET parent_id = ?2, name = ?3, modified = ?4, attributes = ?5 WHERE id = ?1",
            self.tables.dirs
        );
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(entry.id)
            .bind(entry.parent_id)
            .bind(&entry.name)
            .bind(entry.modified)
            .bind(&entry.attributes)
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    pub async fn directory_list_touch(&self, id: i64, modified: i64) -> Result<(), IndexError> {
        let sql = format!("UPDATE {} SET modified = ?2 WHERE id = ?1", self.tables.dirs);
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(id)
            .bind(modified)
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    pub async fn set_digest(&self, id: i64, digest: &[u8; 16]) -> Result<(), IndexError> {
        let sql = format!("UPDATE {} SET digest = ?2 WHERE id = ?1", self.tables.dirs);
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(id)
            .bind(&digest[..])
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    /// Gives directory `old` the peer's identity `new`, moving children,
    /// files and queue references along with it.
    pub async fn directory_list_update_id(&self, old: i64, new: i64) -> Result<(), IndexError> {
        if old == ROOT_DIR_ID || new == ROOT_DIR_ID {
            return Err(IndexError::RootImmutable);
        }
        if old == new {
            return Ok(());
        }
        self.begin().await?;
        let result = self.renumber_directory(old, new).await;
        self.finish(result).await
    }

    async fn renumber_directory(&self, old: i64, new: i64) -> Result<(), IndexError> {
        let t = &self.tables;
        let statements = [
            format!("UPDATE {} SET id = ?2 WHERE id = ?1", t.dirs),
            format!("UPDATE {} SET parent_id = ?2 WHERE parent_id = ?1", t.dirs),
            format!("UPDATE {} SET dir_id = ?2 WHERE dir_id = ?1", t.files),
            format!("UPDATE {} SET dir_id = ?2 WHERE dir_id = ?1", t.queue),
        ];
        let mut conn = self.conn.lock().await;
        for sql in &statements {
            sqlx::query(sql)
                .bind(old)
                .bind(new)
                .execute(&mut conn.conn)
                .await?;
        }
        Ok(())
    }

    /// Inserts or refreshes a directory row by id, adopting `entry.id` when a
    /// row with the same parent and name exists under another id.
    pub async fn directory_list_upsert(&self, entry: &DirectoryEntry) -> Result<(), IndexError> {
        self.begin().await?;
        let result = self.upsert_directory_inner(entry).await;
        self.finish(result).await
    }

    async fn upsert_directory_inner(&self, entry: &DirectoryEntry) -> Result<(), IndexError> {
        let by_id = self.directory(entry.id).await?;
        if let Some(parent_id) = entry.parent_id
            && let Some(by_name) = self.directory_by_name(parent_id, &entry.name).await?
            && by_name.id != entry.id
        {
            if by_id.is_some() {
                self.directory_list_remove(by_name.id).await?;
            } else {
                self.directory_list_update_id(by_name.id, entry.id).await?;
                return self.directory_list_update(entry).await;
            }
        }
        if by_id.is_some() {
            self.directory_list_update(entry).await
        } else {
            self.directory_list_insert_with_id(entry).await
        }
    }

    /// Deletes a directory row together with every descendant directory and file row.
    pub async fn directory_list_remove(&self, id: i64) -> Result<(), IndexError> {
        if id == ROOT_DIR_ID {
            return Err(IndexError::RootImmutable);
        }
        let ids: Vec<i64> = self
            .directory_subtree(id)
            .await?
            .into_iter()
            .map(|dir| dir.id)
            .collect();
        self.begin().await?;
        let result = self.delete_directories(&ids).await;
        self.finish(result).await
    }

    async fn delete_directories(&self, ids: &[i64]) -> Result<(), IndexError> {
        let files = format!("DELETE FROM {} WHERE dir_id = ?1", self.tables.files);
        let dirs = format!("DELETE FROM {} WHERE id = ?1", self.tables.dirs);
        let mut conn = self.conn.lock().await;
        for id in ids.iter().rev() {
            sqlx::query(&files)
                .bind(*id)
                .execute(&mut conn.conn)
                .await?;
            sqlx::query(&dirs).bind(*id).execute(&mut conn.conn).await?;
        }
        Ok(())
    }

    /// Path of directory `id` relative to the sync root. The root maps to an empty path.
    pub async fn directory_path(&self, id: i64) -> Result<PathBuf, IndexError> {
        let mut names = Vec::new();
        let mut current = id;
        loop {
            if names.len() > MAX_TREE_DEPTH {
                return Err(IndexError::TreeTooDeep(id));
            }
            let dir = self
                .directory(current)
                .await?
                .ok_or(IndexError::MissingDirectory(current))?;
            match dir.parent_id {
                Some(parent) => {
                    names.push(dir.name);
                    current = parent;
                }
                None => break,
            }
        }
        Ok(names.iter().rev().collect())
    }

    pub async fn file(&self, id: i64) -> Result<Option<FileEntry>, IndexError> {
        let sql = format!(
            "SELECT id, dir_id, name, size, modified, attributes, crc32, md5, changed
             FROM {} WHERE id = ?1",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut conn.conn)
            .await?;
        row.map(|row| file_from_row(&row)).transpose()
    }

    pub async fn file_by_name(
        &self,
        dir_id: i64,
        name: &str,
    ) -> Result<Option<FileEntry>, IndexError> {
        let sql = format!(
            "SELECT id, dir_id, name, size, modified, attributes, crc32, md5, changed
             FROM {} WHERE dir_id = ?1 AND name = ?2",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(dir_id)
            .bind(name)
            .fetch_optional(&mut conn.conn)
            .await?;
        row.map(|row| file_from_row(&row)).transpose()
    }

    pub async fn file_children(&self, dir_id: i64) -> Result<Vec<FileEntry>, IndexError> {
        let sql = format!(
            "SELECT id, dir_id, name, size, modified, attributes, crc32, md5, changed
             FROM {} WHERE dir_id = ?1 ORDER BY id",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(&sql)
            .bind(dir_id)
            .fetch_all(&mut conn.conn)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn file_list_insert(&self, file: NewFile) -> Result<FileEntry, IndexError> {
        let sql = format!(
            "INSERT INTO {} (dir_id, name, size, modified, attributes, crc32, md5, changed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(&sql)
            .bind(file.dir_id)
            .bind(&file.name)
            .bind(size_to_sql(file.size))
            .bind(file.modified)
            .bind(&file.attributes)
            .bind(i64::from(file.crc32))
            .bind(&file.md5[..])
            .bind(file.changed)
            .execute(&mut conn.conn)
            .await?;
        Ok(file.with_id(result.last_insert_rowid()))
    }

    pub async fn file_list_insert_with_id(&self, file: &FileEntry) -> Result<(), IndexError> {
        let sql = format!(
            "INSERT INTO {} (id, dir_id, name, size, modified, attributes, crc32, md5, changed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(file.id)
            .bind(file.dir_id)
            .bind(&file.name)
            .bind(size_to_sql(file.size))
            .bind(file.modified)
            .bind(&file.attributes)
            .bind(i64::from(file.crc32))
            .bind(&file.md5[..])
            .bind(file.changed)
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    pub async fn file_list_update(&self, file: &FileEntry) -> Result<(), IndexError> {
        let sql = format!(
            "UPDATE {} SET dir_id = ?2, name = ?3, size = ?4, modified = ?5, attributes = ?6,
                crc32 = ?7, md5 = ?8, changed = ?9
             WHERE id = ?1",
            self.tables.files
        );
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql)
            .bind(file.id)
            .bind(file.dir_id)
            .bind(&file.name)
            .bind(size_to_sql(file.size))
            .bind(file.modified)
            .bind(&file.attributes)
            .bind(i64::from(file.crc32))
            .bind(&file.md5[..])
            .bind(file.changed)
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    pub async fn file_list_update_id(&self, old: i64, new: i64) -> Result<(), IndexError> {
        if old == new {
            return Ok(());
        }
        self.begin().await?;
        let result = self.renumber_file(old, new).await;
        self.finish(result).await
    }

    async fn renumber_file(&self, old: i64, new: i64) -> Result<(), IndexError> {
        let statements = [
            format!("UPDATE {} SET id = ?2 WHERE id = ?1", self.tables.files),
            format!("UPDATE {} SET file_id = ?2 WHERE file_id = ?1", self.tables.queue),
        ];
        let mut conn = self.conn.lock().await;
        for sql in &statements {
            sqlx::query(sql)
                .bind(old)
                .bind(new)
                .execute(&mut conn.conn)
                .await?;
        }
        Ok(())
    }

    /// Stores the peer's view of a file: refreshes the row with the same id,
    /// or adopts the id for a row with the same directory and name.
    pub async fn file_list_upsert(&self, file: &FileEntry) -> Result<(), IndexError> {
        self.begin().await?;
        let result = self.upsert_file_inner(file).await;
        self.finish(result).await
    }

    async fn upsert_file_inner(&self, file: &FileEntry) -> Result<(), IndexError> {
        let by_id = self.file(file.id).await?;
        if let Some(by_name) = self.file_by_name(file.dir_id, &file.name).await?
            && by_name.id != file.id
        {
            if by_id.is_some() {
                self.file_list_remove(by_name.id).await?;
            } else {
                self.file_list_update_id(by_name.id, file.id).await?;
                return self.file_list_update(file).await;
            }
        }
        if by_id.is_some() {
            self.file_list_update(file).await
        } else {
            self.file_list_insert_with_id(file).await
        }
    }

    pub async fn file_list_remove(&self, id: i64) -> Result<(), IndexError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.tables.files);
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql).bind(id).execute(&mut conn.conn).await?;
        Ok(())
    }
}

include!("index_queue.rs");

fn size_to_sql(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn blob16(row: &SqliteRow, column: &'static str, id: i64) -> Result<[u8; 16], IndexError> {
    let raw: Vec<u8> = row.try_get(column)?;
    raw.try_into()
        .map_err(|_| IndexError::Corrupt { column, id })
}

fn dir_from_row(row: &SqliteRow) -> Result<DirectoryEntry, IndexError> {
    let id: i64 = row.try_get("id")?;
    Ok(DirectoryEntry {
        id,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        modified: row.try_get("modified")?,
        attributes: row.try_get("attributes")?,
        digest: blob16(row, "digest", id)?,
    })
}

fn file_from_row(row: &SqliteRow) -> Result<FileEntry, IndexError> {
    let id: i64 = row.try_get("id")?;
    let size: i64 = row.try_get("size")?;
    let crc32: i64 = row.try_get("crc32")?;
    Ok(FileEntry {
        id,
        dir_id: row.try_get("dir_id")?,
        name: row.try_get("name")?,
        size: u64::try_from(size).map_err(|_| IndexError::Corrupt { column: "size", id })?,
        modified: row.try_get("modified")?,
        attributes: row.try_get("attributes")?,
        crc32: u32::try_from(crc32).map_err(|_| IndexError::Corrupt { column: "crc32", id })?,
        md5: blob16(row, "md5", id)?,
        changed: row.try_get("changed")?,
    })
}

impl From<&WireFile> for FileEntry {
    fn from(file: &WireFile) -> Self {
        Self {
            id: file.id,
            dir_id: file.dir_id,
            name: file.name.clone(),
            size: file.size,
            modified: file.modified,
            attributes: file.attributes.clone(),
            crc32: file.crc,
            md5: file.md5,
            changed: file.changed,
        }
    }
}

impl From<&FileEntry> for WireFile {
    fn from(file: &FileEntry) -> Self {
        Self {
            id: file.id,
            dir_id: file.dir_id,
            name: file.name.clone(),
            size: file.size,
            modified: file.modified,
            attributes: file.attributes.clone(),
            crc: file.crc32,
            md5: file.md5,
            changed: file.changed,
        }
    }
}

impl From<&WireDir> for DirectoryEntry {
    fn from(dir: &WireDir) -> Self {
        Self {
            id: dir.id,
            parent_id: dir.parent_id,
            name: dir.name.clone(),
            modified: dir.modified,
            attributes: dir.attributes.clone(),
            digest: dir.digest,
        }
    }
}

impl From<&DirectoryEntry> for WireDir {
    fn from(dir: &DirectoryEntry) -> Self {
        Self {
            id: dir.id,
            parent_id: dir.parent_id,
            name: dir.name.clone(),
            modified: dir.modified,
            attributes: dir.attributes.clone(),
            digest: dir.digest,
        }
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
