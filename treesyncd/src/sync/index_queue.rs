impl InventoryStore {
    /// Adds a work item unless an identical one is already queued, returning
    /// the id of the stored item either way. Items whose target directory is
    /// not known yet (`dir_id == 0`) are only identical when they wait on the
    /// same predecessor.
    pub async fn enqueue(&self, item: NewQueueItem) -> Result<i64, IndexError> {
        let find = format!(
            "SELECT id FROM {} WHERE action = ?1 AND dir_id = ?2 AND file_id = ?3 AND name = ?4
                AND (dir_id != 0 OR depends_on IS ?5)
             ORDER BY id LIMIT 1",
            self.tables.queue
        );
        let insert = format!(
            "INSERT INTO {} (depends_on, action, file_id, dir_id, name, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            self.tables.queue
        );
        let mut conn = self.conn.lock().await;
        let existing = sqlx::query(&find)
            .bind(item.action.as_i64())
            .bind(item.dir_id)
            .bind(item.file_id)
            .bind(&item.name)
            .bind(item.depends_on)
            .fetch_optional(&mut conn.conn)
            .await?;
        if let Some(row) = existing {
            return Ok(row.try_get("id")?);
        }
        let result = sqlx::query(&insert)
            .bind(item.depends_on)
            .bind(item.action.as_i64())
            .bind(item.file_id)
            .bind(item.dir_id)
            .bind(&item.name)
            .execute(&mut conn.conn)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest item that is neither parked nor waiting on another item.
    pub async fn next_eligible(&self) -> Result<Option<QueueItem>, IndexError> {
        let sql = format!(
            "SELECT id, depends_on, action, file_id, dir_id, name, attempts FROM {}
             WHERE attempts < ?1 AND depends_on IS NULL
             ORDER BY id LIMIT 1",
            self.tables.queue
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(MAX_ATTEMPTS)
            .fetch_optional(&mut conn.conn)
            .await?;
        row.map(|row| queue_from_row(&row)).transpose()
    }

    /// True while any item is below the attempt cap. Parked items do not count.
    pub async fn queue_has_items(&self) -> Result<bool, IndexError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE attempts < ?1) AS pending",
            self.tables.queue
        );
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql)
            .bind(MAX_ATTEMPTS)
            .fetch_one(&mut conn.conn)
            .await?;
        let pending: i64 = row.try_get("pending")?;
        Ok(pending != 0)
    }

    pub async fn queue_len(&self) -> Result<i64, IndexError> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", self.tables.queue);
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(&sql).fetch_one(&mut conn.conn).await?;
        Ok(row.try_get("total")?)
    }

    pub async fn queue_items(&self) -> Result<Vec<QueueItem>, IndexError> {
        let sql = format!(
            "SELECT id, depends_on, action, file_id, dir_id, name, attempts FROM {} ORDER BY id",
            self.tables.queue
        );
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(&sql).fetch_all(&mut conn.conn).await?;
        rows.iter().map(queue_from_row).collect()
    }

    pub async fn reset_attempts(&self) -> Result<(), IndexError> {
        let sql = format!("UPDATE {} SET attempts = 0", self.tables.queue);
        let mut conn = self.conn.lock().await;
        sqlx::query(&sql).execute(&mut conn.conn).await?;
        Ok(())
    }

    pub async fn increment_attempts(&self, id: i64) -> Result<i64, IndexError> {
        let update = format!(
            "UPDATE {} SET attempts = attempts + 1 WHERE id = ?1",
            self.tables.queue
        );
        let select = format!("SELECT attempts FROM {} WHERE id = ?1", self.tables.queue);
        let mut conn = self.conn.lock().await;
        sqlx::query(&update)
            .bind(id)
            .execute(&mut conn.conn)
            .await?;
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut conn.conn)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("attempts")?),
            None => Ok(0),
        }
    }

    /// Completes `item`. Dependents of a directory-creating item that still
    /// carry the unknown-id sentinel receive `created_id`; every dependent is
    /// released; the item row is deleted.
    pub async fn finalize(
        &self,
        item: &QueueItem,
        created_id: Option<i64>,
    ) -> Result<(), IndexError> {
        self.begin().await?;
        let result = self.finalize_inner(item, created_id).await;
        self.finish(result).await
    }

    async fn finalize_inner(
        &self,
        item: &QueueItem,
        created_id: Option<i64>,
    ) -> Result<(), IndexError> {
        let queue = &self.tables.queue;
        let adopt = format!(
            "UPDATE {queue} SET dir_id = ?2 WHERE depends_on = ?1 AND dir_id = 0"
        );
        let release = format!("UPDATE {queue} SET depends_on = NULL WHERE depends_on = ?1");
        let delete = format!("DELETE FROM {queue} WHERE id = ?1");

        let mut conn = self.conn.lock().await;
        if item.action.creates_directory()
            && let Some(created) = created_id
        {
            sqlx::query(&adopt)
                .bind(item.id)
                .bind(created)
                .execute(&mut conn.conn)
                .await?;
        }
        sqlx::query(&release)
            .bind(item.id)
            .execute(&mut conn.conn)
            .await?;
        sqlx::query(&delete)
            .bind(item.id)
            .execute(&mut conn.conn)
            .await?;
        Ok(())
    }

    /// Drops `item` and everything that transitively waits on it.
    pub async fn abandon(&self, item: &QueueItem) -> Result<u64, IndexError> {
        let sql = format!(
            "WITH RECURSIVE doomed(id) AS (
                SELECT ?1
                UNION
                SELECT q.id FROM {queue} q JOIN doomed ON q.depends_on = doomed.id
             )
             DELETE FROM {queue} WHERE id IN (SELECT id FROM doomed)",
            queue = self.tables.queue
        );
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(&sql)
            .bind(item.id)
            .execute(&mut conn.conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn history_append(&self, record: &HistoryRecord) -> Result<i64, IndexError> {
        let sql = format!(
            "INSERT INTO {} (action, path, name, size, modified, attributes, md5, crc32, recorded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            self.tables.history
        );
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(&sql)
            .bind(record.action.as_i64())
            .bind(&record.path)
            .bind(&record.name)
            .bind(size_to_sql(record.size))
            .bind(record.modified)
            .bind(&record.attributes)
            .bind(&record.md5[..])
            .bind(i64::from(record.crc32))
            .bind(record.recorded)
            .execute(&mut conn.conn)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn history_records(&self) -> Result<Vec<HistoryRecord>, IndexError> {
        let sql = format!(
            "SELECT id, action, path, name, size, modified, attributes, md5, crc32, recorded
             FROM {} ORDER BY id",
            self.tables.history
        );
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(&sql).fetch_all(&mut conn.conn).await?;
        rows.iter().map(history_from_row).collect()
    }
}

fn queue_from_row(row: &SqliteRow) -> Result<QueueItem, IndexError> {
    let action: i64 = row.try_get("action")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        depends_on: row.try_get("depends_on")?,
        action: ActionType::parse(action)?,
        file_id: row.try_get("file_id")?,
        dir_id: row.try_get("dir_id")?,
        name: row.try_get("name")?,
        attempts: row.try_get("attempts")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryRecord, IndexError> {
    let id: i64 = row.try_get("id")?;
    let action: i64 = row.try_get("action")?;
    let size: i64 = row.try_get("size")?;
    let crc32: i64 = row.try_get("crc32")?;
    Ok(HistoryRecord {
        id,
        action: HistoryAction::parse(action)?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        size: u64::try_from(size).map_err(|_| IndexError::Corrupt { column: "size", id })?,
        modified: row.try_get("modified")?,
        attributes: row.try_get("attributes")?,
        md5: blob16(row, "md5", id)?,
        crc32: u32::try_from(crc32).map_err(|_| IndexError::Corrupt { column: "crc32", id })?,
        recorded: row.try_get("recorded")?,
    })
}
