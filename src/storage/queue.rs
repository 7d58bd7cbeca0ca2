use super::schema::Database;
use super::types::{DatabaseError, DownloadState, QueueDbRow, QueuedEpisode};

const QUEUE_COLUMNS: &str = r#"
    e.id AS episode_id, q.position, e.title, e.data_url, e.file_location,
    e.download_state, e.downloaded_bytes, e.total_bytes
"#;

impl Database {
    // ========================================================================
    // Queue Membership
    // ========================================================================

    /// Append an episode to the download queue and record where its media
    /// will be written.
    ///
    /// Re-enqueueing keeps the existing position. Returns `true` when the
    /// episode was not queued before.
    pub async fn enqueue(&self, episode_id: i64, file_location: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE episodes SET file_location = ? WHERE id = ?")
            .bind(file_location)
            .bind(episode_id)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue (episode_id, position)
            SELECT ?, COALESCE(MAX(position), 0) + 1 FROM queue
            "#,
        )
        .bind(episode_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(inserted > 0)
    }

    /// Remove an episode from the queue. The media file is left alone.
    pub async fn dequeue(&self, episode_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM queue WHERE episode_id = ?")
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Queue entries in position order.
    pub async fn queued_episodes(&self) -> Result<Vec<QueuedEpisode>, DatabaseError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue q JOIN episodes e ON e.id = q.episode_id \
             ORDER BY q.position"
        );
        let rows: Vec<QueueDbRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(QueueDbRow::into_queued).collect())
    }

    /// Download bookkeeping for one episode, queued or not.
    pub async fn download_status(
        &self,
        episode_id: i64,
    ) -> Result<Option<QueuedEpisode>, DatabaseError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM episodes e LEFT JOIN queue q ON q.episode_id = e.id \
             WHERE e.id = ?"
        );
        let row: Option<QueueDbRow> = sqlx::query_as(&sql)
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(QueueDbRow::into_queued))
    }

    // ========================================================================
    // Download Bookkeeping
    // ========================================================================

    pub async fn set_download_state(
        &self,
        episode_id: i64,
        state: DownloadState,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE episodes SET download_state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_download_progress(
        &self,
        episode_id: i64,
        downloaded: i64,
        total: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE episodes SET downloaded_bytes = ?, total_bytes = ? WHERE id = ?")
            .bind(downloaded)
            .bind(total)
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a download finished with both counters at the final size, in
    /// one statement.
    pub async fn finish_download(&self, episode_id: i64, size: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE episodes SET download_state = ?, downloaded_bytes = ?, total_bytes = ? \
             WHERE id = ?",
        )
        .bind(DownloadState::Finished.as_str())
        .bind(size)
        .bind(size)
        .bind(episode_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Back to `none` with zeroed counters, in one statement.
    pub async fn reset_download(&self, episode_id: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE episodes SET download_state = ?, downloaded_bytes = 0, total_bytes = 0 \
             WHERE id = ?",
        )
        .bind(DownloadState::None.as_str())
        .bind(episode_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
