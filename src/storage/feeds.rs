use super::schema::Database;
use super::types::{DatabaseError, FeedDbRow, StoredFeed};
use crate::feed::Feed;

const FEED_COLUMNS: &str = r#"
    f.id, f.url, f.title, f.description, f.image_url, f.encoding,
    f.last_updated, f.etag,
    COUNT(e.id) AS episode_count,
    COUNT(CASE WHEN e.is_new = 1 THEN 1 END) AS new_count
"#;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Look up a feed's id by its URL.
    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<i64>, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Insert a feed row from a parsed feed. Episodes are not inserted.
    ///
    /// Fails with a unique-constraint error if the URL is already present.
    pub async fn create_feed(&self, feed: &Feed) -> Result<i64, DatabaseError> {
        let id = sqlx::query(
            r#"
            INSERT INTO feeds (url, title, description, image_url, encoding, last_updated, etag)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&feed.feed_url)
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(&feed.image_url)
        .bind(&feed.encoding)
        .bind(feed.last_updated)
        .bind(&feed.etag)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Overwrite the stored cache validator of a feed.
    pub async fn set_feed_etag(&self, feed_id: i64, etag: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET etag = ? WHERE id = ?")
            .bind(etag)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All feeds in subscription order, with episode and new-episode counts.
    pub async fn get_feeds(&self) -> Result<Vec<StoredFeed>, DatabaseError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f LEFT JOIN episodes e ON f.id = e.feed_id \
             GROUP BY f.id ORDER BY f.id"
        );
        let rows: Vec<FeedDbRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// A single feed with counts.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<StoredFeed>, DatabaseError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f LEFT JOIN episodes e ON f.id = e.feed_id \
             WHERE f.id = ? GROUP BY f.id"
        );
        let row: Option<FeedDbRow> = sqlx::query_as(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Clear the "new" flag on every episode of a feed.
    ///
    /// Returns the number of episodes that were new.
    pub async fn mark_feed_seen(&self, feed_id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE episodes SET is_new = 0 WHERE feed_id = ? AND is_new = 1")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a feed. Episodes and their queue entries cascade.
    ///
    /// Returns `false` if no feed had that id.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
