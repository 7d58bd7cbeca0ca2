use super::schema::Database;
use super::types::{DatabaseError, EpisodeDbRow, StoredEpisode};
use crate::feed::Episode;

const EPISODE_COLUMNS: &str = r#"
    id, feed_id, guid, title, description, content, data_url, image_url,
    payment_url, is_new, download_state, downloaded_bytes, total_bytes,
    file_location
"#;

impl Database {
    // ========================================================================
    // Episode Operations
    // ========================================================================

    /// Insert an episode under a feed. New rows start not-new with no download.
    pub async fn create_episode(
        &self,
        feed_id: i64,
        episode: &Episode,
    ) -> Result<i64, DatabaseError> {
        let id = sqlx::query(
            r#"
            INSERT INTO episodes
                (feed_id, guid, title, description, content, data_url, image_url, payment_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(feed_id)
        .bind(&episode.guid)
        .bind(&episode.title)
        .bind(&episode.description)
        .bind(&episode.content)
        .bind(&episode.data_url)
        .bind(&episode.image_url)
        .bind(&episode.payment_url)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Ids of every episode carrying this GUID, across all feeds.
    pub async fn find_episodes_by_guid(&self, guid: &str) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM episodes WHERE guid = ? ORDER BY id")
            .bind(guid)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// URL of the feed that owns an episode.
    pub async fn episode_feed_url(&self, episode_id: i64) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT f.url FROM episodes e JOIN feeds f ON f.id = e.feed_id WHERE e.id = ?",
        )
        .bind(episode_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(url,)| url))
    }

    pub async fn set_episode_new(&self, episode_id: i64, is_new: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE episodes SET is_new = ? WHERE id = ?")
            .bind(is_new)
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Episodes of a feed in insertion order (oldest first).
    pub async fn get_episodes_for_feed(
        &self,
        feed_id: i64,
    ) -> Result<Vec<StoredEpisode>, DatabaseError> {
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE feed_id = ? ORDER BY id");
        let rows: Vec<EpisodeDbRow> = sqlx::query_as(&sql)
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(EpisodeDbRow::into_episode).collect())
    }

    pub async fn get_episode(&self, episode_id: i64) -> Result<Option<StoredEpisode>, DatabaseError> {
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?");
        let row: Option<EpisodeDbRow> = sqlx::query_as(&sql)
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EpisodeDbRow::into_episode))
    }
}
