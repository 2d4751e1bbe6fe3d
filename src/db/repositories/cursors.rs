use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;

impl Database {
    pub async fn get_sync_cursor(&self, collection_key: &str) -> Result<Option<String>> {
        let collection_key = collection_key.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT last_id FROM sync_cursors WHERE collection_key = ?1",
                params![collection_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read sync cursor")
        })
        .await
    }

    pub async fn set_sync_cursor(&self, collection_key: &str, last_id: &str) -> Result<()> {
        let collection_key = collection_key.to_string();
        let last_id = last_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sync_cursors (collection_key, last_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (collection_key) DO UPDATE SET
                     last_id = excluded.last_id,
                     updated_at = excluded.updated_at",
                params![collection_key, last_id, Utc::now().to_rfc3339()],
            )
            .context("failed to persist sync cursor")?;
            Ok(())
        })
        .await
    }
}
