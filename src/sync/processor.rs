use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::{ChangeListItem, ContentKind, Item};
use crate::network::ArchiveApi;
use crate::store::LocalStore;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Applies one chunk of a collection's change list to local storage.
///
/// An `Err` stops the run before the cursor moves past this chunk, so the
/// chunk is replayed next time. Implementations must tolerate replays.
#[async_trait]
pub trait ChunkProcessor: Send + Sync + 'static {
    async fn process(&self, collection: &str, chunk: &[ChangeListItem]) -> Result<()>;
}

/// Chunk processor for one archive content kind: deletions are applied
/// locally, upserts are refetched in full and saved. A record the server no
/// longer has is deleted locally.
pub struct ArchiveChunkProcessor {
    kind: ContentKind,
    api: Arc<dyn ArchiveApi>,
    store: Arc<dyn LocalStore>,
}

impl ArchiveChunkProcessor {
    pub fn new(kind: ContentKind, api: Arc<dyn ArchiveApi>, store: Arc<dyn LocalStore>) -> Self {
        Self { kind, api, store }
    }

    /// Fetch `ids` one at a time, deleting the ones that are gone.
    async fn fetch_present(&self, collection: &str, ids: &[String]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(ids.len());
        let mut gone = Vec::new();
        for id in ids {
            match self.api.fetch_item(self.kind, id).await {
                Ok(item) => items.push(item),
                Err(err) if err.is_not_found() => gone.push(id.clone()),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to fetch changed {collection}"))
                }
            }
        }

        if !gone.is_empty() {
            log_info!("{collection}: {} changed records are gone; deleting", gone.len());
            self.store
                .delete(self.kind, gone)
                .await
                .with_context(|| format!("failed to drop vanished {collection}"))?;
        }
        Ok(items)
    }
}

#[async_trait]
impl ChunkProcessor for ArchiveChunkProcessor {
    async fn process(&self, collection: &str, chunk: &[ChangeListItem]) -> Result<()> {
        // Only the last change per record matters within a chunk.
        let mut latest: Vec<&ChangeListItem> = Vec::with_capacity(chunk.len());
        for change in chunk {
            latest.retain(|seen| seen.model_id != change.model_id);
            latest.push(change);
        }
        let (deleted, upserted): (Vec<&ChangeListItem>, Vec<&ChangeListItem>) =
            latest.into_iter().partition(|change| change.deleted);

        if !deleted.is_empty() {
            let ids = deleted.iter().map(|change| change.model_id.clone()).collect();
            self.store
                .delete(self.kind, ids)
                .await
                .with_context(|| format!("failed to apply deletions for {collection}"))?;
        }

        if !upserted.is_empty() {
            let ids: Vec<String> = upserted
                .iter()
                .map(|change| change.model_id.clone())
                .collect();
            let items = match self.api.fetch_items(self.kind, &ids).await {
                Ok(items) => items,
                Err(err) if err.is_not_found() => self.fetch_present(collection, &ids).await?,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to fetch changed {collection}"))
                }
            };
            self.store
                .upsert(items)
                .await
                .with_context(|| format!("failed to save changed {collection}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;
    use crate::models::{ItemDraft, Query};
    use crate::network::ApiError;

    struct PartlyGone;

    fn article(id: &str) -> Item {
        Item {
            id: id.to_string(),
            kind: ContentKind::Articles,
            title: id.to_string(),
            summary: None,
            tags: Vec::new(),
            categories: Vec::new(),
            body: serde_json::Value::Null,
            published_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[async_trait]
    impl ArchiveApi for PartlyGone {
        async fn fetch_page(&self, _: &Query) -> Result<Vec<Item>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_item(&self, _: ContentKind, id: &str) -> Result<Item, ApiError> {
            if id == "gone" {
                return Err(ApiError::Status {
                    status: 404,
                    code: "not_found".into(),
                    message: String::new(),
                });
            }
            Ok(article(id))
        }

        async fn upsert_item(
            &self,
            _: ContentKind,
            _: Option<&str>,
            _: &ItemDraft,
        ) -> Result<String, ApiError> {
            Err(ApiError::Unauthorized)
        }

        async fn fetch_change_list(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<Vec<ChangeListItem>, ApiError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn vanished_records_are_deleted_instead_of_failing_the_chunk() {
        let db = Database::in_memory().unwrap();
        db.upsert_items(vec![article("gone")]).await.unwrap();
        let processor = ArchiveChunkProcessor::new(
            ContentKind::Articles,
            Arc::new(PartlyGone),
            Arc::new(db.clone()),
        );

        let chunk = vec![
            ChangeListItem::upsert("1", "a"),
            ChangeListItem::upsert("2", "gone"),
            ChangeListItem::upsert("3", "b"),
        ];
        processor.process("articles", &chunk).await.unwrap();

        let mut ids: Vec<String> = db
            .query_items(&Query::new(ContentKind::Articles))
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
