//! Local storage capability consumed by the fetch, repository and sync layers.
//!
//! The store is the single source of truth: network results are written here
//! first and readers only ever observe what the store returns.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::{ContentKind, Item, Query};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    async fn read_page(&self, query: &Query) -> Result<Vec<Item>>;
    async fn read_one(&self, kind: ContentKind, id: &str) -> Result<Option<Item>>;
    async fn upsert(&self, items: Vec<Item>) -> Result<()>;
    async fn delete(&self, kind: ContentKind, ids: Vec<String>) -> Result<()>;
    async fn get_cursor(&self, key: &str) -> Result<Option<String>>;
    async fn set_cursor(&self, key: &str, id: &str) -> Result<()>;

    /// Receiver that changes after every committed write.
    fn changes(&self) -> watch::Receiver<u64>;
}

#[async_trait]
impl LocalStore for Database {
    async fn read_page(&self, query: &Query) -> Result<Vec<Item>> {
        self.query_items(query).await
    }

    async fn read_one(&self, kind: ContentKind, id: &str) -> Result<Option<Item>> {
        self.get_item(kind, id).await
    }

    async fn upsert(&self, items: Vec<Item>) -> Result<()> {
        self.upsert_items(items).await
    }

    async fn delete(&self, kind: ContentKind, ids: Vec<String>) -> Result<()> {
        self.delete_items(kind, ids).await.map(|_| ())
    }

    async fn get_cursor(&self, key: &str) -> Result<Option<String>> {
        self.get_sync_cursor(key).await
    }

    async fn set_cursor(&self, key: &str, id: &str) -> Result<()> {
        self.set_sync_cursor(key, id).await
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.subscribe_changes()
    }
}

/// Re-run `read` after every store change and publish distinct results into
/// `sink` until `cancel` fires or every receiver of `sink` is gone.
///
/// Read failures are logged and skipped; the previous value stays published.
pub async fn observe<T, F, Fut>(
    store: Arc<dyn LocalStore>,
    sink: watch::Sender<T>,
    cancel: CancellationToken,
    mut read: F,
) where
    T: PartialEq + Send + Sync + 'static,
    F: FnMut(Arc<dyn LocalStore>) -> Fut + Send,
    Fut: std::future::Future<Output = Result<T>> + Send,
{
    let mut changes = store.changes();
    changes.borrow_and_update();

    loop {
        match read(store.clone()).await {
            Ok(value) => {
                sink.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
            }
            Err(err) => log_warn!("local read failed: {err:#}"),
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sink.closed() => break,
            _ = cancel.cancelled() => break,
        }
    }
}
