#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use folio_lib::connectivity::ConnectivityMonitor;
use folio_lib::db::Database;
use folio_lib::fetch::{BackoffConfig, BackoffFetcher};
use folio_lib::models::{ChangeListItem, ContentKind, Item, ItemDraft, Query};
use folio_lib::network::{ApiError, ArchiveApi};
use folio_lib::repository::ArchiveRepository;
use folio_lib::store::LocalStore;

/// Item `n` of a kind; lower numbers are newer.
pub fn numbered(kind: ContentKind, n: u32) -> Item {
    let newest = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    Item {
        id: format!("{}-{n:03}", kind.as_str()),
        kind,
        title: format!("{kind} #{n}"),
        summary: None,
        tags: Vec::new(),
        categories: Vec::new(),
        body: serde_json::json!({ "n": n }),
        published_at: newest - chrono::Duration::hours(i64::from(n)),
        updated_at: newest,
    }
}

/// Server with a fixed catalogue of `total` items per kind, a change list per
/// collection, and scripted failures per page offset.
pub struct ScriptedArchive {
    pub total: u32,
    pub page_failures: Mutex<HashMap<u32, u32>>,
    pub page_calls: AtomicU32,
    pub change_lists: Mutex<HashMap<String, Vec<ChangeListItem>>>,
}

impl ScriptedArchive {
    pub fn new(total: u32) -> Arc<Self> {
        Arc::new(Self {
            total,
            page_failures: Mutex::new(HashMap::new()),
            page_calls: AtomicU32::new(0),
            change_lists: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_page(&self, offset: u32, times: u32) {
        self.page_failures.lock().unwrap().insert(offset, times);
    }
}

#[async_trait]
impl ArchiveApi for ScriptedArchive {
    async fn fetch_page(&self, query: &Query) -> Result<Vec<Item>, ApiError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.page_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&query.offset) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ApiError::Status {
                        status: 503,
                        code: "unavailable".into(),
                        message: "try again".into(),
                    });
                }
            }
        }
        let end = (query.offset + query.limit).min(self.total);
        Ok((query.offset..end)
            .map(|n| numbered(query.kind, n))
            .collect())
    }

    async fn fetch_item(&self, kind: ContentKind, id: &str) -> Result<Item, ApiError> {
        let n = id
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ApiError::Status {
                status: 404,
                code: "not_found".into(),
                message: id.to_string(),
            })?;
        Ok(numbered(kind, n))
    }

    async fn upsert_item(
        &self,
        kind: ContentKind,
        id: Option<&str>,
        _: &ItemDraft,
    ) -> Result<String, ApiError> {
        Ok(id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{:03}", kind.as_str(), self.total)))
    }

    async fn fetch_change_list(
        &self,
        collection: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChangeListItem>, ApiError> {
        let lists = self.change_lists.lock().unwrap();
        let changes = lists.get(collection).cloned().unwrap_or_default();
        let start = match after {
            Some(after) => changes
                .iter()
                .position(|change| change.id == after)
                .map_or(0, |index| index + 1),
            None => 0,
        };
        Ok(changes[start..].to_vec())
    }
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        factor: 2.0,
        times: Some(5),
    }
}

pub struct Harness {
    pub api: Arc<ScriptedArchive>,
    pub db: Database,
    pub connectivity: ConnectivityMonitor,
    pub repository: ArchiveRepository,
    pub cancel: CancellationToken,
}

pub fn harness(api: Arc<ScriptedArchive>, db: Database, reachable: bool) -> Harness {
    let store: Arc<dyn LocalStore> = Arc::new(db.clone());
    let connectivity = ConnectivityMonitor::new(reachable);
    let cancel = CancellationToken::new();
    let (fetcher, _handle) = BackoffFetcher::spawn(
        api.clone(),
        store.clone(),
        connectivity.clone(),
        fast_backoff(),
        cancel.clone(),
    );
    let repository = ArchiveRepository::new(api.clone(), store, fetcher, cancel.clone());
    Harness {
        api,
        db,
        connectivity,
        repository,
        cancel,
    }
}
