//! Archive repository: the one place UI code asks for content.
//!
//! Page and item monitors are shared per key. The first subscriber starts a
//! publisher that streams local store reads and triggers one background fetch
//! through the shared [`BackoffFetcher`]. The last subscriber to drop tears
//! the publisher down.
//!
//! Pages a feed merely turned off are remembered as fetched, so turning them
//! back on replays stored rows without another request. Evicting the page or
//! dropping a direct [`ArchiveRepository::monitor_query`] forgets that.

mod feed;
mod registry;

pub use feed::{Feed, FeedConfig};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::fetch::{BackoffFetcher, FetchKey, Fetched};
use crate::models::{ContentKind, Item, ItemDraft, ItemKey, Page, Query};
use crate::monitor::Monitor;
use crate::network::{ApiError, ArchiveApi};
use crate::store::{observe, LocalStore};
use crate::tiles::PageSource;
use registry::Registry;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

type FetchedPages = Arc<Mutex<HashSet<Query>>>;

#[derive(Clone)]
pub struct ArchiveRepository {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn ArchiveApi>,
    store: Arc<dyn LocalStore>,
    fetcher: BackoffFetcher,
    pages: Arc<Registry<Query, Page>>,
    items: Arc<Registry<ItemKey, Option<Item>>>,
    fetched: FetchedPages,
    cancel_token: CancellationToken,
}

impl ArchiveRepository {
    pub fn new(
        api: Arc<dyn ArchiveApi>,
        store: Arc<dyn LocalStore>,
        fetcher: BackoffFetcher,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                fetcher,
                pages: Registry::new(cancel_token.clone()),
                items: Registry::new(cancel_token.clone()),
                fetched: Arc::new(Mutex::new(HashSet::new())),
                cancel_token,
            }),
        }
    }

    /// Live page for `query`. Starts at [`Page::Loading`] and switches to
    /// [`Page::Loaded`] as soon as local rows exist or the fetch finished.
    /// Once the monitor drops, the next subscription fetches again.
    pub fn monitor_query(&self, query: Query) -> Monitor<Page> {
        let fetched = self.inner.fetched.clone();
        let key = query.clone();
        self.subscribe_page(query)
            .and_on_release(move || forget(&fetched, &key))
    }

    fn subscribe_page(&self, query: Query) -> Monitor<Page> {
        let inner = &self.inner;
        inner
            .pages
            .subscribe(query.clone(), Page::Loading, |tx, cancel| {
                tokio::spawn(publish_page(
                    inner.store.clone(),
                    inner.fetcher.clone(),
                    inner.fetched.clone(),
                    query,
                    tx,
                    cancel,
                ));
            })
    }

    /// Live view of one item. Not-found states are skipped by
    /// [`ItemMonitor::next`].
    pub fn monitor_item(&self, kind: ContentKind, id: impl Into<String>) -> ItemMonitor {
        let id = id.into();
        let inner = &self.inner;
        let monitor = inner
            .items
            .subscribe((kind, id.clone()), None, |tx, cancel| {
                tokio::spawn(publish_item(
                    inner.store.clone(),
                    inner.fetcher.clone(),
                    kind,
                    id,
                    tx,
                    cancel,
                ));
            });
        ItemMonitor {
            monitor,
            primed: false,
        }
    }

    /// Create (`id == None`) or update an item on the server and mirror the
    /// stored result locally. Never retried.
    pub async fn upsert(
        &self,
        kind: ContentKind,
        id: Option<&str>,
        draft: &ItemDraft,
    ) -> Result<String, ArchiveError> {
        let id = self.inner.api.upsert_item(kind, id, draft).await?;

        match self.inner.api.fetch_item(kind, &id).await {
            Ok(item) => self.inner.fetcher.save(vec![item]).await?,
            Err(err) => log_warn!("saved {kind}/{id} but could not refresh it: {err}"),
        }

        // Page membership may have shifted; let the next open refetch.
        lock(&self.inner.fetched).retain(|query| query.kind != kind);

        Ok(id)
    }

    /// Open a feed scoped to a child of the repository's cancellation scope.
    pub fn open_feed(&self, config: FeedConfig) -> Feed {
        Feed::open(
            Arc::new(self.clone()),
            config,
            self.inner.cancel_token.child_token(),
        )
    }

    pub fn active_page_monitors(&self) -> usize {
        self.inner.pages.active()
    }
}

impl PageSource for ArchiveRepository {
    fn open(&self, query: &Query) -> Monitor<Page> {
        self.subscribe_page(query.clone())
    }

    fn evict(&self, query: &Query) {
        forget(&self.inner.fetched, query);
    }
}

/// Item stream that only yields found items.
pub struct ItemMonitor {
    monitor: Monitor<Option<Item>>,
    primed: bool,
}

impl ItemMonitor {
    pub fn current(&self) -> Option<Item> {
        self.monitor.current()
    }

    /// Next found value of the item. `None` once the repository shut down.
    pub async fn next(&mut self) -> Option<Item> {
        let rx = self.monitor.receiver();
        if !self.primed {
            self.primed = true;
            if let Some(item) = rx.borrow_and_update().clone() {
                return Some(item);
            }
        }
        loop {
            rx.changed().await.ok()?;
            if let Some(item) = rx.borrow_and_update().clone() {
                return Some(item);
            }
        }
    }
}

fn lock(fetched: &Mutex<HashSet<Query>>) -> MutexGuard<'_, HashSet<Query>> {
    match fetched.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn forget(fetched: &Mutex<HashSet<Query>>, query: &Query) {
    lock(fetched).remove(query);
}

/// Fetch `key` into the store. Results reach subscribers through the store.
/// Returns whether the server answered.
async fn refresh(fetcher: &BackoffFetcher, key: FetchKey, cancel: &CancellationToken) -> bool {
    match fetcher.fetch(key.clone(), cancel).await {
        Some(Fetched::Fresh(items)) => {
            log_debug!("{key} refreshed with {} items", items.len());
            true
        }
        Some(Fetched::GaveUp) => {
            log_debug!("{key} unavailable; serving stored rows");
            false
        }
        None => false,
    }
}

/// Fetch a page unless it is known to be fetched already.
async fn refresh_page(
    fetcher: &BackoffFetcher,
    fetched: &Mutex<HashSet<Query>>,
    query: Query,
    cancel: &CancellationToken,
) {
    if lock(fetched).contains(&query) {
        log_debug!("page {query} already fetched; serving stored rows");
        return;
    }
    if refresh(fetcher, FetchKey::Page(query.clone()), cancel).await && !cancel.is_cancelled() {
        lock(fetched).insert(query);
    }
}

async fn publish_page(
    store: Arc<dyn LocalStore>,
    fetcher: BackoffFetcher,
    fetched: FetchedPages,
    query: Query,
    tx: watch::Sender<Page>,
    cancel: CancellationToken,
) {
    let mut changes = store.changes();
    changes.borrow_and_update();

    let fetch = refresh_page(&fetcher, &fetched, query.clone(), &cancel);
    tokio::pin!(fetch);
    let mut fetch_done = false;

    loop {
        match store.read_page(&query).await {
            Ok(items) => {
                let page = if items.is_empty() && !fetch_done {
                    Page::Loading
                } else {
                    Page::Loaded(items)
                };
                tx.send_if_modified(|current| {
                    if *current == page {
                        false
                    } else {
                        *current = page;
                        true
                    }
                });
            }
            Err(err) => log_warn!("failed to read {query}: {err:#}"),
        }

        tokio::select! {
            _ = &mut fetch, if !fetch_done => fetch_done = true,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn publish_item(
    store: Arc<dyn LocalStore>,
    fetcher: BackoffFetcher,
    kind: ContentKind,
    id: String,
    tx: watch::Sender<Option<Item>>,
    cancel: CancellationToken,
) {
    let key = FetchKey::Item {
        kind,
        id: id.clone(),
    };
    let local = observe(store, tx, cancel.clone(), move |store| {
        let id = id.clone();
        async move { store.read_one(kind, &id).await }
    });
    tokio::join!(local, refresh(&fetcher, key, &cancel));
}
