use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::backoff::{exponential_backoff, BackoffConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::models::{ContentKind, Item, Query};
use crate::network::ArchiveApi;
use crate::store::LocalStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const REQUEST_QUEUE_DEPTH: usize = 64;

/// What a fetch request asks the server for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchKey {
    Page(Query),
    Item { kind: ContentKind, id: String },
}

impl std::fmt::Display for FetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchKey::Page(query) => write!(f, "page {query}"),
            FetchKey::Item { kind, id } => write!(f, "item {kind}/{id}"),
        }
    }
}

/// How a fetch that ran to completion ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// Server data, already saved locally.
    Fresh(Vec<Item>),
    /// Retries ran out; nothing was saved.
    GaveUp,
}

struct FetchRequest {
    key: FetchKey,
    reply: oneshot::Sender<Fetched>,
    cancel: CancellationToken,
}

/// Shared network fetch pipeline.
///
/// All requests flow through one queue into a single worker loop, which runs
/// each of them under [`exponential_backoff`], parked while the network is
/// unreachable. Results are written to the local store before they are handed
/// back, so anyone reading the store after `fetch` returns sees fresh data.
#[derive(Clone)]
pub struct BackoffFetcher {
    requests: mpsc::Sender<FetchRequest>,
    store: Arc<dyn LocalStore>,
}

struct FetchWorker {
    api: Arc<dyn ArchiveApi>,
    store: Arc<dyn LocalStore>,
    connectivity: ConnectivityMonitor,
    config: BackoffConfig,
}

impl BackoffFetcher {
    pub fn spawn(
        api: Arc<dyn ArchiveApi>,
        store: Arc<dyn LocalStore>,
        connectivity: ConnectivityMonitor,
        config: BackoffConfig,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (requests, inbox) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let worker = Arc::new(FetchWorker {
            api,
            store: store.clone(),
            connectivity,
            config,
        });
        let handle = tokio::spawn(fetch_loop(inbox, worker, cancel_token));

        (Self { requests, store }, handle)
    }

    /// Fetch `key`, persist the result and return it.
    ///
    /// Yields [`Fetched::GaveUp`] once retries are exhausted, and `None` if
    /// `cancel` fires or the pipeline has shut down.
    pub async fn fetch(&self, key: FetchKey, cancel: &CancellationToken) -> Option<Fetched> {
        let (reply, response) = oneshot::channel();
        let request_cancel = cancel.child_token();
        // Abandoning this future also abandons the network work behind it.
        let _abandon = request_cancel.clone().drop_guard();
        let request = FetchRequest {
            key,
            reply,
            cancel: request_cancel,
        };

        if self.requests.send(request).await.is_err() {
            log_debug!("fetch pipeline closed; dropping request");
            return None;
        }

        tokio::select! {
            fetched = response => fetched.ok(),
            _ = cancel.cancelled() => None,
        }
    }

    /// Write items to the local store through the same path fetch results take.
    pub async fn save(&self, items: Vec<Item>) -> anyhow::Result<()> {
        save_items(self.store.as_ref(), items).await
    }
}

async fn save_items(store: &dyn LocalStore, items: Vec<Item>) -> anyhow::Result<()> {
    let count = items.len();
    store
        .upsert(items)
        .await
        .with_context(|| format!("failed to save {count} items"))
}

async fn fetch_loop(
    mut inbox: mpsc::Receiver<FetchRequest>,
    worker: Arc<FetchWorker>,
    cancel_token: CancellationToken,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            request = inbox.recv() => {
                let Some(request) = request else {
                    break;
                };
                in_flight.spawn(worker.clone().serve(request));
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = cancel_token.cancelled() => {
                break;
            }
        }
    }

    in_flight.shutdown().await;
    log_info!("fetch loop shutting down");
}

impl FetchWorker {
    async fn serve(self: Arc<Self>, request: FetchRequest) {
        let FetchRequest { key, reply, cancel } = request;
        tokio::select! {
            fetched = self.fetch_and_save(&key, &cancel) => {
                if reply.send(fetched).is_err() {
                    log_debug!("requester for {key} went away before delivery");
                }
            }
            _ = cancel.cancelled() => {
                log_debug!("fetch for {key} cancelled");
            }
        }
    }

    async fn fetch_and_save(&self, key: &FetchKey, cancel: &CancellationToken) -> Fetched {
        exponential_backoff(&self.config, Fetched::GaveUp, |attempt| async move {
            if !self.connectivity.wait_until_reachable(cancel).await {
                return Err(anyhow!("cancelled while offline"));
            }

            let fetched = match key {
                FetchKey::Page(query) => self.api.fetch_page(query).await,
                FetchKey::Item { kind, id } => {
                    self.api.fetch_item(*kind, id).await.map(|item| vec![item])
                }
            };
            // Retried all the same; the server may just be mid-deploy.
            let items = fetched.map_err(|err| {
                if !err.is_transient() {
                    log_warn!("{key} rejected on attempt {attempt}: {err}");
                }
                err
            })?;

            save_items(self.store.as_ref(), items.clone())
                .await
                .with_context(|| format!("failed to persist {key}"))?;

            log_debug!("fetched {key} ({} items) on attempt {attempt}", items.len());
            Ok::<_, anyhow::Error>(Fetched::Fresh(items))
        })
        .await
    }
}
