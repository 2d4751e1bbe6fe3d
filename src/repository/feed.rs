use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{FeedItem, Query};
use crate::tiles::{tile_cache_loop, PageSource, TileCacheConfig};
use crate::window::{window_loop, FetchEvent, WindowConfig};

const EVENT_QUEUE_DEPTH: usize = 16;
const DELTA_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedConfig {
    pub window: WindowConfig,
    pub tiles: TileCacheConfig,
}

/// One scrolling list: a window stage feeding a tile cache, both bound to the
/// feed's cancellation scope. Dropping the feed cancels the scope.
pub struct Feed {
    events: mpsc::Sender<FetchEvent>,
    items: watch::Receiver<Vec<FeedItem>>,
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Feed {
    pub(crate) fn open(
        source: Arc<dyn PageSource>,
        config: FeedConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        let (events, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (delta_tx, delta_rx) = mpsc::channel(DELTA_QUEUE_DEPTH);
        let (items_tx, items) = watch::channel(Vec::new());

        let window = tokio::spawn(window_loop(
            event_rx,
            delta_tx,
            config.window,
            cancel_token.clone(),
        ));
        let tiles = tokio::spawn(tile_cache_loop(
            source,
            config.tiles,
            delta_rx,
            items_tx,
            cancel_token.clone(),
        ));

        Self {
            events,
            items,
            cancel_token,
            handles: vec![window, tiles],
        }
    }

    /// Start over at `query`, discarding every cached page. Used when filters
    /// change.
    pub async fn reset(&self, query: Query) -> Result<()> {
        self.send(FetchEvent::Reset(query)).await
    }

    /// Move the window pivot to `query`.
    pub async fn load_more(&self, query: Query) -> Result<()> {
        self.send(FetchEvent::LoadMore(query)).await
    }

    pub fn items(&self) -> watch::Receiver<Vec<FeedItem>> {
        self.items.clone()
    }

    pub async fn close(mut self) {
        self.cancel_token.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(err) = handle.await {
                log::error!("feed task failed: {err}");
            }
        }
    }

    async fn send(&self, event: FetchEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("feed is closed"))
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
